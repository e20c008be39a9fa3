use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use medrelay_core::MedicationEvent;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::error::StoreError;

/// Append-only JSON-lines file holding every recorded medication event.
///
/// Appends are serialized so concurrent writers never interleave partial
/// lines. Reads take no lock and see whatever complete lines exist.
pub struct EventLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl EventLog {
    /// Point at a log file. Nothing is created until the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single line, creating the file and its parent
    /// directory on first use.
    #[instrument(skip(self, event), fields(device_id = %event.device_id))]
    pub fn append(&self, event: &MedicationEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.append_lock.lock();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        debug!(path = %self.path.display(), "event appended");
        Ok(())
    }

    /// Read every event in append order. Lines that do not parse (for example
    /// a write cut short by a crash) are skipped. A missing file is an empty
    /// history.
    pub fn read_all(&self) -> Result<Vec<MedicationEvent>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let text = String::from_utf8_lossy(&bytes);
        let mut events = Vec::new();
        let mut skipped = 0usize;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MedicationEvent>(line) {
                Ok(event) => events.push(event),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, path = %self.path.display(), "skipped unreadable log lines");
        }
        Ok(events)
    }
}
