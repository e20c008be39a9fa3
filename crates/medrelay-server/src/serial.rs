//! Bridge from the directly wired microcontroller to the relay.
//!
//! The bridge alternates between two states. While `Unavailable` it tries to
//! open the port once per retry interval. While `Reading` it performs bounded
//! blocking reads on the blocking pool, frames the bytes into lines and turns
//! every `MEDICATION_TAKEN[:name]` line into an event on the relay's normal
//! event path. Any read error drops back to `Unavailable`.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use medrelay_core::ARDUINO_DEVICE_ID;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SerialConfig;
use crate::relay::Relay;

/// Marker the firmware prints when a dose is detected.
pub const MEDICATION_MARKER: &str = "MEDICATION_TAKEN";

const READ_CHUNK: usize = 128;
const MAX_LINE: usize = 1024;

/// Blocking byte source handed out by a [`PortOpener`].
pub type PortReader = Box<dyn Read + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    /// No port open. The normal state when no hardware is attached.
    Unavailable,
    /// Port open and being read.
    Reading,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("cannot open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("serial read failed: {0}")]
    Read(#[from] io::Error),

    #[error("serial port closed")]
    Closed,
}

impl BridgeError {
    /// A read that simply saw no data within the port timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Read(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock))
    }
}

/// Opens the hardware port. Called from the blocking pool.
pub trait PortOpener: Send + Sync + 'static {
    fn open(&self) -> Result<PortReader, BridgeError>;

    /// Human readable port name for logs.
    fn describe(&self) -> String;
}

/// [`PortOpener`] backed by a real serial device.
pub struct SerialPortOpener {
    port_name: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialPortOpener {
    /// `None` when no port is configured.
    pub fn from_config(config: &SerialConfig) -> Option<Self> {
        let port_name = config.port_name.clone().filter(|name| !name.trim().is_empty())?;
        Some(Self {
            port_name,
            baud_rate: config.baud_rate,
            read_timeout: config.read_timeout,
        })
    }
}

struct SerialReader(Box<dyn serialport::SerialPort>);

impl Read for SerialReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self) -> Result<PortReader, BridgeError> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| BridgeError::Open {
                port: self.port_name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(SerialReader(port)))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port_name, self.baud_rate)
    }
}

/// Extract the medication name from one line of serial output.
///
/// Returns `None` when the line carries no marker. The name is the first
/// `:`-separated token after the first colon, and empty when there is none.
pub fn parse_marker(line: &str) -> Option<String> {
    if !line.contains(MEDICATION_MARKER) {
        return None;
    }
    let name = line.split(':').nth(1).map(str::trim).unwrap_or_default();
    Some(name.to_string())
}

/// Splits a byte stream into lines. `\r\n` and `\n` both terminate a line.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    /// Feed bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&raw));
        }
        if self.buf.len() > MAX_LINE {
            if let Some(line) = self.flush() {
                lines.push(line);
            }
        }
        lines
    }

    /// Take whatever partial line is buffered. Firmware that never sends a
    /// newline is handled by flushing whenever the port goes quiet.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Background task owning the serial state machine.
pub struct SerialBridge {
    opener: Arc<dyn PortOpener>,
    relay: Arc<Relay>,
    state_tx: watch::Sender<BridgeState>,
    retry_interval: Duration,
}

impl SerialBridge {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        relay: Arc<Relay>,
        state_tx: watch::Sender<BridgeState>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            opener,
            relay,
            state_tx,
            retry_interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let port = self.opener.describe();
        let mut reported_absent = false;

        loop {
            let opener = Arc::clone(&self.opener);
            let opened = tokio::select! {
                () = cancel.cancelled() => break,
                res = tokio::task::spawn_blocking(move || opener.open()) => res,
            };

            match opened {
                Ok(Ok(reader)) => {
                    tracing::info!(port = %port, "serial port connected");
                    reported_absent = false;
                    self.set_state(BridgeState::Reading);
                    let outcome = self.read_until_error(reader, &cancel).await;
                    self.set_state(BridgeState::Unavailable);
                    match outcome {
                        Ok(()) => break,
                        Err(e) => tracing::warn!(port = %port, error = %e, "serial port lost, retrying"),
                    }
                }
                Ok(Err(e)) => {
                    if reported_absent {
                        tracing::debug!(port = %port, error = %e, "serial port still unavailable");
                    } else {
                        tracing::warn!(port = %port, error = %e, "serial port unavailable, running WiFi-only until it appears");
                        reported_absent = true;
                    }
                }
                Err(e) => tracing::error!(port = %port, error = %e, "serial open task failed"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }

        self.set_state(BridgeState::Unavailable);
        tracing::debug!(port = %port, "serial bridge stopped");
    }

    /// Read until the port fails. `Ok(())` means the bridge was cancelled.
    async fn read_until_error(&self, reader: PortReader, cancel: &CancellationToken) -> Result<(), BridgeError> {
        let mut framer = LineFramer::default();
        let mut reader = reader;

        loop {
            let task = tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; READ_CHUNK];
                let res = reader.read(&mut buf).map(|n| buf[..n].to_vec());
                (reader, res)
            });

            let (returned, res) = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                joined = task => joined.map_err(|e| BridgeError::Read(io::Error::other(e)))?,
            };
            reader = returned;

            match res.map_err(BridgeError::from) {
                Ok(bytes) if bytes.is_empty() => return Err(BridgeError::Closed),
                Ok(bytes) => {
                    for line in framer.push(&bytes) {
                        self.handle_line(&line);
                    }
                }
                Err(e) if e.is_timeout() => {
                    if let Some(line) = framer.flush() {
                        self.handle_line(&line);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        tracing::debug!(line, "received from serial");
        if let Some(medication) = parse_marker(line) {
            self.relay.record_medication(&medication, ARDUINO_DEVICE_ID);
        }
    }

    fn set_state(&self, state: BridgeState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;

    use medrelay_store::EventLog;
    use parking_lot::Mutex;

    use super::*;
    use crate::registry::ConnectionRegistry;

    /// Hands out scripted readers, one per successful open.
    struct ScriptedOpener {
        sessions: Mutex<VecDeque<PortReader>>,
        opens: Mutex<usize>,
    }

    impl ScriptedOpener {
        fn new(sessions: Vec<PortReader>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                opens: Mutex::new(0),
            }
        }
    }

    impl PortOpener for ScriptedOpener {
        fn open(&self) -> Result<PortReader, BridgeError> {
            *self.opens.lock() += 1;
            self.sessions.lock().pop_front().ok_or_else(|| BridgeError::Open {
                port: "mock".into(),
                reason: "no such device".into(),
            })
        }

        fn describe(&self) -> String {
            "mock".into()
        }
    }

    /// Port that stays open but never produces data.
    struct IdlePort;

    impl Read for IdlePort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
        }
    }

    /// Yields its bytes, then goes quiet with timeouts instead of closing.
    struct QuietAfter(Cursor<Vec<u8>>);

    impl Read for QuietAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf)? {
                0 => {
                    std::thread::sleep(Duration::from_millis(5));
                    Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
                }
                n => Ok(n),
            }
        }
    }

    fn relay_fixture() -> (Arc<Relay>, watch::Sender<BridgeState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (state_tx, state_rx) = watch::channel(BridgeState::Unavailable);
        let relay = Arc::new(Relay::new(
            Arc::new(ConnectionRegistry::new(32)),
            Arc::new(EventLog::new(dir.path().join("log.txt"))),
            state_rx,
        ));
        (relay, state_tx, dir)
    }

    async fn next_json(rx: &mut tokio::sync::mpsc::Receiver<String>) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for broadcast")
            .expect("queue closed");
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn marker_with_name() {
        assert_eq!(parse_marker("MEDICATION_TAKEN:aspirin"), Some("aspirin".into()));
        assert_eq!(parse_marker("MEDICATION_TAKEN: aspirin \r"), Some("aspirin".into()));
    }

    #[test]
    fn marker_without_colon_has_empty_name() {
        assert_eq!(parse_marker("MEDICATION_TAKEN"), Some(String::new()));
        assert_eq!(parse_marker("MEDICATION_TAKEN:"), Some(String::new()));
    }

    #[test]
    fn name_is_first_token_after_colon() {
        assert_eq!(parse_marker("MEDICATION_TAKEN:aspirin:500mg"), Some("aspirin".into()));
    }

    #[test]
    fn lines_without_marker_are_ignored() {
        assert_eq!(parse_marker("SENSOR_READY"), None);
        assert_eq!(parse_marker("weight:12.5"), None);
    }

    #[test]
    fn framer_splits_lines() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"MEDICATION_TA").is_empty());
        assert_eq!(framer.push(b"KEN:aspirin\r\nREADY\nMED"), vec!["MEDICATION_TAKEN:aspirin", "READY"]);
        assert_eq!(framer.flush(), Some("MED".into()));
        assert_eq!(framer.flush(), None);
    }

    #[test]
    fn framer_bounds_unterminated_input() {
        let mut framer = LineFramer::default();
        let lines = framer.push(&vec![b'x'; MAX_LINE + 1]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE + 1);
        assert_eq!(framer.flush(), None);
    }

    #[test]
    fn timeout_classification() {
        assert!(BridgeError::Read(io::Error::new(io::ErrorKind::TimedOut, "t")).is_timeout());
        assert!(!BridgeError::Read(io::Error::new(io::ErrorKind::BrokenPipe, "p")).is_timeout());
        assert!(!BridgeError::Closed.is_timeout());
    }

    #[test]
    fn opener_requires_port_name() {
        assert!(SerialPortOpener::from_config(&SerialConfig::default()).is_none());
        let config = SerialConfig {
            port_name: Some("/dev/ttyACM0".into()),
            ..SerialConfig::default()
        };
        assert_eq!(SerialPortOpener::from_config(&config).unwrap().describe(), "/dev/ttyACM0@9600");
    }

    #[tokio::test]
    async fn markers_become_arduino_events() {
        let (relay, state_tx, _dir) = relay_fixture();
        let mut observer = relay.registry().register("10.0.0.9:1");

        let data = b"READY\r\nMEDICATION_TAKEN:aspirin\r\nMEDICATION_TAKEN\r\n".to_vec();
        let opener = Arc::new(ScriptedOpener::new(vec![Box::new(QuietAfter(Cursor::new(data))) as PortReader]));
        let cancel = CancellationToken::new();
        let handle = SerialBridge::new(opener, Arc::clone(&relay), state_tx, Duration::from_millis(10)).spawn(cancel.clone());

        let first = next_json(&mut observer.rx).await;
        assert_eq!(first["type"], "medication_taken");
        assert_eq!(first["medication"], "aspirin");
        assert_eq!(first["deviceId"], "arduino");

        let second = next_json(&mut observer.rx).await;
        assert_eq!(second["medication"], "");
        assert_eq!(second["deviceId"], "arduino");

        cancel.cancel();
        handle.await.unwrap();

        let logged = relay.event_log().read_all().unwrap();
        assert_eq!(logged.len(), 2);
        assert!(logged.iter().all(|e| e.device_id == "arduino"));
        assert_eq!(logged[0].medication, "aspirin");
    }

    #[tokio::test]
    async fn unterminated_output_is_flushed_when_port_goes_quiet() {
        let (relay, state_tx, _dir) = relay_fixture();
        let mut observer = relay.registry().register("10.0.0.9:1");

        let opener = Arc::new(ScriptedOpener::new(vec![Box::new(QuietAfter(Cursor::new(
            b"MEDICATION_TAKEN:vitamin_d".to_vec(),
        ))) as PortReader]));
        let cancel = CancellationToken::new();
        let handle = SerialBridge::new(opener, Arc::clone(&relay), state_tx, Duration::from_millis(10)).spawn(cancel.clone());

        let msg = next_json(&mut observer.rx).await;
        assert_eq!(msg["medication"], "vitamin_d");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reports_reading_while_port_is_open() {
        let (relay, state_tx, _dir) = relay_fixture();
        let mut state_rx = state_tx.subscribe();
        let opener = Arc::new(ScriptedOpener::new(vec![Box::new(IdlePort) as PortReader]));
        let cancel = CancellationToken::new();
        let handle = SerialBridge::new(opener, Arc::clone(&relay), state_tx, Duration::from_millis(10)).spawn(cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), state_rx.wait_for(|s| *s == BridgeState::Reading))
            .await
            .unwrap()
            .unwrap();
        assert!(relay.hardware_connected());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(*state_rx.borrow(), BridgeState::Unavailable);
        assert!(!relay.hardware_connected());
    }

    #[tokio::test]
    async fn reconnects_after_port_loss() {
        let (relay, state_tx, _dir) = relay_fixture();
        let mut observer = relay.registry().register("10.0.0.9:1");

        // First session closes right after one event, the second one stays up.
        let opener = Arc::new(ScriptedOpener::new(vec![
            Box::new(Cursor::new(b"MEDICATION_TAKEN:first\n".to_vec())) as PortReader,
            Box::new(QuietAfter(Cursor::new(b"MEDICATION_TAKEN:second\n".to_vec()))),
        ]));
        let cancel = CancellationToken::new();
        let handle = SerialBridge::new(
            Arc::clone(&opener) as Arc<dyn PortOpener>,
            Arc::clone(&relay),
            state_tx,
            Duration::from_millis(10),
        )
        .spawn(cancel.clone());

        assert_eq!(next_json(&mut observer.rx).await["medication"], "first");
        assert_eq!(next_json(&mut observer.rx).await["medication"], "second");
        assert_eq!(*opener.opens.lock(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn absent_hardware_keeps_retrying() {
        let (relay, state_tx, _dir) = relay_fixture();
        let opener = Arc::new(ScriptedOpener::new(Vec::new()));
        let cancel = CancellationToken::new();
        let handle = SerialBridge::new(
            Arc::clone(&opener) as Arc<dyn PortOpener>,
            Arc::clone(&relay),
            state_tx,
            Duration::from_millis(10),
        )
        .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(*opener.opens.lock() >= 2);
        assert!(!relay.hardware_connected());

        cancel.cancel();
        handle.await.unwrap();
    }
}
