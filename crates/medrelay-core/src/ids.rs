use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle for one live websocket connection.
///
/// Device ids are chosen by peers and may collide, so the registry keys on
/// this instead.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Placeholder id given to a connection before it announces itself.
pub fn client_device_id(at: DateTime<Utc>) -> String {
    format!("client-{}", at.timestamp())
}

/// Id given to a satellite device that announced itself without one.
pub fn generated_device_id(at: DateTime<Utc>) -> String {
    format!("device-{}", at.timestamp())
}
