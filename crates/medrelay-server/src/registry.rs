use std::collections::HashMap;

use chrono::Utc;
use medrelay_core::{ConnectionId, Device, OutboundMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One registered connection: its identity plus the sending half of its
/// outbound queue. Dropping the entry closes the queue, which ends the
/// connection's writer task and with it the socket.
struct Entry {
    device: Device,
    tx: mpsc::Sender<String>,
}

/// Handed back to the connection task on register.
pub struct Registration {
    pub id: ConnectionId,
    pub device_id: String,
    pub rx: mpsc::Receiver<String>,
}

/// Outcome of one fan-out pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

/// Every open connection and the device it speaks for.
///
/// One mutex guards the whole map. Snapshots and broadcasts both run under it,
/// so a device list sent to observers is always the registry state at a single
/// instant. Delivery is a non-blocking enqueue, so no socket I/O happens while
/// the lock is held.
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, Entry>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new connection under a placeholder web-observer identity.
    pub fn register(&self, ip: impl Into<String>) -> Registration {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let device = Device::placeholder(ip, Utc::now());
        let device_id = device.device_id.clone();
        self.entries.lock().insert(id, Entry { device, tx });
        Registration { id, device_id, rx }
    }

    /// Replace the identity of a connection with the one it announced.
    /// Returns `None` if the connection is no longer registered.
    pub fn identify(&self, id: ConnectionId, announced_id: &str, announced_ip: &str) -> Option<Device> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        entry.device = Device::announced(announced_id, announced_ip, &entry.device.ip, Utc::now());
        Some(entry.device.clone())
    }

    /// Remove a connection. Returns its last identity, or `None` if it was
    /// already gone.
    pub fn unregister(&self, id: ConnectionId) -> Option<Device> {
        self.entries.lock().remove(&id).map(|entry| entry.device)
    }

    pub fn device_id(&self, id: ConnectionId) -> Option<String> {
        self.entries.lock().get(&id).map(|entry| entry.device.device_id.clone())
    }

    /// Copy of every registered device. Order is unspecified.
    pub fn snapshot(&self) -> Vec<Device> {
        self.entries.lock().values().map(|entry| entry.device.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Queue one message for every registered connection. A connection whose
    /// queue is closed or full is dropped from the registry in the same pass.
    pub fn broadcast(&self, message: &OutboundMessage) -> BroadcastReport {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(kind = message.type_name(), error = %e, "failed to serialize broadcast");
                return BroadcastReport::default();
            }
        };
        let mut entries = self.entries.lock();
        fan_out(&mut entries, &text, message.type_name())
    }

    /// Broadcast a `device_update` whose device list is taken under the same
    /// lock acquisition as the fan-out.
    pub fn broadcast_device_update(&self) -> BroadcastReport {
        let mut entries = self.entries.lock();
        let devices = entries.values().map(|entry| entry.device.clone()).collect();
        let message = OutboundMessage::DeviceUpdate { devices };
        match message.to_json() {
            Ok(text) => fan_out(&mut entries, &text, message.type_name()),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize device update");
                BroadcastReport::default()
            }
        }
    }
}

fn fan_out(entries: &mut HashMap<ConnectionId, Entry>, text: &str, kind: &'static str) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    entries.retain(|id, entry| match entry.tx.try_send(text.to_owned()) {
        Ok(()) => {
            report.delivered += 1;
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(
                connection_id = %id,
                device_id = %entry.device.device_id,
                kind,
                "send queue full, dropping connection"
            );
            report.pruned += 1;
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::info!(
                connection_id = %id,
                device_id = %entry.device.device_id,
                kind,
                "connection closed, dropping from registry"
            );
            report.pruned += 1;
            false
        }
    });
    report
}
