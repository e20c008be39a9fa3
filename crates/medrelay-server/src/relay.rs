use std::sync::Arc;

use chrono::Utc;
use medrelay_core::{
    ConnectionId, Device, HardwareStatus, InboundCommand, InboundMessage, MedicationEvent, OutboundMessage,
    SIMULATION_DEVICE_ID,
};
use medrelay_store::EventLog;
use tokio::sync::watch;

use crate::registry::{ConnectionRegistry, Registration};
use crate::serial::BridgeState;

/// The relay's protocol state: who is connected, where events are persisted,
/// and whether the serial hardware is live.
///
/// Every connection task and the serial bridge share one `Relay`. All event
/// sources go through [`Relay::record_medication`], so every event is both
/// logged and broadcast. Concurrent events are ordered independently by the
/// log and by the broadcast, so the two orders may differ.
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    log: Arc<EventLog>,
    hardware: watch::Receiver<BridgeState>,
}

impl Relay {
    pub fn new(registry: Arc<ConnectionRegistry>, log: Arc<EventLog>, hardware: watch::Receiver<BridgeState>) -> Self {
        Self { registry, log, hardware }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn hardware_connected(&self) -> bool {
        *self.hardware.borrow() == BridgeState::Reading
    }

    pub fn hardware_status(&self) -> HardwareStatus {
        HardwareStatus::from_reading(self.hardware_connected())
    }

    /// Register a freshly accepted connection and build the greeting it must
    /// receive before anything else.
    pub fn accept(&self, ip: impl Into<String>) -> (Registration, OutboundMessage) {
        let registration = self.registry.register(ip);
        let greeting = OutboundMessage::connection_status(self.hardware_status(), self.registry.snapshot());
        (registration, greeting)
    }

    /// Drop a connection that never got its greeting. Nobody was told about
    /// it, so nobody is told it left.
    pub fn abandon(&self, id: ConnectionId) {
        self.registry.unregister(id);
    }

    /// Handle one raw frame. Returns `false` when the frame is malformed and
    /// the connection must be closed.
    pub fn handle_frame(&self, id: ConnectionId, raw: &[u8]) -> bool {
        match InboundMessage::parse(raw) {
            Ok(message) => {
                self.handle_message(id, &message);
                true
            }
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "malformed frame, closing connection");
                false
            }
        }
    }

    pub fn handle_message(&self, id: ConnectionId, message: &InboundMessage) {
        match message.command() {
            InboundCommand::DeviceConnected { device_id, ip } => {
                let Some(device) = self.registry.identify(id, device_id, ip) else {
                    tracing::debug!(connection_id = %id, "identify for a connection that is gone");
                    return;
                };
                tracing::info!(
                    connection_id = %id,
                    device_id = %device.device_id,
                    ip = %device.ip,
                    "device registered"
                );
                self.registry.broadcast_device_update();
            }
            InboundCommand::MedicationTaken { medication } => {
                let device_id = self.registry.device_id(id).unwrap_or_default();
                self.record_medication(medication, &device_id);
            }
            InboundCommand::Simulation { medication } => {
                self.record_medication(medication, SIMULATION_DEVICE_ID);
            }
            InboundCommand::Unknown(kind) => {
                tracing::debug!(connection_id = %id, kind, "ignoring unrecognized message");
            }
        }
    }

    /// Persist and broadcast one dose. A failed append is logged and the
    /// broadcast still goes out.
    ///
    /// The append is a blocking write of one short line, done inline on the
    /// calling task. Events arrive at human pace, and handling it here keeps
    /// each event in the log before its broadcast is queued.
    pub fn record_medication(&self, medication: &str, device_id: &str) -> MedicationEvent {
        let event = MedicationEvent::taken_now(medication, device_id, Utc::now());

        if let Err(e) = self.log.append(&event) {
            tracing::error!(
                path = %self.log.path().display(),
                device_id,
                error = %e,
                "failed to persist medication event"
            );
        }

        let report = self.registry.broadcast(&OutboundMessage::medication_taken(&event));
        tracing::info!(
            device_id,
            medication,
            delivered = report.delivered,
            pruned = report.pruned,
            "medication taken"
        );
        event
    }

    /// Tear down a connection. Remaining peers get a fresh device list if the
    /// connection was still registered.
    pub fn close(&self, id: ConnectionId) -> Option<Device> {
        let device = self.registry.unregister(id)?;
        tracing::info!(connection_id = %id, device_id = %device.device_id, "device disconnected");
        self.registry.broadcast_device_update();
        Some(device)
    }
}
