//! Shared data model for the medication event relay: device identities,
//! persisted medication events and the websocket wire messages.

pub mod device;
pub mod events;
pub mod ids;
pub mod messages;

mod nullable;

pub use device::{Device, DeviceKind};
pub use events::{EventKind, MedicationEvent};
pub use ids::ConnectionId;
pub use messages::{HardwareStatus, InboundCommand, InboundMessage, OutboundMessage};

/// Device id attributed to events read from the directly wired serial hardware.
pub const ARDUINO_DEVICE_ID: &str = "arduino";

/// Device id attributed to events injected through a `simulation` message.
pub const SIMULATION_DEVICE_ID: &str = "simulation";
