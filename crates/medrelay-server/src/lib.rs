//! Real-time hub relaying medication events between sensors and dashboards.

pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod serial;
pub mod server;

pub use config::{SerialConfig, ServerConfig};
pub use error::ServerError;
pub use registry::{BroadcastReport, ConnectionRegistry, Registration};
pub use relay::Relay;
pub use serial::{BridgeError, BridgeState, PortOpener, SerialBridge};
pub use server::{start, start_with_opener, ServerHandle};
