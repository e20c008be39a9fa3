//! Websocket wire messages.
//!
//! Inbound frames are parsed leniently: every field is optional and an unknown
//! `type` is not an error, so older sensor firmware keeps working. Only a frame
//! that is not JSON at all (or carries a known field with the wrong JSON type)
//! is rejected.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::events::MedicationEvent;
use crate::nullable;

/// Greeting text sent in every `connection_status` message.
pub const CONNECTION_GREETING: &str = "Connected to medication sensor server";

/// A frame received from a peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type", default, deserialize_with = "nullable::string")]
    pub kind: String,
    #[serde(rename = "deviceId", default, deserialize_with = "nullable::string")]
    pub device_id: String,
    #[serde(default, deserialize_with = "nullable::string")]
    pub ip: String,
    #[serde(default, deserialize_with = "nullable::string")]
    pub medication: String,
}

/// What an inbound frame asks the relay to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundCommand<'a> {
    DeviceConnected { device_id: &'a str, ip: &'a str },
    MedicationTaken { medication: &'a str },
    Simulation { medication: &'a str },
    Unknown(&'a str),
}

impl InboundMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn command(&self) -> InboundCommand<'_> {
        match self.kind.as_str() {
            "device_connected" => InboundCommand::DeviceConnected {
                device_id: &self.device_id,
                ip: &self.ip,
            },
            "medication_taken" => InboundCommand::MedicationTaken {
                medication: &self.medication,
            },
            "simulation" => InboundCommand::Simulation {
                medication: &self.medication,
            },
            other => InboundCommand::Unknown(other),
        }
    }
}

/// Whether the directly wired serial hardware is currently being read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareStatus {
    Connected,
    WifiOnly,
}

impl HardwareStatus {
    pub fn from_reading(reading: bool) -> Self {
        if reading {
            Self::Connected
        } else {
            Self::WifiOnly
        }
    }
}

/// A frame sent to peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ConnectionStatus {
        status: HardwareStatus,
        message: String,
        devices: Vec<Device>,
    },
    DeviceUpdate {
        devices: Vec<Device>,
    },
    MedicationTaken {
        medication: String,
        timestamp: String,
        #[serde(rename = "deviceId")]
        device_id: String,
    },
}

impl OutboundMessage {
    pub fn connection_status(status: HardwareStatus, devices: Vec<Device>) -> Self {
        Self::ConnectionStatus {
            status,
            message: CONNECTION_GREETING.to_string(),
            devices,
        }
    }

    pub fn medication_taken(event: &MedicationEvent) -> Self {
        Self::MedicationTaken {
            medication: event.medication.clone(),
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            device_id: event.device_id.clone(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionStatus { .. } => "connection_status",
            Self::DeviceUpdate { .. } => "device_update",
            Self::MedicationTaken { .. } => "medication_taken",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
