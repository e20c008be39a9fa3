use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::nullable;

/// Discriminator stored in every log record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[default]
    #[serde(rename = "medication_taken")]
    MedicationTaken,
}

/// One observed dose. Created once, appended to the event log and broadcast,
/// never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, deserialize_with = "nullable::string")]
    pub medication: String,
    pub timestamp: DateTime<Utc>,
    #[serde(
        rename = "deviceId",
        default,
        deserialize_with = "nullable::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub device_id: String,
    #[serde(rename = "serverTime")]
    pub server_time: DateTime<Utc>,
}

impl MedicationEvent {
    /// Event observed and received at the same instant, which is the case for
    /// everything the relay records itself.
    pub fn taken_now(medication: impl Into<String>, device_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::MedicationTaken,
            medication: medication.into(),
            timestamp: now,
            device_id: device_id.into(),
            server_time: now,
        }
    }
}
