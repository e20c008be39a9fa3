use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ids;

/// How a connected party reaches the relay.
///
/// The wire names are the ones the dashboard filters on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DeviceKind {
    /// Browser dashboard or any other passive observer.
    #[serde(rename = "web")]
    WebObserver,
    /// WiFi sensor that announced itself with `device_connected`.
    #[serde(rename = "esp8266")]
    SatelliteDevice,
    /// Microcontroller attached to the local serial port.
    #[serde(rename = "serial")]
    HardwareSerial,
}

/// Identity attached to one connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Device {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    #[serde(rename = "connectedAt")]
    pub connected_at: DateTime<Utc>,
}

impl Device {
    /// Identity given to a connection on accept, before any handshake.
    pub fn placeholder(ip: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            device_id: ids::client_device_id(now),
            ip: ip.into(),
            kind: DeviceKind::WebObserver,
            connected_at: now,
        }
    }

    /// Identity announced by a satellite device. Empty announcements fall back
    /// to a generated id and to the ip the connection was accepted from.
    pub fn announced(announced_id: &str, announced_ip: &str, previous_ip: &str, now: DateTime<Utc>) -> Self {
        let device_id = if announced_id.is_empty() {
            ids::generated_device_id(now)
        } else {
            announced_id.to_string()
        };
        let ip = if announced_ip.is_empty() { previous_ip } else { announced_ip };

        Self {
            device_id,
            ip: ip.to_string(),
            kind: DeviceKind::SatelliteDevice,
            connected_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
    }

    #[test]
    fn placeholder_is_web_observer() {
        let d = Device::placeholder("10.0.0.5:5123", at());
        assert_eq!(d.device_id, "client-1709281800");
        assert_eq!(d.kind, DeviceKind::WebObserver);
        assert_eq!(d.ip, "10.0.0.5:5123");
    }

    #[test]
    fn announced_keeps_given_identity() {
        let d = Device::announced("esp-kitchen", "192.168.1.40", "10.0.0.5:5123", at());
        assert_eq!(d.device_id, "esp-kitchen");
        assert_eq!(d.ip, "192.168.1.40");
        assert_eq!(d.kind, DeviceKind::SatelliteDevice);
    }

    #[test]
    fn announced_empty_falls_back() {
        let d = Device::announced("", "", "10.0.0.5:5123", at());
        assert_eq!(d.device_id, "device-1709281800");
        assert_eq!(d.ip, "10.0.0.5:5123");
    }

    #[test]
    fn wire_format_matches_dashboard() {
        let d = Device::announced("esp-1", "192.168.1.40", "", at());
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["deviceId"], "esp-1");
        assert_eq!(json["ip"], "192.168.1.40");
        assert_eq!(json["type"], "esp8266");
        assert_eq!(json["connectedAt"], "2024-03-01T08:30:00Z");
    }
}
