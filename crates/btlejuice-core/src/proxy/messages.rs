//! Messages exchanged between the proxy and its controlling client
//!
//! One JSON object per WebSocket text frame, tagged by `"type"`. Byte payloads are hex
//! strings. Response messages carry an `error` string when the operation failed.

use crate::gatt::DeviceProfile;
use crate::gatt::profile::hex_bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of the relay, reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Acquiring,
    Connecting,
    Discovering,
    Forwarding,
    Stopping,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Acquiring => "acquiring",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Forwarding => "forwarding",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_keep_handles() -> bool {
    true
}

/// Client to proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Target {
        address: String,
        #[serde(default = "default_keep_handles")]
        keep_handles: bool,
    },
    ScanDevices,
    Stop,
    Status,
    BleRead {
        service: String,
        characteristic: String,
        #[serde(default)]
        offset: u16,
    },
    BleWrite {
        service: String,
        characteristic: String,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
        #[serde(default)]
        without_response: bool,
    },
    BleNotify {
        service: String,
        characteristic: String,
        enable: bool,
    },
}

/// Proxy to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    Hello,
    Discover {
        address: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    Profile {
        profile: DeviceProfile,
    },
    Ready {
        ok: bool,
    },
    BleReadResp {
        service: String,
        characteristic: String,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BleWriteResp {
        service: String,
        characteristic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BleNotifyResp {
        service: String,
        characteristic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BleData {
        service: String,
        characteristic: String,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    Status {
        state: ConnectionState,
    },
    Stopped,
    #[serde(rename = "device.disconnect")]
    DeviceDisconnect {
        address: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_names() {
        let request: ClientRequest = serde_json::from_value(json!({
            "type": "ble_write",
            "service": "180A",
            "characteristic": "2A29",
            "data": "01ff"
        }))
        .unwrap();
        assert_eq!(
            request,
            ClientRequest::BleWrite {
                service: "180A".to_string(),
                characteristic: "2A29".to_string(),
                data: vec![0x01, 0xff],
                without_response: false,
            }
        );

        let target: ClientRequest =
            serde_json::from_str(r#"{"type":"target","address":"54:4A:16:6D:3D:23"}"#).unwrap();
        assert!(matches!(target, ClientRequest::Target { keep_handles: true, .. }));

        let scan: ClientRequest = serde_json::from_str(r#"{"type":"scan_devices"}"#).unwrap();
        assert_eq!(scan, ClientRequest::ScanDevices);
    }

    #[test]
    fn test_event_wire_names() {
        let event = ProxyEvent::DeviceDisconnect {
            address: "54:4a:16:6d:3d:23".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "device.disconnect", "address": "54:4a:16:6d:3d:23"})
        );

        let status = ProxyEvent::Status {
            state: ConnectionState::Forwarding,
        };
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"type":"status","state":"forwarding"}"#
        );
    }

    #[test]
    fn test_error_field_is_optional() {
        let ok = ProxyEvent::BleWriteResp {
            service: "180a".to_string(),
            characteristic: "2a29".to_string(),
            error: None,
        };
        let text = serde_json::to_string(&ok).unwrap();
        assert!(!text.contains("error"));

        let failed: ProxyEvent = serde_json::from_str(
            r#"{"type":"ble_notify_resp","service":"180a","characteristic":"2a29","error":"boom"}"#,
        )
        .unwrap();
        assert!(matches!(failed, ProxyEvent::BleNotifyResp { error: Some(_), .. }));
    }
}
