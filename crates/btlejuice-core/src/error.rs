//! Relay error taxonomy
//!
//! Only a failure to bind the controlling channel is fatal to the process; every variant
//! here is reported to the requester or logged and the relay keeps running.

use std::time::Duration;

/// Errors raised by the relay engine, its collaborators and the capability backends.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    #[error("Connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("Attribute discovery did not complete within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("Discovery failed for {target}: {reason}")]
    Discovery { target: String, reason: String },

    #[error("ATT protocol error during write: {0}")]
    WriteProtocol(String),

    #[error("No controlling client attached")]
    ChannelUnavailable,

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Relay is not forwarding")]
    NotForwarding,

    #[error("Unknown service {0}")]
    UnknownService(String),

    #[error("Unknown characteristic {service}:{characteristic}")]
    UnknownCharacteristic {
        service: String,
        characteristic: String,
    },

    #[error("A {op} is already pending on {service}:{characteristic}")]
    Busy {
        op: &'static str,
        service: String,
        characteristic: String,
    },

    #[error("Invalid attribute tree: {0}")]
    InvalidTree(String),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Platform binding does not belong to this backend")]
    ForeignBinding,

    #[error("BlueZ error: {0}")]
    Bluez(#[from] bluer::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
