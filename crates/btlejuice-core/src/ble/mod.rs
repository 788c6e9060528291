//! BLE capability interfaces
//!
//! The relay never talks to a Bluetooth stack directly. It drives a [`CentralBackend`]
//! (scan, connect, discover, read, write, subscribe against the real device) and the
//! emulator drives a [`PeripheralBackend`] (serve the cloned attribute table to the
//! intercepted central). `central` and `peripheral` hold the BlueZ implementations.

pub mod adv;
pub mod central;
pub mod peripheral;
pub mod table;

pub use central::BluerCentral;
pub use peripheral::BluerPeripheral;
pub use table::{AttributeTable, ServedAttribute};

use crate::error::Result;
use crate::gatt::{AttributeTree, Handle, Properties};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Which half of a scan an advertising payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Advertising,
    ScanResponse,
}

/// Asynchronous events raised by a central backend.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    Advertisement {
        address: String,
        name: Option<String>,
        rssi: Option<i16>,
        kind: ReportKind,
        data: Vec<u8>,
    },
    /// Notification or indication payload pushed by the remote device.
    Notification {
        address: String,
        service: String,
        characteristic: String,
        data: Vec<u8>,
    },
    Disconnected {
        address: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: String,
    pub start_handle: Handle,
    /// End of the service range, `None` when the stack does not report it.
    pub end_handle: Option<Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: String,
    pub properties: Properties,
    pub secure: Properties,
    pub start_handle: Handle,
    pub value_handle: Handle,
    pub end_handle: Option<Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub uuid: String,
    pub handle: Handle,
}

/// Opaque handle into a central backend's GATT session, kept by the session cache.
#[derive(Clone)]
pub struct PlatformBinding(Arc<dyn Any + Send + Sync>);

impl PlatformBinding {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for PlatformBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlatformBinding(..)")
    }
}

/// Raw ATT exchange with a connected device.
#[async_trait]
pub trait AttBearer: Send + Sync {
    /// Negotiated ATT MTU.
    fn mtu(&self) -> u16;

    /// Sends a request PDU and returns the response PDU (which may be an error response).
    async fn request(&self, pdu: Vec<u8>) -> Result<Vec<u8>>;

    /// Sends a PDU that expects no response.
    async fn command(&self, pdu: Vec<u8>) -> Result<()>;
}

/// Central role against the real device. UUID arguments are in canonical short form.
#[async_trait]
pub trait CentralBackend: Send + Sync {
    async fn start_scanning(&self) -> Result<()>;

    async fn stop_scanning(&self) -> Result<()>;

    async fn connect(&self, address: &str) -> Result<()>;

    async fn disconnect(&self, address: &str) -> Result<()>;

    async fn discover_services(&self, address: &str) -> Result<Vec<ServiceInfo>>;

    async fn discover_characteristics(
        &self,
        address: &str,
        service: &str,
    ) -> Result<Vec<CharacteristicInfo>>;

    async fn discover_descriptors(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<DescriptorInfo>>;

    async fn read(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        offset: u16,
    ) -> Result<Vec<u8>>;

    /// Enables or disables notifications; payloads arrive as [`CentralEvent::Notification`].
    async fn subscribe(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        enable: bool,
    ) -> Result<()>;

    async fn att_bearer(&self, address: &str) -> Result<Arc<dyn AttBearer>>;

    /// Snapshot of the attribute bindings discovered for `address`.
    async fn export_binding(&self, address: &str) -> Result<PlatformBinding>;

    /// Reinstalls bindings from an earlier session so no discovery is needed.
    async fn restore_binding(&self, address: &str, binding: &PlatformBinding) -> Result<()>;
}

/// ATT-level outcome the emulator hands back to the intercepted central.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    Unlikely,
    InvalidOffset,
    InProgress,
}

/// Requests and link events raised by a peripheral backend.
#[derive(Debug)]
pub enum PeripheralEvent {
    Accepted {
        address: String,
    },
    Disconnected {
        address: String,
    },
    Read {
        service: String,
        characteristic: String,
        offset: u16,
        reply: oneshot::Sender<Result<Vec<u8>, RequestError>>,
    },
    Write {
        service: String,
        characteristic: String,
        data: Vec<u8>,
        offset: u16,
        without_response: bool,
        reply: oneshot::Sender<Result<(), RequestError>>,
    },
    Subscribe {
        service: String,
        characteristic: String,
    },
    Unsubscribe {
        service: String,
        characteristic: String,
    },
}

/// Peripheral role towards the intercepted central.
#[async_trait]
pub trait PeripheralBackend: Send + Sync {
    /// Registers the tree with default, sequential handle allocation.
    fn set_services(&mut self, tree: &AttributeTree) -> Result<()>;

    /// Raw access to the served handle map.
    fn attribute_table_mut(&mut self) -> &mut AttributeTable;

    async fn start_advertising(&mut self, adv_data: &[u8], scan_data: Option<&[u8]>)
    -> Result<()>;

    /// Pushes a notification to the subscribed central, if any.
    async fn notify(&self, service: &str, characteristic: &str, data: Vec<u8>) -> Result<bool>;

    async fn stop(&mut self) -> Result<()>;
}
