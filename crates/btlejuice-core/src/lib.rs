//! BtleJuice core library
//!
//! A BLE GATT man-in-the-middle: a relay proxy drives the real peripheral as a central,
//! and an interception side clones that peripheral locally so a real central talks to the
//! clone while every operation is relayed, observed and optionally edited.
//!
//! # Modules
//!
//! - **gatt**: attribute tree and device profile data model
//! - **ble**: capability traits plus the BlueZ central and peripheral backends
//! - **proxy**: discovery, session cache, long writes and the relay engine
//! - **emulator**: the cloned peripheral and its handle patcher
//! - **intercept**: forward / transform / manual-edit pipeline
//! - **workflow**: interception session gluing proxy client, emulator and pipeline
//!
//! # Relay side
//!
//! ```ignore
//! use btlejuice_core::{BluerCentral, RelayConfig, RelayEngine};
//!
//! let (central, central_events) = BluerCentral::new(None, 23).await?;
//! let engine = RelayEngine::new(Arc::new(central), RelayConfig::default());
//! tokio::spawn(engine.run(commands, central_events));
//! ```
//!
//! # Interception side
//!
//! ```ignore
//! use btlejuice_core::{BluerPeripheral, FakeDevice, InterceptSession, ProxyClient};
//!
//! let client = ProxyClient::connect("ws://127.0.0.1:8000").await?;
//! let (peripheral, requests) = BluerPeripheral::new(None).await?;
//! let fake = FakeDevice::new(Box::new(peripheral), requests, true);
//! InterceptSession::new(client, fake, pipeline, log, options, events).run(operator).await?;
//! ```

pub mod ble;
pub mod client;
pub mod config;
pub mod emulator;
pub mod error;
pub mod gatt;
pub mod intercept;
pub mod logging;
pub mod proxy;
pub mod workflow;

pub use ble::{
    AttBearer, BluerCentral, BluerPeripheral, CentralBackend, CentralEvent, PeripheralBackend,
    PeripheralEvent, PlatformBinding,
};
pub use client::ProxyClient;
pub use config::AppSettings;
pub use emulator::{FakeDevice, FakeRequest, HandlePatcher};
pub use error::{ProxyError, Result};
pub use gatt::{AttributeTree, DeviceProfile};
pub use intercept::{EditOrder, Hook, InterceptionPipeline, Mode, PendingEdit, Resolution};
pub use logging::TransactionLog;
pub use proxy::{
    ClientRequest, ConnectionState, EngineCommand, ProxyEvent, RelayConfig, RelayEngine,
    SessionCache,
};
pub use workflow::{InterceptEvent, InterceptOptions, InterceptSession, OperatorCommand};
