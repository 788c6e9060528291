//! BLE GATT relay (proxy side)
//!
//! - [`engine`]: connection state machine and client-facing operations
//! - [`discovery`]: recursive attribute discovery with its completion tracker
//! - [`cache`]: completed discoveries per address
//! - [`long_write`]: MTU-bounded writes over a raw ATT bearer
//! - [`messages`]: the client wire protocol

pub mod cache;
pub mod discovery;
pub mod engine;
pub mod long_write;
pub mod messages;

pub use cache::{SessionCache, SessionCacheEntry};
pub use discovery::{DiscoverySession, DiscoveryTracker};
pub use engine::{EngineCommand, RelayConfig, RelayEngine};
pub use long_write::LongWriteCoordinator;
pub use messages::{ClientRequest, ConnectionState, ProxyEvent};
