//! GATT data model shared by the proxy and the interception core

pub mod profile;
pub mod tree;
pub mod uuid;

pub use profile::DeviceProfile;
pub use tree::{AttributeTree, Characteristic, Descriptor, Handle, Properties, Service};
pub use self::uuid::{CCCD_UUID, USER_DESCRIPTION_UUID, normalize};
