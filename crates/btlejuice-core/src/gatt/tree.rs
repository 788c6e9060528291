//! Attribute tree of a discovered device
//!
//! Services, characteristics and descriptors with the handle numbers the real device
//! uses. A tree is only ever built through [`AttributeTree::new`] (or deserialized,
//! which goes through the same check), so holding one means the handle layout is sane:
//! handles strictly increase across the whole tree, and every characteristic value
//! handle sits after its declaration and within the characteristic's range.

use crate::error::{ProxyError, Result};
use crate::gatt::uuid::normalize;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Handle = u16;

/// Characteristic property bits as carried in the characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Properties(u8);

impl Properties {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    const NAMES: [(u8, &'static str); 5] = [
        (Self::READ, "read"),
        (Self::WRITE_WITHOUT_RESPONSE, "writeWithoutResponse"),
        (Self::WRITE, "write"),
        (Self::NOTIFY, "notify"),
        (Self::INDICATE, "indicate"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x3e)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }

    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn can_notify(self) -> bool {
        self.contains(Self::NOTIFY) || self.contains(Self::INDICATE)
    }

    /// Property names in declaration-bit order, as remote stacks report them.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl From<Vec<String>> for Properties {
    fn from(names: Vec<String>) -> Self {
        // Names outside the relayed set (broadcast, extendedProperties, ...) are dropped.
        names.iter().fold(Self::empty(), |props, name| {
            match Self::NAMES.iter().find(|(_, n)| n == name) {
                Some((bit, _)) => props.with(*bit),
                None => props,
            }
        })
    }
}

impl From<Properties> for Vec<String> {
    fn from(props: Properties) -> Self {
        props.names().into_iter().map(str::to_string).collect()
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join("|"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: String,
    pub handle: Handle,
    #[serde(default, with = "crate::gatt::profile::hex_opt")]
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Characteristic {
    pub uuid: String,
    pub properties: Properties,
    /// Properties that required an encrypted link on the original device.
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub secure: Properties,
    #[serde(default)]
    pub descriptors: Vec<Descriptor>,
    pub start_handle: Handle,
    pub value_handle: Handle,
    pub end_handle: Handle,
}

impl Characteristic {
    pub fn descriptor(&self, uuid: &str) -> Option<&Descriptor> {
        let uuid = normalize(uuid);
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub uuid: String,
    pub start_handle: Handle,
    pub end_handle: Handle,
    #[serde(default)]
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, uuid: &str) -> Option<&Characteristic> {
        let uuid = normalize(uuid);
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Immutable description of a device's GATT database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Service>", into = "Vec<Service>")]
pub struct AttributeTree {
    services: Vec<Service>,
}

impl AttributeTree {
    /// Builds a tree after normalizing every UUID and checking the handle layout.
    pub fn new(mut services: Vec<Service>) -> Result<Self> {
        for service in &mut services {
            service.uuid = normalize(&service.uuid);
            for characteristic in &mut service.characteristics {
                characteristic.uuid = normalize(&characteristic.uuid);
                for descriptor in &mut characteristic.descriptors {
                    descriptor.uuid = normalize(&descriptor.uuid);
                }
            }
        }
        validate(&services)?;
        Ok(Self { services })
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, uuid: &str) -> Option<&Service> {
        let uuid = normalize(uuid);
        self.services.iter().find(|s| s.uuid == uuid)
    }

    pub fn characteristic(&self, service: &str, characteristic: &str) -> Option<&Characteristic> {
        self.service(service)?.characteristic(characteristic)
    }

    /// Every attribute handle of the tree, in table order.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles = Vec::new();
        for service in &self.services {
            handles.push(service.start_handle);
            for characteristic in &service.characteristics {
                handles.push(characteristic.start_handle);
                handles.push(characteristic.value_handle);
                handles.extend(characteristic.descriptors.iter().map(|d| d.handle));
            }
        }
        handles
    }
}

impl TryFrom<Vec<Service>> for AttributeTree {
    type Error = ProxyError;

    fn try_from(services: Vec<Service>) -> Result<Self> {
        Self::new(services)
    }
}

impl From<AttributeTree> for Vec<Service> {
    fn from(tree: AttributeTree) -> Self {
        tree.services
    }
}

fn advance(last: &mut Option<Handle>, handle: Handle, what: &str) -> Result<()> {
    if handle == 0 {
        return Err(ProxyError::InvalidTree(format!("{what} uses reserved handle 0")));
    }
    if let Some(prev) = *last {
        if handle <= prev {
            return Err(ProxyError::InvalidTree(format!(
                "{what} handle 0x{handle:04x} does not follow 0x{prev:04x}"
            )));
        }
    }
    *last = Some(handle);
    Ok(())
}

fn validate(services: &[Service]) -> Result<()> {
    let mut last: Option<Handle> = None;

    for service in services {
        advance(&mut last, service.start_handle, &format!("service {}", service.uuid))?;

        for characteristic in &service.characteristics {
            let name = format!("characteristic {}", characteristic.uuid);
            advance(&mut last, characteristic.start_handle, &name)?;
            advance(&mut last, characteristic.value_handle, &name)?;
            for descriptor in &characteristic.descriptors {
                let what = format!("descriptor {}", descriptor.uuid);
                advance(&mut last, descriptor.handle, &what)?;
                if descriptor.handle > characteristic.end_handle {
                    return Err(ProxyError::InvalidTree(format!("{what} lies outside {name}")));
                }
            }
            if characteristic.end_handle < characteristic.value_handle
                || characteristic.end_handle > service.end_handle
            {
                return Err(ProxyError::InvalidTree(format!(
                    "{name} range ends at 0x{:04x}",
                    characteristic.end_handle
                )));
            }
            last = Some(characteristic.end_handle.max(last.unwrap_or(0)));
        }

        if service.end_handle < service.start_handle {
            return Err(ProxyError::InvalidTree(format!(
                "service {} ends before it starts",
                service.uuid
            )));
        }
        // The next service must start after this one's whole range.
        last = Some(service.end_handle.max(last.unwrap_or(0)));
    }
    Ok(())
}
