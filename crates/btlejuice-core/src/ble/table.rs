//! Served attribute table of an emulated peripheral
//!
//! A handle-indexed map of every attribute the peripheral exposes. Backends build it
//! with sequential handles from an [`AttributeTree`]; the handle patcher may then
//! rewrite it before the backend registers it with the stack.

use crate::gatt::{AttributeTree, Handle, Properties};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServedAttribute {
    Service {
        uuid: String,
        start_handle: Handle,
        end_handle: Handle,
    },
    Characteristic {
        service: String,
        uuid: String,
        properties: u8,
        secure: u8,
        start_handle: Handle,
        value_handle: Handle,
        end_handle: Handle,
    },
    CharacteristicValue {
        service: String,
        characteristic: String,
        handle: Handle,
        value: Option<Vec<u8>>,
    },
    Descriptor {
        service: String,
        characteristic: String,
        uuid: String,
        handle: Handle,
        properties: u8,
        secure: u8,
        value: Option<Vec<u8>>,
    },
}

impl ServedAttribute {
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Self::Service { uuid, .. }
            | Self::Characteristic { uuid, .. }
            | Self::Descriptor { uuid, .. } => Some(uuid),
            Self::CharacteristicValue { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTable {
    entries: BTreeMap<Handle, ServedAttribute>,
}

impl AttributeTable {
    /// Lays the tree out from handle 1 in tree order, ignoring the original handles.
    pub fn sequential(tree: &AttributeTree) -> Self {
        let mut table = Self::default();
        let mut next: Handle = 1;
        let mut take = || {
            let handle = next;
            next = next.saturating_add(1);
            handle
        };

        for service in tree.services() {
            let service_start = take();
            let mut service_end = service_start;

            for characteristic in &service.characteristics {
                let start_handle = take();
                let value_handle = take();
                let mut end_handle = value_handle;

                let properties = characteristic.properties.bits();
                table.insert(
                    value_handle,
                    ServedAttribute::CharacteristicValue {
                        service: service.uuid.clone(),
                        characteristic: characteristic.uuid.clone(),
                        handle: value_handle,
                        value: None,
                    },
                );

                for descriptor in &characteristic.descriptors {
                    let handle = take();
                    end_handle = handle;
                    table.insert(
                        handle,
                        ServedAttribute::Descriptor {
                            service: service.uuid.clone(),
                            characteristic: characteristic.uuid.clone(),
                            uuid: descriptor.uuid.clone(),
                            handle,
                            properties: Properties::READ,
                            secure: 0,
                            value: descriptor.value.clone(),
                        },
                    );
                }

                table.insert(
                    start_handle,
                    ServedAttribute::Characteristic {
                        service: service.uuid.clone(),
                        uuid: characteristic.uuid.clone(),
                        properties,
                        secure: characteristic.secure.bits(),
                        start_handle,
                        value_handle,
                        end_handle,
                    },
                );
                service_end = end_handle;
            }

            table.insert(
                service_start,
                ServedAttribute::Service {
                    uuid: service.uuid.clone(),
                    start_handle: service_start,
                    end_handle: service_end,
                },
            );
        }
        table
    }

    pub fn insert(&mut self, handle: Handle, attribute: ServedAttribute) {
        self.entries.insert(handle, attribute);
    }

    pub fn get(&self, handle: Handle) -> Option<&ServedAttribute> {
        self.entries.get(&handle)
    }

    /// Replaces the whole handle map.
    pub fn replace(&mut self, entries: BTreeMap<Handle, ServedAttribute>) {
        self.entries = entries;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &ServedAttribute)> {
        self.entries.iter().map(|(handle, attr)| (*handle, attr))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors of one characteristic in handle order.
    pub fn descriptors_of(&self, service: &str, characteristic: &str) -> Vec<&ServedAttribute> {
        self.entries
            .values()
            .filter(|attr| {
                matches!(attr, ServedAttribute::Descriptor { service: s, characteristic: c, .. }
                    if s == service && c == characteristic)
            })
            .collect()
    }
}
