//! Handle patching for the emulated peripheral
//!
//! A central that bonded with (or merely cached) the real device remembers its attribute
//! handles. If the clone serves the same attributes at different handles, the central
//! either talks to the wrong attributes or sees a "service changed" indication and
//! rediscovers, which is visible to the user. [`HandlePatcher::patch`] rewrites the
//! peripheral's default-ordered table so every attribute lands on its original handle.

use crate::ble::{AttributeTable, ServedAttribute};
use crate::gatt::{AttributeTree, CCCD_UUID, Characteristic, Handle, Properties};
use log::debug;
use std::collections::{BTreeMap, VecDeque};

const FLAG_BITS: [u8; 5] = [
    Properties::READ,
    Properties::WRITE_WITHOUT_RESPONSE,
    Properties::WRITE,
    Properties::NOTIFY,
    Properties::INDICATE,
];

/// Declaration property byte and the matching "requires encryption" mask.
pub fn property_flags(properties: Properties, secure: Properties) -> (u8, u8) {
    FLAG_BITS
        .iter()
        .filter(|bit| properties.contains(**bit))
        .fold((0, 0), |(flags, secure_flags), bit| {
            let secure_bit = if secure.contains(*bit) { *bit } else { 0 };
            (flags | bit, secure_flags | secure_bit)
        })
}

pub struct HandlePatcher;

impl HandlePatcher {
    /// Rewrites `table` to mirror the handle layout of `tree`.
    ///
    /// Within a characteristic the CCCD (`2902`) always comes first, readable and
    /// writable with a zeroed value; the remaining descriptors keep their order and are
    /// read-only. Descriptors then take the original descriptor handles positionally.
    pub fn patch(tree: &AttributeTree, table: &mut AttributeTable) {
        let mut patched: BTreeMap<Handle, ServedAttribute> = BTreeMap::new();

        for service in tree.services() {
            patched.insert(
                service.start_handle,
                ServedAttribute::Service {
                    uuid: service.uuid.clone(),
                    start_handle: service.start_handle,
                    end_handle: service.end_handle,
                },
            );

            for characteristic in &service.characteristics {
                let (properties, secure) =
                    property_flags(characteristic.properties, characteristic.secure);

                patched.insert(
                    characteristic.start_handle,
                    ServedAttribute::Characteristic {
                        service: service.uuid.clone(),
                        uuid: characteristic.uuid.clone(),
                        properties,
                        secure,
                        start_handle: characteristic.start_handle,
                        value_handle: characteristic.value_handle,
                        end_handle: characteristic.end_handle,
                    },
                );
                patched.insert(
                    characteristic.value_handle,
                    ServedAttribute::CharacteristicValue {
                        service: service.uuid.clone(),
                        characteristic: characteristic.uuid.clone(),
                        handle: characteristic.value_handle,
                        value: None,
                    },
                );

                for (handle, descriptor) in reorder_descriptors(&service.uuid, characteristic, secure)
                {
                    patched.insert(handle, descriptor);
                }
            }
        }

        debug!(
            "Patched attribute table: {} attributes (was {})",
            patched.len(),
            table.len()
        );
        table.replace(patched);
    }
}

fn reorder_descriptors(
    service: &str,
    characteristic: &Characteristic,
    secure: u8,
) -> Vec<(Handle, ServedAttribute)> {
    let handles: Vec<Handle> = characteristic.descriptors.iter().map(|d| d.handle).collect();
    let mut ordered = VecDeque::with_capacity(handles.len());

    for descriptor in &characteristic.descriptors {
        if descriptor.uuid == CCCD_UUID {
            let cccd_secure = if secure & Properties::NOTIFY != 0 {
                Properties::READ | Properties::WRITE
            } else {
                0
            };
            ordered.push_front(ServedAttribute::Descriptor {
                service: service.to_string(),
                characteristic: characteristic.uuid.clone(),
                uuid: CCCD_UUID.to_string(),
                handle: 0,
                properties: Properties::READ | Properties::WRITE,
                secure: cccd_secure,
                value: Some(vec![0x00, 0x00]),
            });
        } else {
            ordered.push_back(ServedAttribute::Descriptor {
                service: service.to_string(),
                characteristic: characteristic.uuid.clone(),
                uuid: descriptor.uuid.clone(),
                handle: 0,
                properties: Properties::READ,
                secure: 0,
                value: descriptor.value.clone(),
            });
        }
    }

    handles
        .into_iter()
        .zip(ordered)
        .map(|(handle, mut attribute)| {
            if let ServedAttribute::Descriptor { handle: slot, .. } = &mut attribute {
                *slot = handle;
            }
            (handle, attribute)
        })
        .collect()
}
