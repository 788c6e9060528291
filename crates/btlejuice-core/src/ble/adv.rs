//! Advertising data (AD structure) encoding and decoding
//!
//! The proxy captures advertisement and scan response payloads as raw AD structures
//! (`[len, type, data...]` repeated) so the emulated peripheral can replay them. BlueZ
//! does not take raw payloads, so [`AdContent`] lifts the fields it does accept.

use log::trace;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub const AD_FLAGS: u8 = 0x01;
pub const AD_INCOMPLETE_UUID16: u8 = 0x02;
pub const AD_COMPLETE_UUID16: u8 = 0x03;
pub const AD_INCOMPLETE_UUID128: u8 = 0x06;
pub const AD_COMPLETE_UUID128: u8 = 0x07;
pub const AD_SHORT_NAME: u8 = 0x08;
pub const AD_COMPLETE_NAME: u8 = 0x09;
pub const AD_SERVICE_DATA16: u8 = 0x16;
pub const AD_MANUFACTURER_DATA: u8 = 0xff;

/// Largest legacy advertising payload.
pub const MAX_LEGACY_LEN: usize = 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdRecord {
    pub ad_type: u8,
    pub data: Vec<u8>,
}

/// Splits a raw payload into AD structures. A truncated trailing structure is dropped.
pub fn parse(payload: &[u8]) -> Vec<AdRecord> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let len = payload[pos] as usize;
        if len == 0 {
            break;
        }
        let end = pos + 1 + len;
        if end > payload.len() {
            trace!("Truncated AD structure at offset {}", pos);
            break;
        }
        records.push(AdRecord {
            ad_type: payload[pos + 1],
            data: payload[pos + 2..end].to_vec(),
        });
        pos = end;
    }
    records
}

/// Serializes AD structures back into a raw payload.
pub fn encode<'a>(records: impl IntoIterator<Item = (u8, &'a [u8])>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(MAX_LEGACY_LEN);
    for (ad_type, data) in records {
        let Ok(len) = u8::try_from(data.len() + 1) else {
            continue;
        };
        payload.push(len);
        payload.push(ad_type);
        payload.extend_from_slice(data);
    }
    payload
}

fn uuid16(value: u16) -> Uuid {
    Uuid::from_u128((u128::from(value) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Advertisement fields that BlueZ lets a peripheral set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdContent {
    pub local_name: Option<String>,
    pub service_uuids: BTreeSet<Uuid>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl AdContent {
    /// Collects the fields of one or more raw payloads (advertisement, then scan response).
    pub fn from_payloads<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut content = Self::default();
        for payload in payloads {
            for record in parse(payload) {
                content.absorb(record);
            }
        }
        content
    }

    fn absorb(&mut self, record: AdRecord) {
        let data = record.data;
        match record.ad_type {
            AD_SHORT_NAME | AD_COMPLETE_NAME => {
                // A complete name wins over a shortened one.
                if self.local_name.is_none() || record.ad_type == AD_COMPLETE_NAME {
                    self.local_name = Some(String::from_utf8_lossy(&data).into_owned());
                }
            }
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                for chunk in data.chunks_exact(2) {
                    self.service_uuids
                        .insert(uuid16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                for chunk in data.chunks_exact(16) {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    bytes.reverse();
                    self.service_uuids.insert(Uuid::from_bytes(bytes));
                }
            }
            AD_SERVICE_DATA16 if data.len() >= 2 => {
                let uuid = uuid16(u16::from_le_bytes([data[0], data[1]]));
                self.service_data.insert(uuid, data[2..].to_vec());
            }
            AD_MANUFACTURER_DATA if data.len() >= 2 => {
                let company = u16::from_le_bytes([data[0], data[1]]);
                self.manufacturer_data.insert(company, data[2..].to_vec());
            }
            other => trace!("Ignoring AD type 0x{:02x} ({} bytes)", other, data.len()),
        }
    }
}
