//! Attribute UUID helpers
//!
//! UUIDs travel in their short lowercase form without dashes (`2a29`,
//! `94e000015d5b11e4846f4437e6b36dfb`). Remote stacks report mixed case and the
//! long form for SIG-assigned UUIDs, so every UUID entering the relay goes through
//! [`normalize`].

use crate::error::{ProxyError, Result};
use uuid::Uuid;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const BASE_MASK: u128 = 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;

/// Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: &str = "2902";
/// Characteristic User Description.
pub const USER_DESCRIPTION_UUID: &str = "2901";

/// Normalizes a UUID string to the relay's canonical short lowercase form.
pub fn normalize(uuid: &str) -> String {
    let compact: String = uuid
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if compact.len() == 32 {
        if let Ok(value) = u128::from_str_radix(&compact, 16) {
            return from_u128(value);
        }
    }
    compact
}

/// Converts a full UUID into the canonical short form.
pub fn from_uuid(uuid: Uuid) -> String {
    from_u128(uuid.as_u128())
}

fn from_u128(value: u128) -> String {
    if value & BASE_MASK == BASE_UUID {
        let short = (value >> 96) as u32;
        if short <= 0xffff {
            return format!("{:04x}", short);
        }
        return format!("{:08x}", short);
    }
    format!("{:032x}", value)
}

/// Expands a short or long UUID string into a full [`Uuid`].
pub fn to_uuid(uuid: &str) -> Result<Uuid> {
    let compact = normalize(uuid);
    let value = match compact.len() {
        4 | 8 => {
            let short = u32::from_str_radix(&compact, 16)
                .map_err(|_| ProxyError::InvalidUuid(uuid.to_string()))?;
            (u128::from(short) << 96) | BASE_UUID
        }
        32 => u128::from_str_radix(&compact, 16)
            .map_err(|_| ProxyError::InvalidUuid(uuid.to_string()))?,
        _ => return Err(ProxyError::InvalidUuid(uuid.to_string())),
    };
    Ok(Uuid::from_u128(value))
}
