//! Device profile, the unit handed from the proxy to the interception core
//!
//! Wire shape:
//!
//! ```text
//! { "address": "54:4a:16:6d:3d:23", "ad_records": "0201..", "scan_data": "" ,
//!   "name": "Master Lock",
//!   "services": [{ "uuid", "startHandle", "endHandle",
//!                  "characteristics": [{ "uuid", "properties", "descriptors",
//!                                        "startHandle", "valueHandle", "endHandle" }] }] }
//! ```
//!
//! Binary fields are hex strings; a missing scan response is the empty string.

use crate::gatt::tree::AttributeTree;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub address: String,
    #[serde(with = "hex_bytes")]
    pub ad_records: Vec<u8>,
    #[serde(default, with = "hex_or_empty")]
    pub scan_data: Option<Vec<u8>>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "services")]
    pub attribute_tree: AttributeTree,
}

impl DeviceProfile {
    pub fn new(
        address: &str,
        ad_records: Vec<u8>,
        scan_data: Option<Vec<u8>>,
        name: Option<String>,
        attribute_tree: AttributeTree,
    ) -> Self {
        Self {
            address: address.to_lowercase(),
            ad_records,
            scan_data,
            name,
            attribute_tree,
        }
    }
}

/// `Vec<u8>` as a lowercase hex string.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim()).map_err(serde::de::Error::custom)
    }
}

/// `Option<Vec<u8>>` as a hex string or `null`.
pub mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        data: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| hex::decode(text.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// `Option<Vec<u8>>` as a hex string, with `None` written as `""`.
pub mod hex_or_empty {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        data: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&data.as_deref().map(hex::encode).unwrap_or_default())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) if !text.trim().is_empty() => hex::decode(text.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::tree::tests::sample_services;

    fn sample_profile() -> DeviceProfile {
        DeviceProfile::new(
            "54:4A:16:6D:3D:23",
            hex::decode("0201051107fb6db3e637446f84e4115b5d0100e094").unwrap(),
            None,
            Some("Master Lock".to_string()),
            AttributeTree::new(sample_services()).unwrap(),
        )
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(sample_profile()).unwrap();
        assert_eq!(json["address"], "54:4a:16:6d:3d:23");
        assert_eq!(json["scan_data"], "");
        assert_eq!(json["ad_records"], "0201051107fb6db3e637446f84e4115b5d0100e094");

        let charac = &json["services"][1]["characteristics"][0];
        assert_eq!(charac["valueHandle"], 0x0e);
        assert_eq!(
            charac["properties"],
            serde_json::json!(["read", "writeWithoutResponse", "write", "notify"])
        );
        assert_eq!(charac["descriptors"][0]["value"], "");
        assert!(charac["descriptors"][1]["value"].is_null());
        assert!(charac.get("secure").is_none());
    }

    #[test]
    fn test_wire_roundtrip_preserves_tree() {
        let profile = sample_profile();
        let text = serde_json::to_string(&profile).unwrap();
        let back: DeviceProfile = serde_json::from_str(&text).unwrap();

        assert_eq!(back, profile);
        assert_eq!(back.attribute_tree.handles(), profile.attribute_tree.handles());
    }

    #[test]
    fn test_invalid_tree_is_rejected_on_the_wire() {
        let text = r#"{
            "address": "aa:bb:cc:dd:ee:ff",
            "ad_records": "",
            "scan_data": "",
            "name": null,
            "services": [
                {"uuid": "180a", "startHandle": 5, "endHandle": 9, "characteristics": []},
                {"uuid": "180f", "startHandle": 7, "endHandle": 9, "characteristics": []}
            ]
        }"#;
        assert!(serde_json::from_str::<DeviceProfile>(text).is_err());
    }
}
