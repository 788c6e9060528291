//! Per-address cache of completed discoveries
//!
//! Entries are never evicted: a device whose GATT database changes between runs keeps
//! being served from its first discovery until the proxy restarts.

use crate::ble::PlatformBinding;
use crate::gatt::AttributeTree;
use log::debug;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct SessionCacheEntry {
    pub address: String,
    pub attribute_tree: AttributeTree,
    pub platform_binding: PlatformBinding,
}

#[derive(Debug, Default)]
pub struct SessionCache {
    entries: HashMap<String, SessionCacheEntry>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, address: &str) -> Option<&SessionCacheEntry> {
        self.entries.get(&address.to_lowercase())
    }

    /// Stores a fresh discovery, replacing any earlier entry for the address.
    pub fn store(
        &mut self,
        address: &str,
        attribute_tree: AttributeTree,
        platform_binding: PlatformBinding,
    ) {
        let address = address.to_lowercase();
        debug!("Caching attribute tree of {}", address);
        self.entries.insert(
            address.clone(),
            SessionCacheEntry {
                address,
                attribute_tree,
                platform_binding,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::tree::tests::sample_services;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut cache = SessionCache::new();
        let tree = AttributeTree::new(sample_services()).unwrap();
        cache.store("54:4A:16:6D:3D:23", tree.clone(), PlatformBinding::new(()));

        let entry = cache.lookup("54:4a:16:6d:3d:23").unwrap();
        assert_eq!(entry.address, "54:4a:16:6d:3d:23");
        assert_eq!(entry.attribute_tree, tree);
        assert!(cache.lookup("00:11:22:33:44:55").is_none());
    }

    #[test]
    fn test_store_overwrites() {
        let mut cache = SessionCache::new();
        cache.store("aa:bb:cc:dd:ee:ff", AttributeTree::default(), PlatformBinding::new(1u8));
        cache.store("AA:BB:CC:DD:EE:FF", AttributeTree::default(), PlatformBinding::new(2u8));

        assert_eq!(cache.len(), 1);
        let binding = &cache.lookup("aa:bb:cc:dd:ee:ff").unwrap().platform_binding;
        assert_eq!(binding.downcast::<u8>().as_deref(), Some(&2));
    }
}
