//! Bounded artifact-length cache.
//!
//! Total lengths are learned once from the origin and are cheap to learn
//! again, so overflow handling is deliberately crude: about 5% of entries
//! are dropped, in whatever order the map yields them.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Bounded mapping from artifact name to total byte length.
#[derive(Debug)]
pub struct MetadataCache {
    capacity: usize,
    entries: RwLock<HashMap<String, u64>>,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries.read().get(name).copied()
    }

    pub fn put(&self, name: &str, len: u64) {
        let mut entries = self.entries.write();
        if !entries.contains_key(name) && entries.len() >= self.capacity {
            let victims: Vec<String> = entries
                .keys()
                .take((self.capacity / 20).max(1))
                .cloned()
                .collect();
            for victim in victims {
                entries.remove(&victim);
            }
        }
        entries.insert(name.to_owned(), len);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
