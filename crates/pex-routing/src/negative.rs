//! Negative lookup cache.
//!
//! Remembers for a short TTL that a key resolved to no peers, so a burst
//! of requests for uncached content goes straight to the origin instead
//! of repeating DHT lookups. Entries expire passively: an expired entry
//! is removed on the read that observes it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// TTL-bounded set of keys that recently resolved to nothing.
#[derive(Debug, Default)]
pub struct NegativeCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True iff `key` holds an unexpired not-found sentinel.
    pub fn contains(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(inserted) if inserted.elapsed() < self.ttl => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Marks `key` as not found for the next TTL window.
    pub fn insert(&self, key: &str) {
        self.entries.lock().insert(key.to_owned(), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_expires_after_the_ttl() {
        let cache = NegativeCache::new(Duration::from_millis(25));
        cache.insert("k");
        assert!(cache.contains("k"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!cache.contains("k"), "sentinel must expire");
        assert!(!cache.contains("k"));
    }

    #[test]
    fn unknown_keys_are_not_negative() {
        let cache = NegativeCache::new(Duration::from_millis(500));
        assert!(!cache.contains("nope"));
    }
}
