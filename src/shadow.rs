//! Process-local shadow of the remote store
//!
//! Unbounded and without expiry: entries leave only through [`LocalShadow::delete`],
//! [`LocalShadow::clear`] or process restart. Values may therefore outlive the
//! TTL they were written with on the remote side.

use moka::sync::Cache;

use crate::CacheValue;

/// In-memory key to value map used as fallback and local accelerator
#[derive(Clone)]
pub struct LocalShadow {
    entries: Cache<String, CacheValue>,
}

impl Default for LocalShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalShadow {
    pub fn new() -> Self {
        // No max_capacity and no time_to_live: nothing is ever evicted.
        Self {
            entries: Cache::builder().build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheValue> {
        self.entries.get(key)
    }

    pub fn set(&self, key: &str, value: CacheValue) {
        self.entries.insert(key.to_owned(), value);
    }

    /// Remove a key, returning whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key starting with `prefix` except `keep`; returns the count
    pub fn delete_prefix(&self, prefix: &str, keep: &str) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix) && k.as_str() != keep)
            .map(|(k, _)| (*k).clone())
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    pub fn size(&self) -> usize {
        self.entries.iter().count()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|(k, _)| (*k).clone()).collect();
        keys.sort();
        keys
    }
}
