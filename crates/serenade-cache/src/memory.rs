//! Process-local memory tier

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::entry::StoredEntry;

/// Key to entry map; eviction is driven by the manager's cleanup sweep
#[derive(Debug, Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Replace the entry for `key` wholesale
    pub fn set(&self, key: &str, entry: StoredEntry) {
        self.entries.write().insert(key.to_string(), entry);
    }

    /// Insert only if no newer copy is already resident
    ///
    /// Returns whether `entry` was stored.
    pub fn promote(&self, key: &str, entry: StoredEntry) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(current) if current.updated_at > entry.updated_at => false,
            _ => {
                entries.insert(key.to_string(), entry);
                true
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Remove every entry matching `predicate`, returning how many went
    pub fn delete_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&str, &StoredEntry) -> bool,
    {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, entry| !predicate(key, entry));
        before - entries.len()
    }

    /// Snapshot of resident entries
    pub fn iterate(&self) -> Vec<(String, StoredEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Best-effort byte size of the resident values
    pub fn approximate_bytes(&self) -> u64 {
        self.entries
            .read()
            .values()
            .map(|entry| entry.approximate_size() + entry_overhead(entry))
            .sum()
    }
}

fn entry_overhead(entry: &StoredEntry) -> u64 {
    entry.tags.iter().map(|t| t.len() as u64).sum::<u64>()
        + entry.version.as_ref().map_or(0, |v| v.len() as u64)
}
