//! Key to tag registry for the external cache
//!
//! The external cache only knows keys. Tags declared when a key is written
//! are recorded here so tag invalidation can name the exact keys to drop.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

use crate::category::CacheCategory;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    category: CacheCategory,
    tags: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Index {
    keys: HashMap<String, Registration>,
    by_tag: HashMap<String, HashSet<String>>,
}

impl Index {
    fn unlink(&mut self, key: &str) -> Option<Registration> {
        let registration = self.keys.remove(key)?;
        for tag in &registration.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(registration)
    }
}

#[derive(Debug, Default)]
pub struct TagRegistry {
    index: RwLock<Index>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` with its tags, replacing any earlier registration
    pub fn register(&self, key: &str, category: CacheCategory, tags: &BTreeSet<String>) {
        let mut index = self.index.write();
        index.unlink(key);
        for tag in tags {
            index
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        index.keys.insert(
            key.to_string(),
            Registration {
                category,
                tags: tags.clone(),
            },
        );
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.index.write().unlink(key).is_some()
    }

    /// Unregister and return every key carrying any of `tags`
    pub fn take_tagged(&self, tags: &[&str]) -> Vec<String> {
        let mut index = self.index.write();
        let keys: BTreeSet<String> = tags
            .iter()
            .filter_map(|tag| index.by_tag.get(*tag))
            .flat_map(|keys| keys.iter().cloned())
            .collect();
        for key in &keys {
            index.unlink(key);
        }
        keys.into_iter().collect()
    }

    /// Unregister and return every key outside `category`
    pub fn take_excluding(&self, category: CacheCategory) -> Vec<String> {
        let mut index = self.index.write();
        let mut keys: Vec<String> = index
            .keys
            .iter()
            .filter(|(_, reg)| reg.category != category)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        for key in &keys {
            index.unlink(key);
        }
        keys
    }

    pub fn tags_of(&self, key: &str) -> Option<BTreeSet<String>> {
        self.index.read().keys.get(key).map(|reg| reg.tags.clone())
    }

    pub fn len(&self) -> usize {
        self.index.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut index = self.index.write();
        index.keys.clear();
        index.by_tag.clear();
    }
}
