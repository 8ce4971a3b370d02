//! External reactive cache seam
//!
//! The manager treats the application's reactive data-fetching cache as one
//! more tier. It never assumes more than get, set and predicate-based
//! invalidation.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;

/// Minimal contract of a reactive query cache
#[async_trait]
pub trait ExternalCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Invalidate every key for which `predicate` holds; returns how many
    async fn invalidate_matching(
        &self,
        predicate: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync),
    ) -> Result<usize>;
}

/// In-process reactive cache keyed by query key
///
/// Invalidation removes the value so the owner's next fetch repopulates it.
#[derive(Debug, Default)]
pub struct InMemoryExternalCache {
    values: DashMap<String, serde_json::Value>,
}

impl InMemoryExternalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

#[async_trait]
impl ExternalCache for InMemoryExternalCache {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn invalidate_matching(
        &self,
        predicate: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync),
    ) -> Result<usize> {
        let before = self.values.len();
        self.values.retain(|key, _| !predicate(key));
        Ok(before - self.values.len())
    }
}
