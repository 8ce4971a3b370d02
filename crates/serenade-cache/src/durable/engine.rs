//! Durable engine traits

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{category::CacheCategory, entry::StoredEntry, Result};

/// One persisted entry: the indexed columns plus the serialized entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub key: String,
    pub category: CacheCategory,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub payload: String,
}

impl DurableRecord {
    pub fn from_entry(key: &str, entry: &StoredEntry) -> Result<Self> {
        Ok(Self {
            key: key.to_string(),
            category: entry.category,
            updated_at: entry.updated_at,
            tags: entry.tags.clone(),
            payload: entry.to_payload()?,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        (self.key.len() + self.payload.len()) as u64
    }
}

/// Indexed columns of a stored record, without the payload
#[derive(Debug, Clone, PartialEq)]
pub struct RecordInfo {
    pub key: String,
    pub category: CacheCategory,
    pub updated_at: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub size_bytes: u64,
}

/// Minimal keyed persistence: get/put/delete plus enumeration
#[async_trait]
pub trait DurableEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &'static str;

    /// Raw payload for `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, record: &DurableRecord) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Indexed columns of every record; a full scan
    async fn scan(&self) -> Result<Vec<RecordInfo>>;
}

/// Engine with native tag, age and category indices
#[async_trait]
pub trait IndexedEngine: DurableEngine {
    async fn delete_by_tag(&self, tag: &str) -> Result<usize>;

    /// Delete records written before `cutoff`, except those in `excluding`
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        excluding: CacheCategory,
    ) -> Result<usize>;

    async fn clear_excluding(&self, excluding: CacheCategory) -> Result<usize>;

    async fn keys_in_category(&self, category: CacheCategory) -> Result<Vec<String>>;
}
