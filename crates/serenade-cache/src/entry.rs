//! Cache entries and freshness classification

use std::{collections::BTreeSet, time::Duration};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    category::{CacheCategory, CachePolicy},
    clock::age_between,
    CacheError, Result,
};

/// Snapshot of the freshness window an entry was written under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPolicy {
    pub stale_after_ms: Option<u64>,
    pub evict_after_ms: Option<u64>,
}

impl EntryPolicy {
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_ms.map(Duration::from_millis)
    }

    pub fn evict_after(&self) -> Option<Duration> {
        self.evict_after_ms.map(Duration::from_millis)
    }
}

impl From<&CachePolicy> for EntryPolicy {
    fn from(policy: &CachePolicy) -> Self {
        Self {
            stale_after_ms: policy.stale_after.map(|d| d.as_millis() as u64),
            evict_after_ms: policy.evict_after.map(|d| d.as_millis() as u64),
        }
    }
}

/// Where an entry sits in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than `stale_after`
    Fresh,
    /// Servable, but a background refresh is due
    Stale,
    /// At or beyond `evict_after`; must be purged
    Evicted,
}

impl Freshness {
    /// Classify `age` against a freshness window
    pub fn classify(
        age: Duration,
        stale_after: Option<Duration>,
        evict_after: Option<Duration>,
    ) -> Self {
        if evict_after.is_some_and(|evict| age >= evict) {
            Freshness::Evicted
        } else if stale_after.is_some_and(|stale| age >= stale) {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    pub fn is_servable(&self) -> bool {
        !matches!(self, Freshness::Evicted)
    }
}

/// A cached value with its bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached data
    pub data: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub category: CacheCategory,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub policy: EntryPolicy,
}

/// Type-erased entry as held by every tier
pub type StoredEntry = CacheEntry<serde_json::Value>;

impl<T> CacheEntry<T> {
    /// Create an entry written at `now` under `policy`
    pub fn new(data: T, policy: &CachePolicy, now: DateTime<Utc>) -> Self {
        Self {
            data,
            created_at: now,
            updated_at: now,
            category: policy.category,
            tags: BTreeSet::new(),
            version: None,
            policy: EntryPolicy::from(policy),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn is_static(&self) -> bool {
        self.category == CacheCategory::Static
    }

    /// Age since the last write
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        age_between(self.updated_at, now)
    }

    /// Freshness under the window captured at write time
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if self.is_static() {
            return Freshness::Fresh;
        }
        Freshness::classify(
            self.age(now),
            self.policy.stale_after(),
            self.policy.evict_after(),
        )
    }

    /// Freshness under an explicitly requested policy
    ///
    /// Static entries stay fresh whatever policy is asked for.
    pub fn freshness_under(&self, policy: &CachePolicy, now: DateTime<Utc>) -> Freshness {
        if self.is_static() {
            return Freshness::Fresh;
        }
        Freshness::classify(self.age(now), policy.stale_after, policy.evict_after)
    }
}

impl<T: Serialize> CacheEntry<T> {
    /// Erase the value type for storage
    pub fn encode(&self) -> Result<StoredEntry> {
        let data = serde_json::to_value(&self.data).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })?;
        Ok(CacheEntry {
            data,
            created_at: self.created_at,
            updated_at: self.updated_at,
            category: self.category,
            tags: self.tags.clone(),
            version: self.version.clone(),
            policy: self.policy,
        })
    }
}

impl StoredEntry {
    /// Recover the typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(|e| CacheError::Deserialization {
            message: e.to_string(),
        })
    }

    /// Rough serialized size, used for byte accounting
    pub fn approximate_size(&self) -> u64 {
        serde_json::to_string(&self.data)
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }

    /// Serialize for a durable engine
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })
    }

    /// Parse a durable payload
    pub fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| CacheError::Deserialization {
            message: e.to_string(),
        })
    }
}
