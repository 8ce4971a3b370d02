//! Durable tier
//!
//! [`DurableStore`] fronts a primary [`IndexedEngine`] and a fallback
//! [`DurableEngine`]. Nothing here ever returns an error to the caller:
//! engine failures are logged and degrade to "not found".

mod engine;
mod file;
mod sqlite;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tracing::{debug, info, warn};

pub use engine::{DurableEngine, DurableRecord, IndexedEngine, RecordInfo};
pub use file::FileEngine;
pub use sqlite::SqliteEngine;

use crate::{
    category::CacheCategory,
    clock::{Clock, SystemClock},
    entry::StoredEntry,
    settings::CacheSettings,
    CacheError, Result,
};

/// Two-engine persistence layer
pub struct DurableStore {
    primary: Option<Arc<dyn IndexedEngine>>,
    fallback: Option<Arc<dyn DurableEngine>>,
    clock: Arc<dyn Clock>,
}

impl DurableStore {
    pub fn new(
        primary: Option<Arc<dyn IndexedEngine>>,
        fallback: Option<Arc<dyn DurableEngine>>,
    ) -> Self {
        Self {
            primary,
            fallback,
            clock: Arc::new(SystemClock),
        }
    }

    /// Open the engines described by `settings`
    ///
    /// A primary engine that cannot be opened is skipped; the store then
    /// runs on the fallback alone.
    pub fn open(settings: &CacheSettings) -> Self {
        let database_path = settings.database_path();
        let primary = match SqliteEngine::open(&database_path) {
            Ok(engine) => Some(Arc::new(engine) as Arc<dyn IndexedEngine>),
            Err(e) => {
                debug!(
                    path = %database_path.display(),
                    error = %e,
                    "primary cache engine unavailable, using fallback"
                );
                None
            }
        };
        let fallback = FileEngine::new(settings.fallback_dir(), settings.fallback_quota_bytes)
            .with_compression(settings.fallback_compression);

        Self::new(primary, Some(Arc::new(fallback)))
    }

    /// SQLite in memory with no fallback; nothing outlives the process
    pub fn in_memory() -> Result<Self> {
        let primary = SqliteEngine::open_in_memory()?;
        Ok(Self::new(Some(Arc::new(primary)), None))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether the store is running without its primary engine
    pub fn is_degraded(&self) -> bool {
        self.primary.is_none()
    }

    pub async fn get(&self, key: &str) -> Option<StoredEntry> {
        if let Some(primary) = &self.primary {
            match primary.get(key).await {
                Ok(Some(payload)) => {
                    let entry = decode_payload(primary.name(), key, &payload);
                    if entry.is_none() {
                        let _ = primary.delete(key).await;
                    }
                    return entry;
                }
                Ok(None) => return None,
                Err(e) => debug!(
                    engine = primary.name(),
                    key,
                    error = %e,
                    "durable read failed, trying fallback"
                ),
            }
        }

        let fallback = self.fallback.as_ref()?;
        match fallback.get(key).await {
            Ok(Some(payload)) => {
                let entry = decode_payload(fallback.name(), key, &payload);
                if entry.is_none() {
                    let _ = fallback.delete(key).await;
                }
                entry
            }
            Ok(None) => None,
            Err(CacheError::Deserialization { message }) => {
                debug!(engine = fallback.name(), key, error = %message, "discarding malformed record");
                let _ = fallback.delete(key).await;
                None
            }
            Err(e) => {
                debug!(engine = fallback.name(), key, error = %e, "durable read failed");
                None
            }
        }
    }

    /// Persist `entry`; returns whether any engine accepted it
    pub async fn set(&self, key: &str, entry: &StoredEntry) -> bool {
        let record = match DurableRecord::from_entry(key, entry) {
            Ok(record) => record,
            Err(e) => {
                warn!(key, error = %e, "cannot serialize entry for durable tier");
                return false;
            }
        };

        if let Some(primary) = &self.primary {
            match primary.put(&record).await {
                Ok(()) => return true,
                Err(e) => debug!(
                    engine = primary.name(),
                    key,
                    error = %e,
                    "durable write failed, trying fallback"
                ),
            }
        }

        let Some(fallback) = &self.fallback else {
            return false;
        };
        let stored = match fallback.put(&record).await {
            Ok(()) => true,
            Err(e @ CacheError::QuotaExceeded { .. }) => {
                self.recover_quota(fallback.as_ref(), &record, e).await
            }
            Err(e) => {
                warn!(engine = fallback.name(), key, error = %e, "durable write dropped");
                false
            }
        };

        // An older primary copy would shadow the fallback once the primary recovers
        if stored {
            if let Some(primary) = &self.primary {
                if let Err(e) = primary.delete(key).await {
                    debug!(engine = primary.name(), key, error = %e, "stale primary copy kept");
                }
            }
        }
        stored
    }

    /// Evict the oldest non-static records, then retry the write once
    async fn recover_quota(
        &self,
        fallback: &dyn DurableEngine,
        record: &DurableRecord,
        err: CacheError,
    ) -> bool {
        let deficit = match err {
            CacheError::QuotaExceeded {
                requested,
                available,
            } => requested.saturating_sub(available),
            _ => 0,
        };

        let evicted = evict_oldest(fallback, deficit, &record.key).await;
        info!(
            engine = fallback.name(),
            key = %record.key,
            deficit,
            evicted,
            "fallback quota exceeded, evicted oldest entries"
        );

        match fallback.put(record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    engine = fallback.name(),
                    key = %record.key,
                    error = %e,
                    "durable write dropped after quota eviction"
                );
                false
            }
        }
    }

    /// Remove `key` from both engines
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        if let Some(primary) = &self.primary {
            match primary.delete(key).await {
                Ok(hit) => removed |= hit,
                Err(e) => debug!(engine = primary.name(), key, error = %e, "durable delete failed"),
            }
        }
        if let Some(fallback) = &self.fallback {
            match fallback.delete(key).await {
                Ok(hit) => removed |= hit,
                Err(e) => debug!(engine = fallback.name(), key, error = %e, "durable delete failed"),
            }
        }
        removed
    }

    pub async fn delete_by_tag(&self, tag: &str) -> usize {
        let mut removed = 0;
        if let Some(primary) = &self.primary {
            match primary.delete_by_tag(tag).await {
                Ok(count) => removed += count,
                Err(e) => debug!(engine = primary.name(), tag, error = %e, "tag delete failed"),
            }
        }
        if let Some(fallback) = &self.fallback {
            removed += scan_delete(fallback.as_ref(), |info| info.tags.contains(tag)).await;
        }
        removed
    }

    /// Delete records older than `max_age`, sparing `excluding`
    pub async fn delete_older_than(&self, max_age: Duration, excluding: CacheCategory) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(max_age)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let mut removed = 0;
        if let Some(primary) = &self.primary {
            match primary.delete_older_than(cutoff, excluding).await {
                Ok(count) => removed += count,
                Err(e) => debug!(engine = primary.name(), error = %e, "age delete failed"),
            }
        }
        if let Some(fallback) = &self.fallback {
            removed += scan_delete(fallback.as_ref(), |info| {
                info.category != excluding && info.updated_at < cutoff
            })
            .await;
        }
        removed
    }

    /// Delete everything except records in `excluding`
    pub async fn clear(&self, excluding: CacheCategory) -> usize {
        let mut removed = 0;
        if let Some(primary) = &self.primary {
            match primary.clear_excluding(excluding).await {
                Ok(count) => removed += count,
                Err(e) => debug!(engine = primary.name(), error = %e, "durable clear failed"),
            }
        }
        if let Some(fallback) = &self.fallback {
            removed += scan_delete(fallback.as_ref(), |info| info.category != excluding).await;
        }
        removed
    }

    pub async fn list_keys(&self) -> Vec<String> {
        let mut keys = BTreeSet::new();
        if let Some(primary) = &self.primary {
            match primary.keys().await {
                Ok(found) => keys.extend(found),
                Err(e) => debug!(engine = primary.name(), error = %e, "listing keys failed"),
            }
        }
        if let Some(fallback) = &self.fallback {
            match fallback.keys().await {
                Ok(found) => keys.extend(found),
                Err(e) => debug!(engine = fallback.name(), error = %e, "listing keys failed"),
            }
        }
        keys.into_iter().collect()
    }

    /// Every readable entry in `category`
    pub async fn load_category(&self, category: CacheCategory) -> Vec<(String, StoredEntry)> {
        let mut keys = BTreeSet::new();
        if let Some(primary) = &self.primary {
            match primary.keys_in_category(category).await {
                Ok(found) => keys.extend(found),
                Err(e) => debug!(engine = primary.name(), error = %e, "category lookup failed"),
            }
        }
        if let Some(fallback) = &self.fallback {
            match fallback.scan().await {
                Ok(infos) => keys.extend(
                    infos
                        .into_iter()
                        .filter(|info| info.category == category)
                        .map(|info| info.key),
                ),
                Err(e) => debug!(engine = fallback.name(), error = %e, "category scan failed"),
            }
        }

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get(&key).await {
                entries.push((key, entry));
            }
        }
        entries
    }
}

fn decode_payload(engine: &'static str, key: &str, payload: &str) -> Option<StoredEntry> {
    match StoredEntry::from_payload(payload) {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!(engine, key, error = %e, "discarding malformed record");
            None
        }
    }
}

/// Linear-scan delete for engines without indices
async fn scan_delete<F>(engine: &dyn DurableEngine, predicate: F) -> usize
where
    F: Fn(&RecordInfo) -> bool,
{
    let infos = match engine.scan().await {
        Ok(infos) => infos,
        Err(e) => {
            debug!(engine = engine.name(), error = %e, "durable scan failed");
            return 0;
        }
    };

    let mut removed = 0;
    for info in infos.iter().filter(|info| predicate(info)) {
        if let Ok(true) = engine.delete(&info.key).await {
            removed += 1;
        }
    }
    removed
}

/// Delete oldest non-static records until `deficit` bytes are freed
async fn evict_oldest(engine: &dyn DurableEngine, deficit: u64, keep_key: &str) -> usize {
    let mut candidates: Vec<RecordInfo> = match engine.scan().await {
        Ok(infos) => infos
            .into_iter()
            .filter(|info| info.category != CacheCategory::Static && info.key != keep_key)
            .collect(),
        Err(e) => {
            debug!(engine = engine.name(), error = %e, "eviction scan failed");
            return 0;
        }
    };
    candidates.sort_by_key(|info| info.updated_at);

    let mut freed = 0u64;
    let mut evicted = 0;
    for info in candidates {
        if freed >= deficit {
            break;
        }
        if let Ok(true) = engine.delete(&info.key).await {
            freed += info.size_bytes;
            evicted += 1;
        }
    }
    evicted
}
