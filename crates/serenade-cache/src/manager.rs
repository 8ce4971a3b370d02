//! Cache manager
//!
//! [`CacheManager`] is the only type consumer code talks to. It coordinates
//! the memory tier, the durable store and an optional external reactive
//! cache, classifies entries as fresh, stale or evicted, refreshes stale
//! entries in the background and runs the periodic cleanup sweep.
//!
//! Persistence problems never fail a `get` or `set`; they are logged and the
//! manager degrades to a smaller effective cache.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::Display,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    category::{resolve, CacheCategory, CachePolicy, PolicyOverrides},
    clock::{Clock, SystemClock},
    durable::DurableStore,
    entry::{CacheEntry, Freshness, StoredEntry},
    external::ExternalCache,
    inflight::{KeyedLocks, RefreshGuard},
    memory::MemoryTier,
    metrics::{CacheMetrics, CacheStats},
    settings::CacheSettings,
    tags::TagRegistry,
    CacheError, Result,
};

type RefreshFuture = BoxFuture<'static, std::result::Result<serde_json::Value, String>>;
type RefreshLoader = Arc<dyn Fn() -> RefreshFuture + Send + Sync>;

/// How a value is written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub category: CacheCategory,
    pub tags: BTreeSet<String>,
    pub version: Option<String>,
    /// Applied on top of the configured policy for `category`
    pub overrides: PolicyOverrides,
}

impl SetOptions {
    pub fn new(category: CacheCategory) -> Self {
        Self {
            category,
            ..Self::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn overrides(mut self, overrides: PolicyOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Options that rewrite `entry` with its original shape
    fn for_entry(entry: &StoredEntry) -> Self {
        Self {
            category: entry.category,
            tags: entry.tags.clone(),
            version: entry.version.clone(),
            overrides: PolicyOverrides {
                stale_after_ms: entry.policy.stale_after_ms,
                evict_after_ms: entry.policy.evict_after_ms,
                persist: None,
            },
        }
    }
}

impl From<CacheCategory> for SetOptions {
    fn from(category: CacheCategory) -> Self {
        Self::new(category)
    }
}

/// Entries removed by one cleanup sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub memory_purged: usize,
    pub durable_purged: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.memory_purged + self.durable_purged
    }
}

struct ManagerInner {
    settings: CacheSettings,
    overrides: HashMap<CacheCategory, PolicyOverrides>,
    policies: HashMap<CacheCategory, CachePolicy>,
    memory: MemoryTier,
    durable: DurableStore,
    external: RwLock<Option<Arc<dyn ExternalCache>>>,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
    tags: TagRegistry,
    refreshing: Arc<RefreshGuard>,
    preloads: KeyedLocks,
    loaders: RwLock<HashMap<String, RefreshLoader>>,
    initialized: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Builder for [`CacheManager`]
#[derive(Default)]
pub struct CacheManagerBuilder {
    settings: Option<CacheSettings>,
    durable: Option<DurableStore>,
    external: Option<Arc<dyn ExternalCache>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CacheManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Use `durable` instead of opening the engines named in the settings
    pub fn durable(mut self, durable: DurableStore) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn external(mut self, external: Arc<dyn ExternalCache>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<CacheManager> {
        let settings = self.settings.unwrap_or_default();
        settings.validate()?;

        let overrides = settings.category_overrides()?;
        let policies = CacheCategory::ALL
            .into_iter()
            .map(|category| {
                let policy = resolve(
                    category,
                    overrides.get(&category).unwrap_or(&PolicyOverrides::default()),
                )?;
                Ok((category, policy))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let durable = self
            .durable
            .unwrap_or_else(|| DurableStore::open(&settings))
            .with_clock(Arc::clone(&clock));
        if durable.is_degraded() {
            debug!("cache manager running without primary durable engine");
        }

        Ok(CacheManager {
            inner: Arc::new(ManagerInner {
                settings,
                overrides,
                policies,
                memory: MemoryTier::new(),
                durable,
                external: RwLock::new(self.external),
                clock,
                metrics: CacheMetrics::new(),
                tags: TagRegistry::new(),
                refreshing: Arc::new(RefreshGuard::new()),
                preloads: KeyedLocks::new(),
                loaders: RwLock::new(HashMap::new()),
                initialized: AtomicBool::new(false),
                cleanup_task: Mutex::new(None),
            }),
        })
    }
}

/// Handle to the tiered cache; clones share state
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    /// Manager over the engines named in `settings`
    pub fn open(settings: CacheSettings) -> Result<Self> {
        Self::builder().settings(settings).build()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Configured policy for `category`
    pub fn policy(&self, category: CacheCategory) -> CachePolicy {
        self.inner
            .policies
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.defaults())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Attach the external cache, warm static entries, run one cleanup and
    /// start the periodic sweep. Later calls are no-ops until [`destroy`].
    ///
    /// [`destroy`]: CacheManager::destroy
    pub async fn init(&self, external: Option<Arc<dyn ExternalCache>>) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("cache manager already initialized");
            return;
        }

        if let Some(external) = external {
            *self.inner.external.write() = Some(external);
        }

        let mut warmed = 0;
        if self.inner.settings.warm_static_on_init {
            for category in CacheCategory::ALL {
                if !self.policy(category).warm {
                    continue;
                }
                for (key, entry) in self.inner.durable.load_category(category).await {
                    self.inner.tags.register(&key, entry.category, &entry.tags);
                    if self.inner.memory.promote(&key, entry) {
                        warmed += 1;
                    }
                }
            }
        }

        let report = self.cleanup().await;
        self.spawn_cleanup_task();

        info!(
            warmed,
            purged = report.total(),
            interval_secs = self.inner.settings.cleanup_interval_secs,
            "cache manager initialized"
        );
    }

    fn spawn_cleanup_task(&self) {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let period = self.inner.settings.cleanup_interval();

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                CacheManager { inner }.cleanup().await;
            }
        });

        if let Some(previous) = self.inner.cleanup_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sweep and drop everything process-local
    ///
    /// Durable contents are left alone and survive a restart.
    pub fn destroy(&self) {
        if let Some(handle) = self.inner.cleanup_task.lock().take() {
            handle.abort();
        }
        self.inner.memory.clear();
        *self.inner.external.write() = None;
        self.inner.loaders.write().clear();
        self.inner.tags.clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("cache manager destroyed");
    }

    fn external(&self) -> Option<Arc<dyn ExternalCache>> {
        self.inner.external.read().clone()
    }

    /// Drop registry bookkeeping for a key no local tier holds any more
    ///
    /// With an external cache attached the key stays registered so tag
    /// invalidation still reaches the external copy.
    fn forget(&self, key: &str) {
        if self.inner.external.read().is_none() {
            self.inner.tags.unregister(key);
        }
    }

    fn loader(&self, key: &str) -> Option<RefreshLoader> {
        self.inner.loaders.read().get(key).cloned()
    }

    fn classify(
        &self,
        entry: &StoredEntry,
        category: Option<CacheCategory>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Freshness {
        match category {
            Some(category) => entry.freshness_under(&self.policy(category), now),
            None => entry.freshness(now),
        }
    }

    /// Look `key` up across the tiers
    ///
    /// With `category` set, freshness is judged by that category's policy
    /// instead of the window captured when the entry was written. A stale
    /// hit is served and kicks off at most one background refresh.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        category: Option<CacheCategory>,
    ) -> Option<T> {
        let found = self.lookup(key, category).await;
        if found.is_some() {
            self.inner.metrics.record_hit();
        } else {
            self.inner.metrics.record_miss();
        }
        found
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        key: &str,
        category: Option<CacheCategory>,
    ) -> Option<T> {
        let now = self.inner.clock.now();

        if let Some(entry) = self.inner.memory.get(key) {
            match self.classify(&entry, category, now) {
                Freshness::Evicted => {
                    self.inner.memory.delete(key);
                    self.forget(key);
                }
                freshness => match entry.decode::<T>() {
                    Ok(value) => {
                        if freshness == Freshness::Stale {
                            self.spawn_refresh(key, &entry);
                        }
                        return Some(value);
                    }
                    Err(e) => {
                        debug!(key, error = %e, "discarding undecodable memory entry");
                        self.inner.memory.delete(key);
                        self.forget(key);
                    }
                },
            }
        }

        if let Some(entry) = self.inner.durable.get(key).await {
            match self.classify(&entry, category, now) {
                Freshness::Evicted => {
                    self.inner.durable.delete(key).await;
                    self.forget(key);
                }
                freshness => match entry.decode::<T>() {
                    Ok(value) => {
                        if freshness == Freshness::Stale {
                            self.spawn_refresh(key, &entry);
                        }
                        self.inner.tags.register(key, entry.category, &entry.tags);
                        self.inner.memory.promote(key, entry);
                        return Some(value);
                    }
                    Err(e) => {
                        debug!(key, error = %e, "discarding undecodable durable entry");
                        self.inner.durable.delete(key).await;
                        self.forget(key);
                    }
                },
            }
        }

        let external = self.external()?;
        match external.get(key).await {
            Ok(Some(value)) => match T::deserialize(value) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(key, error = %e, "external value does not decode");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(key, error = %e, "external cache read failed");
                None
            }
        }
    }

    fn spawn_refresh(&self, key: &str, entry: &StoredEntry) {
        let Some(ticket) = self.inner.refreshing.try_begin(key) else {
            return;
        };
        self.inner.metrics.record_refresh();

        let manager = self.clone();
        let options = SetOptions::for_entry(entry);
        tokio::spawn(async move {
            manager.refresh_now(ticket.key(), options).await;
            drop(ticket);
        });
    }

    async fn refresh_now(&self, key: &str, options: SetOptions) {
        match self.loader(key) {
            Some(loader) => match loader().await {
                Ok(value) => {
                    if let Err(e) = self.write(key, value, &options).await {
                        warn!(key, error = %e, "refreshed value rejected");
                    } else {
                        debug!(key, "background refresh finished");
                    }
                }
                Err(message) => debug!(key, error = %message, "background refresh failed"),
            },
            None => {
                let Some(external) = self.external() else {
                    return;
                };
                if let Err(e) = external.invalidate_matching(&|k: &str| k == key).await {
                    debug!(key, error = %e, "external invalidation failed");
                }
            }
        }
    }

    /// Supply the loader used when a stale read of `key` triggers a refresh
    pub fn register_loader<T, E, F, Fut>(&self, key: &str, loader: F)
    where
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let loader: RefreshLoader = Arc::new(move || {
            let load = loader();
            async move {
                let value = load.await.map_err(|e| e.to_string())?;
                serde_json::to_value(&value).map_err(|e| e.to_string())
            }
            .boxed()
        });
        self.inner.loaders.write().insert(key.to_string(), loader);
    }

    pub fn unregister_loader(&self, key: &str) -> bool {
        self.inner.loaders.write().remove(key).is_some()
    }

    /// Write `value` to memory, to the durable tier when the category
    /// persists, and through to the external cache
    ///
    /// Fails only when `value` cannot be serialized or the overrides in
    /// `options` produce an invalid policy.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: impl Into<SetOptions>,
    ) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })?;
        self.write(key, value, &options.into()).await
    }

    async fn write(&self, key: &str, value: serde_json::Value, options: &SetOptions) -> Result<()> {
        let base = self
            .inner
            .overrides
            .get(&options.category)
            .copied()
            .unwrap_or_default();
        let policy = resolve(options.category, &base.merged_with(&options.overrides))?;

        let entry = CacheEntry::new(value, &policy, self.inner.clock.now())
            .with_tags(options.tags.iter().cloned())
            .with_version(options.version.clone());
        let external_value = entry.data.clone();

        self.inner.memory.set(key, entry.clone());
        self.inner.tags.register(key, entry.category, &entry.tags);
        let persisted = policy.persist && self.inner.durable.set(key, &entry).await;
        if !persisted {
            // A superseded durable copy must not resurface once memory lets go
            self.inner.durable.delete(key).await;
            debug!(key, "entry kept in memory only");
        }
        if let Some(external) = self.external() {
            if let Err(e) = external.set(key, external_value).await {
                debug!(key, error = %e, "external cache write failed");
            }
        }

        self.inner.metrics.record_set();
        Ok(())
    }

    /// Remove `key` from every tier
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.inner.memory.delete(key);
        removed |= self.inner.durable.delete(key).await;
        self.inner.tags.unregister(key);
        if let Some(external) = self.external() {
            match external.invalidate_matching(&|k: &str| k == key).await {
                Ok(count) => removed |= count > 0,
                Err(e) => debug!(key, error = %e, "external invalidation failed"),
            }
        }
        self.inner.metrics.record_invalidations(1);
        removed
    }

    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        self.invalidate_by_tags(&[tag]).await
    }

    /// Drop every entry carrying any of `tags`
    ///
    /// Returns removals summed over the tiers; an entry held by two tiers
    /// counts twice.
    pub async fn invalidate_by_tags(&self, tags: &[&str]) -> usize {
        let memory = self
            .inner
            .memory
            .delete_where(|_, entry| tags.iter().any(|tag| entry.has_tag(tag)));

        let mut durable = 0;
        for tag in tags {
            durable += self.inner.durable.delete_by_tag(tag).await;
        }

        let keys: HashSet<String> = self.inner.tags.take_tagged(tags).into_iter().collect();
        let external = self.invalidate_external(&keys).await;

        let total = memory + durable + external;
        self.inner.metrics.record_invalidations(total as u64);
        debug!(?tags, memory, durable, external, "invalidated by tag");
        total
    }

    async fn invalidate_external(&self, keys: &HashSet<String>) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let Some(external) = self.external() else {
            return 0;
        };
        match external
            .invalidate_matching(&|key: &str| keys.contains(key))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                debug!(error = %e, "external invalidation failed");
                0
            }
        }
    }

    /// Return the cached value for `key`, or run `loader` and cache its result
    ///
    /// Concurrent preloads of the same key share one loader call. A loader
    /// error is returned unchanged and nothing is cached.
    pub async fn preload<T, E, F, Fut>(
        &self,
        key: &str,
        loader: F,
        options: impl Into<SetOptions>,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key, None).await {
            return Ok(value);
        }

        let _lock = self.inner.preloads.lock(key).await;
        if let Some(value) = self.lookup(key, None).await {
            self.inner.metrics.record_hit();
            return Ok(value);
        }

        let value = loader().await?;
        if let Err(e) = self.set(key, &value, options).await {
            warn!(key, error = %e, "preloaded value not cached");
        }
        Ok(value)
    }

    /// Purge evicted memory entries and durable records past the hard age
    /// limit. Static entries are never touched.
    pub async fn cleanup(&self) -> CleanupReport {
        let now = self.inner.clock.now();
        let mut purged = Vec::new();
        let memory_purged = self.inner.memory.delete_where(|key, entry| {
            let evicted = !entry.is_static() && entry.freshness(now) == Freshness::Evicted;
            if evicted {
                purged.push(key.to_string());
            }
            evicted
        });
        for key in &purged {
            self.forget(key);
        }
        let durable_purged = self
            .inner
            .durable
            .delete_older_than(self.inner.settings.durable_max_age(), CacheCategory::Static)
            .await;

        let report = CleanupReport {
            memory_purged,
            durable_purged,
        };
        debug!(memory_purged, durable_purged, "cache cleanup finished");
        report
    }

    /// Counters plus memory residency by category and tag
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.inner.metrics.snapshot();
        for (_, entry) in self.inner.memory.iterate() {
            *stats.by_category.entry(entry.category).or_default() += 1;
            for tag in &entry.tags {
                *stats.by_tag.entry(tag.clone()).or_default() += 1;
            }
            stats.memory_entries += 1;
        }
        stats.approximate_bytes = self.inner.memory.approximate_bytes();
        stats
    }

    pub fn reset_stats(&self) {
        self.inner.metrics.reset();
    }

    /// Drop every non-static entry from every tier
    pub async fn clear(&self) -> usize {
        let memory = self.inner.memory.delete_where(|_, entry| !entry.is_static());
        let durable = self.inner.durable.clear(CacheCategory::Static).await;
        let keys: HashSet<String> = self
            .inner
            .tags
            .take_excluding(CacheCategory::Static)
            .into_iter()
            .collect();
        let external = self.invalidate_external(&keys).await;

        let total = memory + durable + external;
        self.inner.metrics.record_invalidations(total as u64);
        info!(memory, durable, external, "cache cleared");
        total
    }
}
