//! # Serenade Cache
//!
//! Tiered client-side cache for Serenade with category-driven freshness,
//! stale-while-revalidate reads and tag-based invalidation.
//!
//! ## Features
//!
//! - **Strategy catalog**: `static`, `dynamic`, `realtime` and `session` policies
//! - **Memory tier**: process-local map serving the hot path
//! - **Durable store**: SQLite primary engine with a quota-bounded file fallback
//! - **External pass-through**: any reactive query cache as a last-resort tier
//! - **Stale-while-revalidate**: at most one background refresh per key
//! - **Preload de-duplication**: concurrent loads of a key share one loader call
//! - **Statistics**: hit/miss counters plus residency by category and tag

pub mod adapter;
pub mod category;
pub mod clock;
pub mod durable;
pub mod entry;
pub mod error;
pub mod external;
pub mod inflight;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod settings;
pub mod tags;

pub use adapter::CachedQuery;
pub use category::{resolve, resolve_named, CacheCategory, CachePolicy, PolicyOverrides};
pub use clock::{Clock, ManualClock, SystemClock};
pub use durable::{DurableEngine, DurableStore, FileEngine, IndexedEngine, SqliteEngine};
pub use entry::{CacheEntry, EntryPolicy, Freshness, StoredEntry};
pub use error::CacheError;
pub use external::{ExternalCache, InMemoryExternalCache};
pub use manager::{CacheManager, CacheManagerBuilder, CleanupReport, SetOptions};
pub use memory::MemoryTier;
pub use metrics::{CacheMetrics, CacheStats};
pub use settings::CacheSettings;

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, CacheError>;
