//! Freshness, invalidation and preload behaviour of the cache manager

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use serenade_cache::{
    CacheCategory, CacheManager, DurableStore, InMemoryExternalCache, ManualClock,
    PolicyOverrides, SetOptions,
};

fn manager(clock: &ManualClock) -> CacheManager {
    CacheManager::builder()
        .durable(DurableStore::in_memory().unwrap())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

/// stale after 100ms, evicted after 10s
fn short_window() -> SetOptions {
    SetOptions::new(CacheCategory::Dynamic).overrides(
        PolicyOverrides::new()
            .stale_after(Duration::from_millis(100))
            .evict_after(Duration::from_millis(10_000)),
    )
}

fn counting_loader(
    manager: &CacheManager,
    key: &str,
    calls: &Arc<AtomicUsize>,
) {
    let calls = Arc::clone(calls);
    manager.register_loader(key, move || {
        let calls = Arc::clone(&calls);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, String>(format!("lyrics v{n}"))
        }
    });
}

#[tokio::test]
async fn test_set_then_get_roundtrips_from_memory() {
    let clock = ManualClock::default();
    let manager = manager(&clock);

    manager
        .set("song:1", &"Happy Birthday", CacheCategory::Static)
        .await
        .unwrap();
    let found: Option<String> = manager.get("song:1", None).await;

    assert_eq!(found.as_deref(), Some("Happy Birthday"));
    assert_eq!(manager.stats().hits, 1);
    assert_eq!(manager.stats().misses, 0);
}

#[tokio::test]
async fn test_fresh_read_does_not_refresh() {
    let clock = ManualClock::default();
    let manager = manager(&clock);
    let calls = Arc::new(AtomicUsize::new(0));
    counting_loader(&manager, "lyrics:1", &calls);

    manager
        .set("lyrics:1", &"lyrics v0", short_window())
        .await
        .unwrap();
    clock.advance(Duration::from_millis(50));

    let found: Option<String> = manager.get("lyrics:1", None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(found.as_deref(), Some("lyrics v0"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.stats().refreshes, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stale_reads_refresh_once() {
    let clock = ManualClock::default();
    let manager = manager(&clock);
    let calls = Arc::new(AtomicUsize::new(0));
    counting_loader(&manager, "lyrics:1", &calls);

    manager
        .set("lyrics:1", &"lyrics v0", short_window())
        .await
        .unwrap();
    clock.advance(Duration::from_millis(150));

    let reads = (0..10).map(|_| {
        let manager = manager.clone();
        async move { manager.get::<String>("lyrics:1", None).await }
    });
    let served = join_all(reads).await;

    assert!(served
        .iter()
        .all(|value| value.as_deref() == Some("lyrics v0")));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().refreshes, 1);

    let refreshed: Option<String> = manager.get("lyrics:1", None).await;
    assert_eq!(refreshed.as_deref(), Some("lyrics v1"));
}

#[tokio::test]
async fn test_entry_past_eviction_is_not_served() {
    let clock = ManualClock::default();
    let manager = manager(&clock);

    manager
        .set("lyrics:1", &"lyrics v0", short_window())
        .await
        .unwrap();
    clock.advance(Duration::from_millis(10_050));

    let found: Option<String> = manager.get("lyrics:1", None).await;
    assert!(found.is_none());
    assert_eq!(manager.stats().memory_entries, 0);
    assert_eq!(manager.stats().misses, 1);
}

#[tokio::test]
async fn test_cleanup_purges_evicted_entries() {
    let clock = ManualClock::default();
    let manager = manager(&clock);

    manager
        .set("lyrics:1", &"lyrics v0", short_window())
        .await
        .unwrap();
    manager
        .set("catalog", &vec!["intro", "outro"], CacheCategory::Static)
        .await
        .unwrap();
    clock.advance(Duration::from_millis(10_050));

    let report = manager.cleanup().await;
    assert_eq!(report.memory_purged, 1);
    assert_eq!(manager.stats().memory_entries, 1);
}

#[tokio::test]
async fn test_invalidate_by_tag_spares_other_tags() {
    let clock = ManualClock::default();
    let manager = manager(&clock);

    manager
        .set("k1", &1u32, SetOptions::new(CacheCategory::Dynamic).tag("x"))
        .await
        .unwrap();
    manager
        .set(
            "k2",
            &2u32,
            SetOptions::new(CacheCategory::Dynamic).tags(["x", "y"]),
        )
        .await
        .unwrap();
    manager
        .set("k3", &3u32, SetOptions::new(CacheCategory::Dynamic).tag("y"))
        .await
        .unwrap();

    // Memory and durable copies both count
    assert_eq!(manager.invalidate_by_tag("x").await, 4);

    assert!(manager.get::<u32>("k1", None).await.is_none());
    assert!(manager.get::<u32>("k2", None).await.is_none());
    assert_eq!(manager.get::<u32>("k3", None).await, Some(3));

    let stats = manager.stats();
    assert_eq!(stats.by_tag.get("y"), Some(&1));
    assert!(!stats.by_tag.contains_key("x"));
}

#[tokio::test]
async fn test_invalidate_by_tags_reaches_external_cache() {
    let clock = ManualClock::default();
    let external = Arc::new(InMemoryExternalCache::new());
    let manager = CacheManager::builder()
        .durable(DurableStore::in_memory().unwrap())
        .clock(Arc::new(clock.clone()))
        .external(external.clone())
        .build()
        .unwrap();
    manager.init(None).await;

    manager
        .set("quiz:1", &1u32, SetOptions::new(CacheCategory::Session).tag("quiz"))
        .await
        .unwrap();
    manager
        .set("order:1", &2u32, SetOptions::new(CacheCategory::Session).tag("order"))
        .await
        .unwrap();
    // A key that merely contains a tag name is left alone
    manager
        .set("quiz-archive", &3u32, CacheCategory::Session)
        .await
        .unwrap();

    manager.invalidate_by_tags(&["quiz", "order"]).await;

    assert!(!external.contains("quiz:1"));
    assert!(!external.contains("order:1"));
    assert!(external.contains("quiz-archive"));
    manager.destroy();
}

#[tokio::test]
async fn test_clear_keeps_static_entries() {
    let clock = ManualClock::default();
    let manager = manager(&clock);

    manager
        .set("catalog", &"all songs", CacheCategory::Static)
        .await
        .unwrap();
    manager
        .set("recent", &"last played", CacheCategory::Dynamic)
        .await
        .unwrap();

    assert!(manager.clear().await >= 2);

    assert_eq!(
        manager.get::<String>("catalog", None).await.as_deref(),
        Some("all songs")
    );
    assert!(manager.get::<String>("recent", None).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_preloads_share_one_load() {
    let clock = ManualClock::default();
    let manager = manager(&clock);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            manager
                .preload(
                    "voice:42",
                    move || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(42u32)
                    },
                    CacheCategory::Dynamic,
                )
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(42));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Only the caller that ran the loader goes without a hit
    assert_eq!(manager.stats().hits, 9);
}

#[tokio::test]
async fn test_preload_loader_error_is_propagated() {
    let clock = ManualClock::default();
    let manager = manager(&clock);

    let failed: Result<u32, String> = manager
        .preload(
            "voice:7",
            || async { Err("network down".to_string()) },
            CacheCategory::Dynamic,
        )
        .await;
    assert_eq!(failed, Err("network down".to_string()));
    assert!(manager.get::<u32>("voice:7", None).await.is_none());

    let retried: Result<u32, String> = manager
        .preload("voice:7", || async { Ok(7) }, CacheCategory::Dynamic)
        .await;
    assert_eq!(retried, Ok(7));
}

#[tokio::test]
async fn test_stats_report_residency() {
    let clock = ManualClock::default();
    let manager = manager(&clock);

    manager
        .set("a", &"x", SetOptions::new(CacheCategory::Session).tag("user"))
        .await
        .unwrap();
    manager
        .set("b", &"y", SetOptions::new(CacheCategory::Realtime).tag("user"))
        .await
        .unwrap();
    let _: Option<String> = manager.get("missing", None).await;

    let stats = manager.stats();
    assert_eq!(stats.memory_entries, 2);
    assert_eq!(stats.by_category.get(&CacheCategory::Session), Some(&1));
    assert_eq!(stats.by_category.get(&CacheCategory::Realtime), Some(&1));
    assert_eq!(stats.by_tag.get("user"), Some(&2));
    assert_eq!(stats.sets, 2);
    assert_eq!(stats.misses, 1);
    assert!(stats.approximate_bytes > 0);

    manager.reset_stats();
    assert_eq!(manager.stats().sets, 0);
}
