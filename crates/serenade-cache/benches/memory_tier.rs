//! Benchmarks for the memory-tier hit path

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use serenade_cache::{
    CacheCategory, CacheEntry, CacheManager, DurableStore, MemoryTier, StoredEntry,
};

fn sample_entry(i: usize) -> StoredEntry {
    CacheEntry::new(
        json!({"id": i, "title": format!("song {i}"), "duration_ms": 180_000}),
        &CacheCategory::Dynamic.defaults(),
        chrono::Utc::now(),
    )
    .with_tags(["songs"])
}

fn benchmark_memory_tier(c: &mut Criterion) {
    let tier = MemoryTier::with_capacity(1024);
    for i in 0..1024 {
        tier.set(&format!("song:{i}"), sample_entry(i));
    }

    c.bench_function("memory_tier_get_hit", |b| {
        b.iter(|| black_box(tier.get(black_box("song:512"))))
    });

    c.bench_function("memory_tier_set", |b| {
        let entry = sample_entry(0);
        b.iter(|| tier.set(black_box("song:0"), entry.clone()))
    });

    c.bench_function("memory_tier_approximate_bytes", |b| {
        b.iter(|| black_box(tier.approximate_bytes()))
    });
}

fn benchmark_manager_get(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let manager = CacheManager::builder()
        .durable(DurableStore::in_memory().unwrap())
        .build()
        .unwrap();
    runtime
        .block_on(manager.set("song:1", &"Happy Birthday", CacheCategory::Static))
        .unwrap();

    c.bench_function("manager_get_memory_hit", |b| {
        b.iter(|| {
            let found: Option<String> = runtime.block_on(manager.get(black_box("song:1"), None));
            black_box(found)
        })
    });
}

criterion_group!(benches, benchmark_memory_tier, benchmark_manager_get);
criterion_main!(benches);
