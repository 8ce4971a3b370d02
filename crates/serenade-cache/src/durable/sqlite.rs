//! SQLite-backed primary engine
//!
//! Entries live in `cache_entries`; tags in `cache_entry_tags`, indexed by
//! tag so group invalidation never scans the entry table. Every multi-row
//! change runs in one transaction.

use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::engine::{DurableEngine, DurableRecord, IndexedEngine, RecordInfo};
use crate::{category::CacheCategory, CacheError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS cache_entry_tags (
    key TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (key, tag)
);
CREATE INDEX IF NOT EXISTS idx_cache_entry_tags_tag ON cache_entry_tags(tag);
CREATE INDEX IF NOT EXISTS idx_cache_entries_updated ON cache_entries(updated_at_ms);
CREATE INDEX IF NOT EXISTS idx_cache_entries_category ON cache_entries(category);
";

/// Transactional engine with tag, age and category indices
#[derive(Clone)]
pub struct SqliteEngine {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEngine {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened sqlite cache database");
        Self::init(conn)
    }

    /// Private database that disappears with the engine
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await?
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_category(raw: &str) -> Result<CacheCategory> {
    raw.parse().map_err(|_| CacheError::Storage {
        engine: "sqlite",
        message: format!("unknown category in database: {raw}"),
    })
}

#[async_trait]
impl DurableEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run(move |conn| {
            let payload = conn
                .query_row(
                    "SELECT payload FROM cache_entries WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(payload)
        })
        .await
    }

    async fn put(&self, record: &DurableRecord) -> Result<()> {
        let record = record.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO cache_entries (key, category, updated_at_ms, payload)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    category = excluded.category,
                    updated_at_ms = excluded.updated_at_ms,
                    payload = excluded.payload",
                params![
                    record.key,
                    record.category.as_str(),
                    record.updated_at.timestamp_millis(),
                    record.payload
                ],
            )?;
            tx.execute(
                "DELETE FROM cache_entry_tags WHERE key = ?1",
                params![record.key],
            )?;
            {
                let mut insert =
                    tx.prepare("INSERT INTO cache_entry_tags (key, tag) VALUES (?1, ?2)")?;
                for tag in &record.tags {
                    insert.execute(params![record.key, tag])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM cache_entry_tags WHERE key = ?1", params![key])?;
            let removed = tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM cache_entries")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn scan(&self) -> Result<Vec<RecordInfo>> {
        self.run(|conn| {
            let mut tags: HashMap<String, Vec<String>> = HashMap::new();
            {
                let mut stmt = conn.prepare("SELECT key, tag FROM cache_entry_tags")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (key, tag) = row?;
                    tags.entry(key).or_default().push(tag);
                }
            }

            let mut stmt = conn.prepare(
                "SELECT key, category, updated_at_ms, length(key) + length(payload)
                 FROM cache_entries",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(key, category, updated_at_ms, size)| {
                    Ok(RecordInfo {
                        tags: tags.remove(&key).unwrap_or_default().into_iter().collect(),
                        key,
                        category: parse_category(&category)?,
                        updated_at: millis_to_datetime(updated_at_ms),
                        size_bytes: size.max(0) as u64,
                    })
                })
                .collect()
        })
        .await
    }
}

#[async_trait]
impl IndexedEngine for SqliteEngine {
    async fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        let tag = tag.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM cache_entries
                 WHERE key IN (SELECT key FROM cache_entry_tags WHERE tag = ?1)",
                params![tag],
            )?;
            tx.execute(
                "DELETE FROM cache_entry_tags
                 WHERE key NOT IN (SELECT key FROM cache_entries)",
                [],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        excluding: CacheCategory,
    ) -> Result<usize> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM cache_entries WHERE updated_at_ms < ?1 AND category != ?2",
                params![cutoff_ms, excluding.as_str()],
            )?;
            tx.execute(
                "DELETE FROM cache_entry_tags
                 WHERE key NOT IN (SELECT key FROM cache_entries)",
                [],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn clear_excluding(&self, excluding: CacheCategory) -> Result<usize> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM cache_entries WHERE category != ?1",
                params![excluding.as_str()],
            )?;
            tx.execute(
                "DELETE FROM cache_entry_tags
                 WHERE key NOT IN (SELECT key FROM cache_entries)",
                [],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn keys_in_category(&self, category: CacheCategory) -> Result<Vec<String>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT key FROM cache_entries WHERE category = ?1")?;
            let keys = stmt
                .query_map(params![category.as_str()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;

    fn record(key: &str, category: CacheCategory, tags: &[&str], at: DateTime<Utc>) -> DurableRecord {
        DurableRecord {
            key: key.to_string(),
            category,
            updated_at: at,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            payload: format!("{{\"key\":\"{key}\"}}"),
        }
    }

    #[tokio::test]
    async fn test_sqlite_put_get_delete() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let now = Utc::now();

        engine
            .put(&record("a", CacheCategory::Dynamic, &["x"], now))
            .await
            .unwrap();
        assert_eq!(
            engine.get("a").await.unwrap().as_deref(),
            Some("{\"key\":\"a\"}")
        );
        assert!(engine.get("missing").await.unwrap().is_none());

        assert!(engine.delete("a").await.unwrap());
        assert!(!engine.delete("a").await.unwrap());
        assert!(engine.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_overwrite_replaces_tags() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let now = Utc::now();

        engine
            .put(&record("a", CacheCategory::Dynamic, &["x"], now))
            .await
            .unwrap();
        engine
            .put(&record("a", CacheCategory::Dynamic, &["y"], now))
            .await
            .unwrap();

        assert_eq!(engine.delete_by_tag("x").await.unwrap(), 0);
        assert_eq!(engine.delete_by_tag("y").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_delete_by_tag() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let now = Utc::now();
        engine.put(&record("k1", CacheCategory::Dynamic, &["x"], now)).await.unwrap();
        engine.put(&record("k2", CacheCategory::Dynamic, &["x", "y"], now)).await.unwrap();
        engine.put(&record("k3", CacheCategory::Dynamic, &["y"], now)).await.unwrap();

        assert_eq!(engine.delete_by_tag("x").await.unwrap(), 2);

        let infos = engine.scan().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].key, "k3");
        assert!(infos[0].tags.contains("y"));
    }

    #[tokio::test]
    async fn test_sqlite_delete_older_than_spares_static() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let now = Utc::now();
        let old = now - Duration::days(10);
        engine.put(&record("old-dyn", CacheCategory::Dynamic, &[], old)).await.unwrap();
        engine.put(&record("old-static", CacheCategory::Static, &[], old)).await.unwrap();
        engine.put(&record("new-dyn", CacheCategory::Dynamic, &[], now)).await.unwrap();

        let removed = engine
            .delete_older_than(now - Duration::days(7), CacheCategory::Static)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let mut keys = engine.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["new-dyn".to_string(), "old-static".to_string()]);
    }

    #[tokio::test]
    async fn test_sqlite_clear_and_category_index() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let now = Utc::now();
        engine.put(&record("s", CacheCategory::Static, &["t"], now)).await.unwrap();
        engine.put(&record("d", CacheCategory::Session, &["t"], now)).await.unwrap();

        assert_eq!(
            engine.keys_in_category(CacheCategory::Static).await.unwrap(),
            vec!["s".to_string()]
        );
        assert_eq!(engine.clear_excluding(CacheCategory::Static).await.unwrap(), 1);
        assert_eq!(engine.keys().await.unwrap(), vec!["s".to_string()]);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite3");
        let now = Utc::now();

        {
            let engine = SqliteEngine::open(&path).unwrap();
            engine.put(&record("k", CacheCategory::Session, &[], now)).await.unwrap();
        }

        let engine = SqliteEngine::open(&path).unwrap();
        assert!(engine.get("k").await.unwrap().is_some());
        let info = engine.scan().await.unwrap().remove(0);
        assert_eq!(info.category, CacheCategory::Session);
        assert_eq!(info.updated_at.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_sqlite_open_fails_on_directory() {
        let dir = TempDir::new().unwrap();
        assert!(SqliteEngine::open(dir.path()).is_err());
    }
}
