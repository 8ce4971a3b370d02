//! Request-or-populate binding for consumer code
//!
//! A [`CachedQuery`] ties one key to its loader and write options so a view
//! can ask for data without knowing which tier serves it.

use std::{fmt::Display, future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::manager::{CacheManager, SetOptions};

type QueryLoader<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

pub struct CachedQuery<T, E> {
    manager: CacheManager,
    key: String,
    options: SetOptions,
    loader: QueryLoader<T, E>,
}

impl<T, E> CachedQuery<T, E>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    E: Display + Send + 'static,
{
    /// Bind `key` to `loader`; the loader also serves background refreshes
    pub fn new<F, Fut>(
        manager: &CacheManager,
        key: impl Into<String>,
        options: impl Into<SetOptions>,
        loader: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.into();
        let loader: QueryLoader<T, E> = Arc::new(move || loader().boxed());

        let refresh = Arc::clone(&loader);
        manager.register_loader(&key, move || refresh());

        Self {
            manager: manager.clone(),
            key,
            options: options.into(),
            loader,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cached value if any tier has one, otherwise load and cache
    pub async fn fetch(&self) -> Result<T, E> {
        let loader = Arc::clone(&self.loader);
        self.manager
            .preload(&self.key, move || loader(), self.options.clone())
            .await
    }

    /// Cached value without loading
    pub async fn peek(&self) -> Option<T> {
        self.manager.get(&self.key, None).await
    }

    pub async fn invalidate(&self) -> bool {
        self.manager.delete(&self.key).await
    }

    /// Load unconditionally and overwrite the cached value
    pub async fn refresh(&self) -> Result<T, E> {
        let value = (self.loader)().await?;
        if let Err(e) = self
            .manager
            .set(&self.key, &value, self.options.clone())
            .await
        {
            warn!(key = %self.key, error = %e, "refreshed value not cached");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{category::CacheCategory, durable::DurableStore};

    fn manager() -> CacheManager {
        CacheManager::builder()
            .durable(DurableStore::in_memory().unwrap())
            .build()
            .unwrap()
    }

    fn counting_query(
        manager: &CacheManager,
        calls: Arc<AtomicUsize>,
    ) -> CachedQuery<Vec<String>, String> {
        CachedQuery::new(
            manager,
            "playlist:chill",
            SetOptions::new(CacheCategory::Dynamic).tag("playlists"),
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![format!("song-{n}")])
                }
            },
        )
    }

    #[tokio::test]
    async fn test_fetch_loads_once_then_serves_cache() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&manager, Arc::clone(&calls));

        assert!(query.peek().await.is_none());
        assert_eq!(query.fetch().await.unwrap(), vec!["song-0"]);
        assert_eq!(query.fetch().await.unwrap(), vec!["song-0"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.peek().await, Some(vec!["song-0".to_string()]));
    }

    #[tokio::test]
    async fn test_refresh_overwrites_and_invalidate_drops() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&manager, Arc::clone(&calls));

        query.fetch().await.unwrap();
        assert_eq!(query.refresh().await.unwrap(), vec!["song-1"]);
        assert_eq!(query.peek().await, Some(vec!["song-1".to_string()]));

        assert!(query.invalidate().await);
        assert!(query.peek().await.is_none());
        assert_eq!(query.key(), "playlist:chill");
    }

    #[tokio::test]
    async fn test_loader_error_is_returned() {
        let manager = manager();
        let query: CachedQuery<u32, String> = CachedQuery::new(
            &manager,
            "broken",
            CacheCategory::Dynamic,
            || async { Err("upstream unavailable".to_string()) },
        );

        assert_eq!(query.fetch().await.unwrap_err(), "upstream unavailable");
        assert!(query.peek().await.is_none());
    }
}
