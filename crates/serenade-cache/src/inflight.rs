//! Per-key coordination primitives
//!
//! [`KeyedLocks`] serialises loads of the same key so concurrent preloads
//! share one loader call. [`RefreshGuard`] allows at most one background
//! refresh per key.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of per-key async locks, pruned as holders release them
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyLock<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyLock {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
            lock: Some(lock),
        }
    }

    /// Keys with a holder or waiter
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held lock on one key; releasing the last reference prunes the map entry
pub struct KeyLock<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    lock: Option<Arc<AsyncMutex<()>>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.lock.take();
        let mut locks = self.owner.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Set of keys with a background refresh in flight
#[derive(Debug, Default)]
pub struct RefreshGuard {
    keys: Mutex<HashSet<String>>,
}

impl RefreshGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`; `None` if a refresh for it is already running
    pub fn try_begin(self: &Arc<Self>, key: &str) -> Option<RefreshTicket> {
        if self.keys.lock().insert(key.to_string()) {
            Some(RefreshTicket {
                owner: Arc::clone(self),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_refreshing(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its key when the refresh finishes, however it finishes
#[derive(Debug)]
pub struct RefreshTicket {
    owner: Arc<RefreshGuard>,
    key: String,
}

impl RefreshTicket {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RefreshTicket {
    fn drop(&mut self) {
        self.owner.keys.lock().remove(&self.key);
    }
}
