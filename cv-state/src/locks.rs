//! Per-key mutual exclusion with entries that disappear once nobody uses them.
//!
//! Each entry is an `Arc<Mutex<()>>`. Holders and waiters own a clone, so the
//! map's own reference is the only one left when a key goes idle; the last
//! guard to drop removes it.

use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Clone for KeyLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K> Default for KeyLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }
}

impl<K> KeyLocks<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the key is free and hold it until the guard drops.
    pub async fn acquire(&self, key: &K) -> KeyGuard<K> {
        let mut waiting = Waiting {
            key,
            locks: &self.locks,
            armed: true,
        };
        let guard = self.entry(key).lock_owned().await;
        waiting.armed = false;
        KeyGuard {
            key: key.clone(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Take the key only if nobody holds it right now.
    pub fn try_acquire(&self, key: &K) -> Option<KeyGuard<K>> {
        let mutex = self.entry(key);
        match mutex.clone().try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                key: key.clone(),
                locks: self.locks.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                // The holder may have released between our clone and the drop.
                drop(mutex);
                self.locks
                    .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
                tracing::trace!(?key, "key lock contended");
                None
            }
        }
    }

    /// Non-blocking probe used by state queries.
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .map(|entry| entry.value().try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn entry(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

/// Reclaims the entry if an `acquire` is dropped before it gets the lock.
/// Declared before the pending `lock_owned` future, so that future (and its
/// clone of the entry) is gone by the time this runs.
struct Waiting<'a, K>
where
    K: Eq + Hash + Clone,
{
    key: &'a K,
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    armed: bool,
}

impl<K> Drop for Waiting<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if self.armed {
            self.locks
                .remove_if(self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

pub struct KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // `remove_if` runs under the shard lock, so no task can clone the entry
        // between the count check and the removal.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
