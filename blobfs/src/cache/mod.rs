//! Capacity- and TTL-bounded caches
//!
//! Responsibilities:
//! - `TtlCache<V>`: string-keyed map with a hard capacity and an optional per-entry expiry,
//!   instantiated for the files-attribute cache, the open-handle table and the reader slots.
//! - `Invalidator`: applies the path invalidation rule to the caches and publishes it to
//!   peer processes through the message bus.
//!
//! Submodules:
//! - `invalidate`: invalidation rule + broadcast

pub mod invalidate;

pub use invalidate::Invalidator;

use crate::config::CacheSettings;
use crate::error::{FsError, FsResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// A string-keyed cache with a hard entry limit.
///
/// The lock only guards the map itself; callers never hold it across an await.
pub struct TtlCache<V> {
    name: &'static str,
    capacity: usize,
    ttl: Option<Duration>,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: &'static str, capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            name,
            capacity,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(name: &'static str, settings: CacheSettings) -> Self {
        Self::new(name, settings.capacity, settings.ttl)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<V>>> {
        // 缓存内容不依赖临界区内的不变量，poison 后继续使用即可
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts or replaces `key`. Every insert first drops expired entries; if the cache is
    /// still full a new key fails with `CacheFull`.
    pub fn put(&self, key: impl Into<String>, value: V) -> FsResult<()> {
        let key = key.into();
        let now = Instant::now();
        let mut map = self.lock();
        map.retain(|_, e| !e.expired(now));
        if !map.contains_key(&key) && map.len() >= self.capacity {
            return Err(FsError::CacheFull {
                cache: self.name,
                capacity: self.capacity,
            });
        }
        let expires_at = self.ttl.map(|ttl| now + ttl);
        map.insert(key, Entry { value, expires_at });
        Ok(())
    }

    /// Returns the live value for `key`. Expired entries read as a miss but stay in the map
    /// until the next sweep.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|e| !e.expired(now))
            .map(|e| e.value.clone())
    }

    /// Membership check that ignores expiry.
    pub fn has(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        self.lock().remove(key).map(|e| e.value)
    }

    /// Removes every key that starts with `prefix` (plain string prefix) and returns how many.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|k, _| !k.starts_with(prefix));
        before - map.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries at this instant.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(_, e)| !e.expired(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}
