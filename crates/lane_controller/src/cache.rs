//! Read-through lookup cache in front of the registry and directory.
//!
//! Cached values are derived data. Every controller-side mutation invalidates
//! the affected key, concurrent misses for one key collapse into a single
//! fetch, and a fetch that raced an invalidation never writes its result back.

use crate::config::CacheConfig;
use crate::directory::PlayerSession;
use crate::registry::{EvictionReason, InstanceSnapshot, RegistryObserver};
use dashmap::DashMap;
use lane_protocol::{InstanceId, PlayerId};
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

struct Cached<V> {
    value: V,
    inserted_at: Instant,
}

/// Hit/miss counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded, time-limited read-through cache.
pub struct ReadThroughCache<K, V> {
    name: &'static str,
    enabled: bool,
    ttl: Duration,
    entries: Mutex<LruCache<K, Cached<V>>>,
    inflight: DashMap<K, Arc<tokio::sync::Mutex<()>>>,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            enabled: config.enabled && config.max_entries > 0,
            ttl: config.ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: DashMap::new(),
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lookup(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(cached) if cached.inserted_at.elapsed() <= self.ttl => {
                return Some(cached.value.clone());
            }
            Some(_) => {}
            None => return None,
        }
        // Expired.
        entries.pop(key);
        None
    }

    /// Returns the cached value for `key`, or runs `fetch` against the
    /// authoritative store and caches its result.
    ///
    /// Errors from `fetch` are passed through and never cached.
    pub async fn get_or_fetch<E, F, Fut>(&self, key: &K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if !self.enabled {
            return fetch().await;
        }

        if let Some(value) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let result = {
            let _guard = gate.lock().await;

            // Whoever held the gate before us may have filled the entry.
            if let Some(value) = self.lookup(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!("{} cache miss", self.name);
                let epoch = self.epoch.load(Ordering::SeqCst);
                let fetched = fetch().await;
                if let Ok(value) = &fetched {
                    self.insert_if_current(key, value.clone(), epoch);
                }
                fetched
            }
        };

        self.inflight
            .remove_if(key, |_, held| Arc::ptr_eq(held, &gate) && Arc::strong_count(held) <= 2);
        result
    }

    fn insert_if_current(&self, key: &K, value: V, epoch: u64) {
        let mut entries = self.entries.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            trace!("{} cache skipped write-back after concurrent invalidation", self.name);
            return;
        }
        entries.put(
            key.clone(),
            Cached {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        if !self.enabled {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().pop(key);
    }

    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

/// The controller's two lookup caches.
pub struct LookupCache {
    pub instances: ReadThroughCache<InstanceId, InstanceSnapshot>,
    pub players: ReadThroughCache<PlayerId, PlayerSession>,
}

impl LookupCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            instances: ReadThroughCache::new("instance", config),
            players: ReadThroughCache::new("player", config),
        }
    }

    pub fn clear(&self) {
        self.instances.clear();
        self.players.clear();
    }
}

impl RegistryObserver for LookupCache {
    fn on_instance_changed(&self, instance: &InstanceId) {
        self.instances.invalidate(instance);
    }

    fn on_instance_evicted(&self, instance: &InstanceSnapshot, _reason: EvictionReason) {
        self.instances.invalidate(&instance.id);
    }
}
