//! Thread-safe stores for resolution results.
//!
//! [`EvaluationCache`] is the storage contract, implemented by an unbounded [`MapCache`] and a
//! bounded [`LruCache`]. [`ResolutionCache`] is what the client actually holds: a cache of
//! [`Static`](crate::Reason::Static) resolution details that can be switched off permanently once
//! the change stream can no longer keep it fresh.
use std::{
    collections::HashMap,
    hash::Hash,
    num::NonZeroUsize,
    sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{config::CacheKind, details::ResolutionDetail, FlagValue};

/// Storage contract shared by all cache implementations.
pub trait EvaluationCache<K, V>: Send + Sync {
    /// Insert or replace `key`. Returns `true` if another entry had to be evicted to make room.
    fn add(&self, key: K, value: V) -> bool;

    fn get(&self, key: &K) -> Option<V>;

    /// Remove `key`. Returns `true` if it was present.
    fn remove(&self, key: &K) -> bool;

    /// Remove all entries.
    fn purge(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded map-backed cache. Never evicts.
pub struct MapCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> MapCache<K, V> {
    pub fn new() -> Self {
        MapCache {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for MapCache<K, V> {
    fn default() -> Self {
        MapCache::new()
    }
}

impl<K, V> EvaluationCache<K, V> for MapCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn add(&self, key: K, value: V) -> bool {
        self.entries
            .write()
            .expect("thread holding cache lock should not panic")
            .insert(key, value);
        false
    }

    fn get(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .expect("thread holding cache lock should not panic")
            .get(key)
            .cloned()
    }

    fn remove(&self, key: &K) -> bool {
        self.entries
            .write()
            .expect("thread holding cache lock should not panic")
            .remove(key)
            .is_some()
    }

    fn purge(&self) {
        self.entries
            .write()
            .expect("thread holding cache lock should not panic")
            .clear();
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .expect("thread holding cache lock should not panic")
            .len()
    }
}

/// Bounded cache that evicts the least-recently-used entry on overflow.
///
/// Lookups update recency, so every operation takes the same exclusive lock.
pub struct LruCache<K: Eq + Hash, V> {
    entries: Mutex<lru::LruCache<K, V>>,
}

impl<K: Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        LruCache {
            entries: Mutex::new(lru::LruCache::new(capacity)),
        }
    }
}

impl<K, V> EvaluationCache<K, V> for LruCache<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    fn add(&self, key: K, value: V) -> bool {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding cache lock should not panic");
        let replacing = entries.contains(&key);
        // `push` hands back the displaced entry: the old value when replacing, the LRU victim
        // otherwise.
        let displaced = entries.push(key, value);
        displaced.is_some() && !replacing
    }

    fn get(&self, key: &K) -> Option<V> {
        self.entries
            .lock()
            .expect("thread holding cache lock should not panic")
            .get(key)
            .cloned()
    }

    fn remove(&self, key: &K) -> bool {
        self.entries
            .lock()
            .expect("thread holding cache lock should not panic")
            .pop(key)
            .is_some()
    }

    fn purge(&self) {
        self.entries
            .lock()
            .expect("thread holding cache lock should not panic")
            .clear();
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("thread holding cache lock should not panic")
            .len()
    }
}

type DetailCache = dyn EvaluationCache<String, ResolutionDetail<FlagValue>>;

struct Store {
    cache: Option<Box<DetailCache>>,
    /// Bumped by every invalidation.
    generation: u64,
}

/// Cache of static resolution details keyed by flag key.
///
/// Writers pass the [generation](ResolutionCache::generation) they observed before fetching a
/// value. If anything was invalidated in the meantime the write is dropped, so a response that
/// raced with a change notification never lands in the cache.
///
/// Once [disabled](ResolutionCache::disable), the cache stays empty for the rest of the client's
/// life: lookups miss and insertions are ignored.
pub struct ResolutionCache {
    store: RwLock<Store>,
}

impl ResolutionCache {
    pub fn new(kind: CacheKind, capacity: NonZeroUsize) -> ResolutionCache {
        let cache: Option<Box<DetailCache>> = match kind {
            CacheKind::Lru => Some(Box::new(LruCache::<String, ResolutionDetail<FlagValue>>::new(
                capacity,
            ))),
            CacheKind::InMemory => {
                Some(Box::new(MapCache::<String, ResolutionDetail<FlagValue>>::new()))
            }
            CacheKind::Disabled => None,
        };
        ResolutionCache {
            store: RwLock::new(Store {
                cache,
                generation: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store
            .read()
            .expect("thread holding cache lock should not panic")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store
            .write()
            .expect("thread holding cache lock should not panic")
    }

    pub fn is_enabled(&self) -> bool {
        self.read().cache.is_some()
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn get(&self, flag_key: &str) -> Option<ResolutionDetail<FlagValue>> {
        self.read().cache.as_ref()?.get(&flag_key.to_owned())
    }

    /// Store `detail` for `flag_key` unless the cache was invalidated since `generation` was
    /// read, or is disabled. Returns `true` if another entry was evicted.
    pub fn add(
        &self,
        flag_key: &str,
        detail: ResolutionDetail<FlagValue>,
        generation: u64,
    ) -> bool {
        let store = self.read();
        let Some(cache) = store.cache.as_ref() else {
            return false;
        };
        if store.generation != generation {
            log::debug!(target: "flagd", flag_key; "cache was invalidated during resolution, not caching");
            return false;
        }
        cache.add(flag_key.to_owned(), detail)
    }

    pub fn remove(&self, flag_key: &str) -> bool {
        let mut store = self.write();
        store.generation += 1;
        store
            .cache
            .as_ref()
            .is_some_and(|cache| cache.remove(&flag_key.to_owned()))
    }

    pub fn purge(&self) {
        let mut store = self.write();
        store.generation += 1;
        if let Some(cache) = store.cache.as_ref() {
            cache.purge();
        }
    }

    /// Purge and switch the cache off. Safe to call repeatedly.
    pub fn disable(&self) {
        let mut store = self.write();
        store.generation += 1;
        if let Some(cache) = store.cache.take() {
            cache.purge();
            log::debug!(target: "flagd", "evaluation cache disabled");
        }
    }

    pub fn len(&self) -> usize {
        self.read().cache.as_ref().map_or(0, |cache| cache.len())
    }
}
