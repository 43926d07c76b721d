// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A sharded, reference-counted LRU cache used for both open table handles
//! and decoded blocks.
//!
//! Each shard keeps a hash table of entries plus an ordered list of keys
//! that are *only* held by the cache (`refs == 1`); an entry with an
//! outstanding external handle (`refs >= 2`) is skipped by eviction. This
//! mirrors the "in_use" / "lru" two-list split of a classic block cache,
//! implemented here with a plain `VecDeque` instead of an intrusive list
//! since cache sizes in this engine stay small enough that linear removal
//! from the eviction queue is not a bottleneck.

use rustc_hash::FxHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

const SHARD_COUNT: usize = 2;

struct Entry<V> {
    value: Arc<V>,
    charge: usize,
    refs: u32,
}

struct Shard<K, V> {
    capacity: usize,
    usage: usize,
    table: HashMap<K, Entry<V>, FxBuildHasher>,
    /// Keys with `refs == 1`, front = most recently used, back = next to evict.
    lru_order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self { capacity, usage: 0, table: HashMap::default(), lru_order: VecDeque::new() }
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.lru_order.iter().position(|k| k == key) {
            self.lru_order.remove(pos);
        }
    }

    fn evict_to_capacity(&mut self) {
        while self.usage > self.capacity {
            let Some(victim) = self.lru_order.pop_back() else { break };
            if let Some(entry) = self.table.remove(&victim) {
                self.usage = self.usage.saturating_sub(entry.charge);
            }
        }
    }
}

struct Inner<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
    hits: AtomicU32,
    misses: AtomicU32,
}

/// A sharded LRU cache holding `Arc<V>` values keyed by `K`.
pub struct LruCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for LruCache<K, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// A reference to a cached value. Releases the cache's internal refcount
/// when dropped, so callers never call an explicit `release` — RAII makes
/// the release exception- and early-return-safe.
pub struct CacheHandle<K: Eq + Hash + Clone, V> {
    cache: Arc<Inner<K, V>>,
    key: K,
    value: Arc<V>,
}

impl<K: Eq + Hash + Clone, V> std::ops::Deref for CacheHandle<K, V> {
    type Target = V;
    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K: Eq + Hash + Clone, V> Clone for CacheHandle<K, V> {
    fn clone(&self) -> Self {
        let shard = &self.cache.shards[shard_index(&self.key, self.cache.shards.len())];
        let mut shard = shard.lock().expect("cache shard mutex poisoned");
        if let Some(entry) = shard.table.get_mut(&self.key) {
            entry.refs += 1;
            shard.touch(&self.key);
        }
        Self { cache: Arc::clone(&self.cache), key: self.key.clone(), value: Arc::clone(&self.value) }
    }
}

impl<K: Eq + Hash + Clone, V> Drop for CacheHandle<K, V> {
    fn drop(&mut self) {
        let shard = &self.cache.shards[shard_index(&self.key, self.cache.shards.len())];
        let mut shard = shard.lock().expect("cache shard mutex poisoned");
        let Some(entry) = shard.table.get_mut(&self.key) else { return };
        entry.refs -= 1;
        if entry.refs == 1 {
            shard.lru_order.push_front(self.key.clone());
            shard.evict_to_capacity();
        } else if entry.refs == 0 {
            shard.table.remove(&self.key);
        }
    }
}

fn shard_index<K: Hash>(key: &K, shard_count: usize) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Creates a cache with `capacity` total charge units, split evenly
    /// across shards.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity / SHARD_COUNT).max(1);
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new(per_shard))).collect();
        Self { inner: Arc::new(Inner { shards, hits: AtomicU32::new(0), misses: AtomicU32::new(0) }) }
    }

    /// Looks up `key`, bumping its reference count on a hit.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<CacheHandle<K, V>> {
        let shard_ref = &self.inner.shards[shard_index(key, self.inner.shards.len())];
        let mut shard = shard_ref.lock().expect("cache shard mutex poisoned");
        match shard.table.get_mut(key) {
            Some(entry) => {
                entry.refs += 1;
                let value = Arc::clone(&entry.value);
                shard.touch(key);
                drop(shard);
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheHandle { cache: Arc::clone(&self.inner), key: key.clone(), value })
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts `value` under `key` charged at `charge` units, evicting
    /// least-recently-used entries until usage fits capacity. Returns a
    /// handle for the caller (the cache itself holds the other reference).
    #[must_use]
    pub fn insert(&self, key: K, value: V, charge: usize) -> CacheHandle<K, V> {
        let shard_ref = &self.inner.shards[shard_index(&key, self.inner.shards.len())];
        let mut shard = shard_ref.lock().expect("cache shard mutex poisoned");

        if let Some(old) = shard.table.remove(&key) {
            shard.usage = shard.usage.saturating_sub(old.charge);
            shard.touch(&key);
        }

        let value = Arc::new(value);
        shard.table.insert(key.clone(), Entry { value: Arc::clone(&value), charge, refs: 2 });
        shard.usage += charge;
        shard.evict_to_capacity();
        drop(shard);

        CacheHandle { cache: Arc::clone(&self.inner), key, value }
    }

    /// Removes `key` from the cache so future lookups miss. Any handle
    /// already issued for `key` stays valid until it is dropped.
    pub fn erase(&self, key: &K) {
        let shard_ref = &self.inner.shards[shard_index(key, self.inner.shards.len())];
        let mut shard = shard_ref.lock().expect("cache shard mutex poisoned");
        shard.touch(key);
        if let Some(entry) = shard.table.remove(key) {
            shard.usage = shard.usage.saturating_sub(entry.charge);
        }
    }

    /// Total charge currently held across all shards.
    #[must_use]
    pub fn usage(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().expect("cache shard mutex poisoned").usage).sum()
    }
}
