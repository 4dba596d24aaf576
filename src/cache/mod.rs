//! Keyed memoisation with strong, soft and weak entries.
//!
//! Soft and weak entries are kept in per-tier LRU order and may be dropped
//! whenever the cache is over capacity or the host signals memory pressure.
//! Weak entries always go first. Strong entries are only removed by
//! [`Cache::invalidate`].
//!
//! Every key owns a once-cell slot, so resolving a missing key runs the
//! resolver exactly once while other requesters of the same key block on
//! the slot, and requesters of other keys only contend on their shard lock
//! for the duration of a map lookup.

mod persist;

pub use persist::{NoPersistence, Persistor};

use lru::LruCache;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strength {
    Strong,
    /// Dropped only after every weak entry is gone
    Soft,
    Weak,
}

/// How much memory the host wants back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Drop weak entries
    Moderate,
    /// Drop weak and soft entries
    Critical,
}

type Resolver<K, V> = Arc<dyn Fn(&K) -> Option<V> + Send + Sync>;

struct Entry<V> {
    cell: Arc<OnceCell<V>>,
    strength: Strength,
    /// Not yet handed to the persistor
    dirty: bool,
}

struct Shard<K, V> {
    entries: HashMap<K, Entry<V>>,
    soft: LruCache<K, ()>,
    weak: LruCache<K, ()>,
}

impl<K: Hash + Eq + Clone, V> Shard<K, V> {
    fn new() -> Self {
        Shard {
            entries: HashMap::new(),
            soft: LruCache::unbounded(),
            weak: LruCache::unbounded(),
        }
    }

    fn reclaimable(&self) -> usize {
        self.soft.len() + self.weak.len()
    }

    fn touch(&mut self, key: &K, strength: Strength) {
        match strength {
            Strength::Strong => {}
            Strength::Soft => {
                self.soft.promote(key);
            }
            Strength::Weak => {
                self.weak.promote(key);
            }
        }
    }

    fn track(&mut self, key: &K, strength: Strength) {
        match strength {
            Strength::Strong => {}
            Strength::Soft => {
                self.soft.put(key.clone(), ());
            }
            Strength::Weak => {
                self.weak.put(key.clone(), ());
            }
        }
    }

    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        match entry.strength {
            Strength::Strong => {}
            Strength::Soft => {
                self.soft.pop(key);
            }
            Strength::Weak => {
                self.weak.pop(key);
            }
        }
        Some(entry)
    }

    /// Pop the least recently used entry of a reclaimable tier
    fn pop_victim(&mut self, tier: Strength) -> Option<(K, Entry<V>)> {
        let key = match tier {
            Strength::Weak => self.weak.pop_lru()?.0,
            Strength::Soft => self.soft.pop_lru()?.0,
            Strength::Strong => return None,
        };
        let entry = self.entries.remove(&key)?;
        Some((key, entry))
    }
}

pub struct Cache<K, V> {
    shards: Box<[Mutex<Shard<K, V>>]>,
    hasher: std::collections::hash_map::RandomState,
    strength: Strength,
    /// Upper bound on reclaimable entries per shard
    shard_capacity: usize,
    persistor: Option<Arc<dyn Persistor<K, V>>>,
    resolver: Option<Resolver<K, V>>,
}

pub struct CacheBuilder<K, V> {
    strength: Strength,
    capacity: usize,
    shards: usize,
    persistor: Option<Arc<dyn Persistor<K, V>>>,
    resolver: Option<Resolver<K, V>>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Strength of entries created by resolution and [`Cache::insert`]
    pub fn strength(mut self, strength: Strength) -> Self {
        self.strength = strength;
        self
    }

    /// Maximum number of soft and weak entries kept at once
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn persistor<P: Persistor<K, V> + 'static>(mut self, persistor: P) -> Self {
        self.persistor = Some(Arc::new(persistor));
        self
    }

    pub fn resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&K) -> Option<V> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn build(self) -> Cache<K, V> {
        let shards = self.shards.min(self.capacity.max(1));
        Cache {
            shards: (0..shards).map(|_| Mutex::new(Shard::new())).collect(),
            hasher: Default::default(),
            strength: self.strength,
            shard_capacity: self.capacity.div_ceil(shards).max(1),
            persistor: self.persistor,
            resolver: self.resolver,
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    const DEFAULT_CAPACITY: usize = 1 << 16;

    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder {
            strength: Strength::Weak,
            capacity: Self::DEFAULT_CAPACITY,
            shards: num_cpus::get().next_power_of_two() * 4,
            persistor: None,
            resolver: None,
        }
    }

    pub fn weak(capacity: usize) -> Cache<K, V> {
        Self::builder().capacity(capacity).build()
    }

    pub fn soft(capacity: usize) -> Cache<K, V> {
        Self::builder()
            .strength(Strength::Soft)
            .capacity(capacity)
            .build()
    }

    /// Entries stay until invalidated
    pub fn strong() -> Cache<K, V> {
        Self::builder().strength(Strength::Strong).build()
    }

    pub fn weak_with_persistor<P: Persistor<K, V> + 'static>(
        capacity: usize,
        persistor: P,
    ) -> Cache<K, V> {
        Self::builder().capacity(capacity).persistor(persistor).build()
    }

    pub fn soft_with_persistor<P: Persistor<K, V> + 'static>(
        capacity: usize,
        persistor: P,
    ) -> Cache<K, V> {
        Self::builder()
            .strength(Strength::Soft)
            .capacity(capacity)
            .persistor(persistor)
            .build()
    }

    pub fn default_strength(&self) -> Strength {
        self.strength
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, Shard<K, V>> {
        let i = self.hasher.hash_one(key) as usize % self.shards.len();
        // A panicking resolver never runs under the shard lock
        self.shards[i]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Value for `key` if it is currently cached, or can be rehydrated by
    /// the persistor, or produced by the cache's resolver.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(v) = self.peek(key) {
            return Some(v);
        }
        if self.persistor.is_none() && self.resolver.is_none() {
            return None;
        }
        let resolver = self.resolver.clone();
        self.get_or_try_insert_with(key, |k| match &resolver {
            Some(r) => r(k).ok_or(()),
            None => Err(()),
        })
        .ok()
    }

    /// Cached value only, no persistor or resolver
    pub fn peek(&self, key: &K) -> Option<V> {
        let mut shard = self.shard(key);
        let entry = shard.entries.get(key)?;
        let value = entry.cell.get()?.clone();
        let strength = entry.strength;
        shard.touch(key, strength);
        Some(value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Insert or replace with the default strength
    pub fn insert(&self, key: K, value: V) {
        self.put(key, value, self.strength)
    }

    /// Publish `value` for `key`, replacing any previous value.
    ///
    /// The value becomes visible to every requester at once.
    pub fn put(&self, key: K, value: V, strength: Strength) {
        let cell = Arc::new(OnceCell::with_value(value));
        let evicted = {
            let mut shard = self.shard(&key);
            shard.remove(&key);
            shard.entries.insert(
                key.clone(),
                Entry {
                    cell,
                    strength,
                    dirty: true,
                },
            );
            shard.track(&key, strength);
            self.enforce_capacity(&mut shard)
        };
        self.spill(evicted);
    }

    pub fn invalidate(&self, key: &K) {
        self.shard(key).remove(key);
    }

    /// Return the cached value or compute it with `f`.
    ///
    /// Concurrent callers for the same missing key share a single call of
    /// `f`.
    pub fn get_or_insert_with<F>(&self, key: &K, f: F) -> V
    where
        F: FnOnce(&K) -> V,
    {
        match self.get_or_try_insert_with(key, |k| Ok::<V, std::convert::Infallible>(f(k))) {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }

    /// Like [`Cache::get_or_insert_with`] for fallible computations.
    ///
    /// A failed computation leaves the key absent; the next requester
    /// tries again.
    pub fn get_or_try_insert_with<F, E>(&self, key: &K, f: F) -> Result<V, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        let cell = {
            let mut shard = self.shard(key);
            match shard.entries.get(key) {
                Some(entry) => {
                    let cell = entry.cell.clone();
                    let strength = entry.strength;
                    shard.touch(key, strength);
                    cell
                }
                None => {
                    let cell = Arc::new(OnceCell::new());
                    shard.entries.insert(
                        key.clone(),
                        Entry {
                            cell: cell.clone(),
                            strength: self.strength,
                            dirty: false,
                        },
                    );
                    // Tracked once filled, so a pending slot is never evicted
                    cell
                }
            }
        };
        if let Some(v) = cell.get() {
            return Ok(v.clone());
        }

        let mut filled = false;
        let mut resolved = false;
        let outcome = cell.get_or_try_init(|| {
            filled = true;
            if let Some(v) = self.rehydrate(key) {
                return Ok(v);
            }
            resolved = true;
            f(key)
        });
        match outcome {
            Ok(v) => {
                let v = v.clone();
                if filled {
                    let evicted = {
                        let mut shard = self.shard(key);
                        let strength = match shard.entries.get_mut(key) {
                            Some(entry) if Arc::ptr_eq(&entry.cell, &cell) => {
                                entry.dirty = resolved;
                                Some(entry.strength)
                            }
                            _ => None,
                        };
                        if let Some(strength) = strength {
                            shard.track(key, strength);
                        }
                        self.enforce_capacity(&mut shard)
                    };
                    self.spill(evicted);
                }
                Ok(v)
            }
            Err(e) => {
                let mut shard = self.shard(key);
                let stale = shard.entries.get(key).map_or(false, |entry| {
                    Arc::ptr_eq(&entry.cell, &cell) && entry.cell.get().is_none()
                });
                if stale {
                    shard.remove(key);
                }
                Err(e)
            }
        }
    }

    fn rehydrate(&self, key: &K) -> Option<V> {
        let persistor = self.persistor.as_ref()?;
        match persistor.load(key) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to load persisted cache entry: {:#}", e);
                None
            }
        }
    }

    /// Evict reclaimable entries until the shard is within capacity
    fn enforce_capacity(&self, shard: &mut Shard<K, V>) -> Vec<(K, Entry<V>)> {
        let mut evicted = vec![];
        while shard.reclaimable() > self.shard_capacity {
            match shard
                .pop_victim(Strength::Weak)
                .or_else(|| shard.pop_victim(Strength::Soft))
            {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }
        evicted
    }

    /// Hand dirty evicted values to the persistor. Failures only lose the
    /// entry.
    fn spill(&self, evicted: Vec<(K, Entry<V>)>) {
        let Some(persistor) = &self.persistor else {
            return;
        };
        for (key, entry) in evicted {
            if !entry.dirty {
                continue;
            }
            if let Some(v) = entry.cell.get() {
                if let Err(e) = persistor.store(&key, v) {
                    warn!("Failed to persist evicted cache entry: {:#}", e);
                }
            }
        }
    }

    /// Drop reclaimable entries in response to host memory pressure
    pub fn release_memory(&self, pressure: MemoryPressure) -> usize {
        let mut released = 0;
        for shard in self.shards.iter() {
            let evicted = {
                let mut shard = shard.lock().unwrap_or_else(|p| p.into_inner());
                let mut evicted = vec![];
                while let Some(v) = shard.pop_victim(Strength::Weak) {
                    evicted.push(v);
                }
                if pressure == MemoryPressure::Critical {
                    while let Some(v) = shard.pop_victim(Strength::Soft) {
                        evicted.push(v);
                    }
                }
                evicted
            };
            released += evicted.len();
            self.spill(evicted);
        }
        if released > 0 {
            debug!("Released {} cache entries under {:?} pressure", released, pressure);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
