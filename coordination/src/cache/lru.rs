//! Bounded least-recently-used map.
//!
//! Recency is tracked with a monotonically increasing access tick per key and
//! an ordered index from tick to key, so promotion and eviction are both
//! `O(log n)`. The map itself is not synchronized; [`super::ContextCache`]
//! wraps it in a mutex.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Least-recently-used map with a fixed capacity.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    tick: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty cache. Returns `None` when `capacity` is zero.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            tick: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Membership test without touching recency.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up `key` and promote it to most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let next = self.next_tick();
        let (_, tick) = self.entries.get_mut(key)?;
        self.recency.remove(&*tick);
        *tick = next;
        self.recency.insert(next, key.clone());
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Insert or replace `key`.
    ///
    /// When the key is new and the cache is full, the least-recently-used
    /// entry is evicted and returned.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        let next = self.next_tick();
        if let Some((_, old_tick)) = self.entries.remove(&key) {
            self.recency.remove(&old_tick);
            self.recency.insert(next, key.clone());
            self.entries.insert(key, (value, next));
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.pop_oldest()
        } else {
            None
        };

        self.recency.insert(next, key.clone());
        self.entries.insert(key, (value, next));
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, tick) = self.entries.remove(key)?;
        self.recency.remove(&tick);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Keys ordered from least- to most-recently-used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.recency.values().cloned().collect()
    }

    fn pop_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.recency.pop_first()?;
        let (value, _) = self.entries.remove(&key)?;
        Some((key, value))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
