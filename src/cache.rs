use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A small bounded cache with least-recently-inserted eviction and an
/// optional per-entry TTL.
///
/// Used for redaction results and filter-chain decisions; both caches are
/// tiny, so re-insertion order (rather than true access order) is accurate
/// enough and keeps `get` cheap.
#[derive(Debug)]
pub(crate) struct LruCache<K, V> {
    capacity: usize,
    ttl: Option<Duration>,
    entries: HashMap<K, (V, Instant)>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::with_capacity(capacity.max(1)),
            order: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let (value, inserted) = self.entries.get(key)?;
        if let Some(ttl) = self.ttl {
            if inserted.elapsed() > ttl {
                return None;
            }
        }
        Some(value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), (value, Instant::now())).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
