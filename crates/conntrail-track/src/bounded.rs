//! Insertion-ordered map with a fixed capacity.
//!
//! When full, inserting a new key evicts the oldest inserted key. Re-inserting
//! an existing key replaces its value and refreshes its position.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// A map holding at most `capacity` entries, evicting the oldest first.
#[derive(Debug)]
pub struct BoundedMap<K, V> {
    entries: HashMap<K, (u64, V)>,
    order: VecDeque<(u64, K)>,
    capacity: usize,
    generation: u64,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    /// Creates an empty map. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            generation: 0,
        }
    }

    /// Inserts or replaces `key`, returning the evicted oldest entry if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.generation += 1;
        let generation = self.generation;
        self.order.push_back((generation, key.clone()));
        if self.entries.insert(key, (generation, value)).is_some() {
            self.compact();
            return None;
        }
        if self.entries.len() > self.capacity {
            return self.evict_oldest();
        }
        None
    }

    /// Returns a reference to the value for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, value)| value)
    }

    /// Returns a mutable reference to the value for `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|(_, value)| value)
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            self.compact();
        }
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        while let Some((generation, key)) = self.order.pop_front() {
            let current = self.entries.get(&key).map(|(g, _)| *g);
            if current == Some(generation) {
                return self.entries.remove(&key).map(|(_, value)| (key, value));
            }
        }
        None
    }

    // Drops stale order slots once they outnumber live entries.
    fn compact(&mut self) {
        if self.order.len() > self.entries.len().saturating_mul(2) + 16 {
            let entries = &self.entries;
            self.order
                .retain(|(generation, key)| entries.get(key).is_some_and(|(g, _)| g == generation));
        }
    }
}
