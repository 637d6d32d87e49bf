//! Bounded bidirectional cache fronting the factor dictionary.
//!
//! One cache per factor property, mapping interned strings to their
//! integer indexes and back. Recency is updated on access in either
//! direction; when full, the least-recently-used entry is evicted from
//! both directions. No persistence: a cold cache warms lazily from the
//! factor sub-database. Thread safety is supplied by the enclosing table
//! lock.

use std::collections::HashMap;

#[derive(Debug)]
struct Slot {
    index: i64,
    last_used: u64,
}

/// A fixed-capacity string ⇄ index cache with LRU eviction.
#[derive(Debug)]
pub struct FactorCache {
    capacity: usize,
    tick: u64,
    by_value: HashMap<String, Slot>,
    by_index: HashMap<i64, String>,
}

impl FactorCache {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            by_value: HashMap::new(),
            by_index: HashMap::new(),
        }
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.by_value.len()
    }

    /// Returns whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }

    /// Looks up the index for a string, marking the entry recently used.
    pub fn get_by_value(&mut self, value: &str) -> Option<i64> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.by_value.get_mut(value)?;
        slot.last_used = tick;
        Some(slot.index)
    }

    /// Looks up the string for an index, marking the entry recently used.
    pub fn get_by_index(&mut self, index: i64) -> Option<String> {
        self.tick += 1;
        let tick = self.tick;
        let value = self.by_index.get(&index)?.clone();
        if let Some(slot) = self.by_value.get_mut(&value) {
            slot.last_used = tick;
        }
        Some(value)
    }

    /// Inserts a mapping in both directions, evicting the least-recently
    /// used entry if the cache is full.
    pub fn insert(&mut self, value: String, index: i64) {
        self.tick += 1;
        let tick = self.tick;

        if let Some(slot) = self.by_value.get_mut(&value) {
            if slot.index != index {
                self.by_index.remove(&slot.index);
                slot.index = index;
            }
            slot.last_used = tick;
            self.by_index.insert(index, value);
            return;
        }

        if self.by_value.len() >= self.capacity {
            self.evict_lru();
        }

        if let Some(stale) = self.by_index.insert(index, value.clone()) {
            self.by_value.remove(&stale);
        }
        self.by_value.insert(
            value,
            Slot {
                index,
                last_used: tick,
            },
        );
    }

    fn evict_lru(&mut self) {
        // Capacity is small; a linear scan is fine.
        let victim = self
            .by_value
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(value, _)| value.clone());
        if let Some(value) = victim {
            if let Some(slot) = self.by_value.remove(&value) {
                self.by_index.remove(&slot.index);
            }
        }
    }
}
