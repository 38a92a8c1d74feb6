//! Recency index for LRU eviction

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::hash::Hash;

/// Tracks last access order for a set of keys
///
/// Each `touch` stamps the key with a fresh tick; the smallest tick is the
/// least recently used key.
#[derive(Debug)]
pub struct LruIndex<K> {
    ticks: FxHashMap<K, u64>,
    order: BTreeMap<u64, K>,
    clock: u64,
}

impl<K: Eq + Hash + Clone> LruIndex<K> {
    pub fn new() -> Self {
        Self {
            ticks: FxHashMap::default(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    /// Mark `key` as most recently used, inserting it if absent
    pub fn touch(&mut self, key: &K) {
        self.clock += 1;
        if let Some(old) = self.ticks.insert(key.clone(), self.clock) {
            self.order.remove(&old);
        }
        self.order.insert(self.clock, key.clone());
    }

    pub fn remove(&mut self, key: &K) -> bool {
        match self.ticks.remove(key) {
            Some(tick) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }

    /// Remove and return the least recently used key
    pub fn pop_lru(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.ticks.remove(&key);
        Some(key)
    }

    /// Least recently used key, without removing it
    pub fn peek_lru(&self) -> Option<&K> {
        self.order.values().next()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.ticks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for LruIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_in_access_order() {
        let mut lru = LruIndex::new();
        lru.touch(&"a");
        lru.touch(&"b");
        lru.touch(&"c");
        lru.touch(&"a");

        assert_eq!(lru.peek_lru(), Some(&"b"));
        assert_eq!(lru.pop_lru(), Some("b"));
        assert_eq!(lru.pop_lru(), Some("c"));
        assert_eq!(lru.pop_lru(), Some("a"));
        assert_eq!(lru.pop_lru(), None);
    }

    #[test]
    fn test_remove() {
        let mut lru = LruIndex::new();
        lru.touch(&1);
        lru.touch(&2);
        assert!(lru.remove(&1));
        assert!(!lru.remove(&1));
        assert_eq!(lru.len(), 1);
        assert!(lru.contains(&2));
        assert_eq!(lru.pop_lru(), Some(2));
        assert!(lru.is_empty());
    }
}
