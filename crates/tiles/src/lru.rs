use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Recency order over keys, oldest at the front.
///
/// Capacities here are small (tens of tiles), so a linear scan on touch is
/// cheaper than maintaining a linked map.
#[derive(Debug, Clone)]
pub struct LruIndex<K> {
    order: VecDeque<K>,
    capacity: usize,
}

impl<K> LruIndex<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "lru capacity must be greater than zero");
        Self {
            order: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_over_capacity(&self) -> bool {
        self.order.len() > self.capacity
    }

    pub fn contains(&self, key: K) -> bool {
        self.order.contains(&key)
    }

    /// Marks `key` most recently used, inserting it if absent.
    pub fn touch(&mut self, key: K) {
        if let Some(position) = self.order.iter().position(|existing| *existing == key) {
            self.order.remove(position);
        }
        self.order.push_back(key);
    }

    pub fn remove(&mut self, key: K) -> bool {
        match self.order.iter().position(|existing| *existing == key) {
            Some(position) => {
                self.order.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn pop_oldest(&mut self) -> Option<K> {
        self.order.pop_front()
    }

    pub fn oldest_first(&self) -> impl Iterator<Item = K> + '_ {
        self.order.iter().copied()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }
}

/// Bounded map that drops its least recently used entries on insert.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    entries: HashMap<K, V>,
    index: LruIndex<K>,
}

impl<K, V> LruCache<K, V>
where
    K: Copy + Eq + Hash,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity + 1),
            index: LruIndex::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.index.capacity()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.index.touch(*key);
        self.entries.get(key)
    }

    /// Returns the keys evicted to make room.
    pub fn insert(&mut self, key: K, value: V) -> Vec<K> {
        self.entries.insert(key, value);
        self.index.touch(key);
        let mut evicted = Vec::new();
        while self.index.is_over_capacity() {
            let Some(oldest) = self.index.pop_oldest() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let index = &mut self.index;
        self.entries.retain(|key, value| {
            let retained = keep(key, value);
            if !retained {
                index.remove(*key);
            }
            retained
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_moves_key_to_back() {
        let mut index = LruIndex::new(3);
        for key in [1, 2, 3] {
            index.touch(key);
        }
        index.touch(1);
        assert_eq!(index.oldest_first().collect::<Vec<_>>(), vec![2, 3, 1]);
        index.touch(4);
        assert!(index.is_over_capacity());
        assert_eq!(index.pop_oldest(), Some(2));
        assert!(!index.is_over_capacity());
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        assert!(cache.insert("a", 1).is_empty());
        assert!(cache.insert("b", 2).is_empty());
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.insert("c", 3), vec!["b"]);
        assert!(cache.get(&"b").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn retain_keeps_index_in_sync() {
        let mut cache = LruCache::new(4);
        for key in 0..4 {
            cache.insert(key, key * 10);
        }
        cache.retain(|key, _| key % 2 == 0);
        assert_eq!(cache.len(), 2);
        assert!(cache.insert(8, 80).is_empty());
        assert!(cache.insert(9, 90).is_empty());
        assert_eq!(cache.insert(10, 100), vec![0]);
    }
}
