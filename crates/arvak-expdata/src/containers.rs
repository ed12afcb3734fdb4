//! Mutex-guarded insertion-ordered collections.
//!
//! Every shared collection in [`ExperimentData`](crate::ExperimentData) is one of
//! these. The guard returned by `lock()` lets callers compose multi-step
//! sequences over several containers; all other methods lock internally for
//! the duration of a single call.

use std::hash::Hash;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

/// Insertion-ordered map with unique keys.
#[derive(Debug, Clone)]
pub struct OrderedMap<K, V> {
    order: Vec<K>,
    entries: FxHashMap<K, V>,
}

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: FxHashMap::default(),
        }
    }
}

impl<K: Eq + Hash + Clone, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. Replacing an existing key keeps its original position.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entries.insert(key.clone(), value);
        if previous.is_none() {
            self.order.push(key);
        }
        previous
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    /// Entry at a position in insertion order.
    pub fn get_index(&self, index: usize) -> Option<(&K, &V)> {
        let key = self.order.get(index)?;
        self.entries.get(key).map(|v| (key, v))
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &K> {
        self.order.iter()
    }

    pub fn values(&self) -> impl DoubleEndedIterator<Item = &V> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&K, &V)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k, v)))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut()
    }
}

impl<K: Eq + Hash + Clone, V> FromIterator<(K, V)> for OrderedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Thread-safe [`OrderedMap`].
#[derive(Debug)]
pub struct ThreadSafeMap<K, V> {
    inner: Mutex<OrderedMap<K, V>>,
}

impl<K, V> Default for ThreadSafeMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(OrderedMap::default()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ThreadSafeMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: OrderedMap<K, V>) -> Self {
        Self {
            inner: Mutex::new(map),
        }
    }

    /// Acquire the container lock.
    ///
    /// A poisoned lock is recovered: every critical section leaves the map consistent.
    pub fn lock(&self) -> MutexGuard<'_, OrderedMap<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.lock().insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn get_index(&self, index: usize) -> Option<(K, V)> {
        self.lock()
            .get_index(index)
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.lock().values().cloned().collect()
    }

    pub fn items(&self) -> Vec<(K, V)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Independent copy of the current contents.
    pub fn snapshot(&self) -> OrderedMap<K, V> {
        self.lock().clone()
    }

    /// Swap in new contents, returning the old ones.
    pub fn replace(&self, map: OrderedMap<K, V>) -> OrderedMap<K, V> {
        std::mem::replace(&mut *self.lock(), map)
    }
}

/// Thread-safe ordered sequence.
#[derive(Debug)]
pub struct ThreadSafeList<T> {
    inner: Mutex<Vec<T>>,
}

impl<T> Default for ThreadSafeList<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> ThreadSafeList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            inner: Mutex::new(items),
        }
    }

    /// Acquire the container lock.
    pub fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.lock().push(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.lock().extend(items);
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.lock().get(index).cloned()
    }

    /// Items in `range`, or `None` if the range is out of bounds.
    pub fn slice(&self, range: Range<usize>) -> Option<Vec<T>> {
        self.lock().get(range).map(<[T]>::to_vec)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ordered_map_keeps_insertion_order() {
        let mut map = OrderedMap::new();
        map.insert("c", 3);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec!["c", "a", "b"]);

        // Replacing keeps the slot.
        assert_eq!(map.insert("c", 30), Some(3));
        assert_eq!(map.values().copied().collect::<Vec<_>>(), vec![30, 1, 2]);
        assert_eq!(map.get_index(0), Some((&"c", &30)));
    }

    #[test]
    fn test_ordered_map_remove() {
        let mut map: OrderedMap<_, _> = [("x", 1), ("y", 2), ("z", 3)].into_iter().collect();
        assert_eq!(map.remove(&"y"), Some(2));
        assert_eq!(map.remove(&"y"), None);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get_index(1), Some((&"z", &3)));
        assert_eq!(map.iter().rev().next(), Some((&"z", &3)));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let map = ThreadSafeMap::new();
        map.insert("a".to_string(), 1);
        let snapshot = map.snapshot();
        map.insert("b".to_string(), 2);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(map.len(), 2);

        let list = ThreadSafeList::from_vec(vec![1, 2]);
        let copy = list.snapshot();
        list.push(3);
        assert_eq!(copy, vec![1, 2]);
        assert_eq!(list.slice(1..3), Some(vec![2, 3]));
        assert_eq!(list.slice(2..5), None);
    }

    #[test]
    fn test_concurrent_writers() {
        let list = Arc::new(ThreadSafeList::new());
        let map = Arc::new(ThreadSafeMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let list = Arc::clone(&list);
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        list.push(t * 100 + i);
                        map.insert(t * 100 + i, i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.len(), 800);
        assert_eq!(map.len(), 800);
    }

    #[test]
    fn test_composite_lock_scope() {
        let a: ThreadSafeMap<String, u32> = ThreadSafeMap::new();
        let b: ThreadSafeMap<String, u32> = ThreadSafeMap::new();
        {
            let mut ga = a.lock();
            let mut gb = b.lock();
            ga.insert("k".into(), 1);
            gb.insert("k".into(), 2);
        }
        assert_eq!(a.get(&"k".to_string()), Some(1));
        assert_eq!(b.get(&"k".to_string()), Some(2));
    }
}
