//! Keyed tables holding the bot's ephemeral state.
//!
//! Handlers only see the [`Table`] trait; the in-memory implementation is a
//! thin wrapper over `DashMap`, so each single call is atomic but a
//! `get` followed by a `put` is not.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;

pub trait Table<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or replace; returns the previous value.
    fn put(&self, key: K, value: V) -> Option<V>;

    fn remove(&self, key: &K) -> Option<V>;

    /// Keep only the entries for which `keep` returns true. `keep` may also
    /// trim the value in place. Returns the number of entries dropped.
    fn prune(&self, keep: &mut dyn FnMut(&K, &mut V) -> bool) -> usize;

    fn len(&self) -> usize;
}

pub type SharedTable<K, V> = Arc<dyn Table<K, V>>;

pub struct MemoryTable<K, V>
where
    K: Eq + Hash,
{
    inner: DashMap<K, V>,
}

impl<K, V> MemoryTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn shared() -> SharedTable<K, V> {
        Arc::new(Self::new())
    }
}

impl<K, V> Default for MemoryTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Table<K, V> for MemoryTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| v.clone())
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    fn prune(&self, keep: &mut dyn FnMut(&K, &mut V) -> bool) -> usize {
        let before = self.inner.len();
        self.inner.retain(|k, v| keep(k, v));
        before.saturating_sub(self.inner.len())
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_returns_previous_value() {
        let t: MemoryTable<u64, &str> = MemoryTable::new();
        assert_eq!(t.put(1, "a"), None);
        assert_eq!(t.put(1, "b"), Some("a"));
        assert_eq!(t.get(&1), Some("b"));
    }

    #[test]
    fn remove_only_succeeds_once() {
        let t: MemoryTable<u64, u32> = MemoryTable::new();
        t.put(7, 1);
        assert_eq!(t.remove(&7), Some(1));
        assert_eq!(t.remove(&7), None);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn prune_trims_and_drops() {
        let t: MemoryTable<u64, Vec<i64>> = MemoryTable::new();
        t.put(1, vec![1, 5, 9]);
        t.put(2, vec![1, 2]);

        let dropped = t.prune(&mut |_, v| {
            v.retain(|x| *x > 3);
            !v.is_empty()
        });

        assert_eq!(dropped, 1);
        assert_eq!(t.get(&1), Some(vec![5, 9]));
        assert_eq!(t.get(&2), None);
    }
}
