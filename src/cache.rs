//! Half-eviction ("snap") caches.
//!
//! Under memory pressure a cache drops every other entry in iteration order
//! instead of tracking access recency. One pass over `N` entries removes
//! `ceil(N/2)` of them; repeated passes drain the cache.

use std::{collections::HashMap, hash::Hash};

use log::debug;
use parking_lot::Mutex;

/// Remove every odd-positioned entry of `map`.
///
/// `finger` is the running position carried across maps; each visited entry
/// advances it by one and the entry is dropped when the new position is odd.
/// Returns the position after the last entry.
pub fn thanos<K, V>(map: &mut HashMap<K, V>, finger: usize) -> usize {
    let mut finger = finger;
    map.retain(|_, _| {
        finger += 1;
        finger & 1 == 0
    });
    finger
}

pub struct ThanosCache<K, V> {
    entries: Mutex<HashMap<K, V>>,
    capacity: usize,
}

impl<K: Hash + Eq, V: Clone> ThanosCache<K, V> {
    /// A cache that snaps itself whenever an insert pushes it past `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        entries.insert(key, value);
        if entries.len() > self.capacity {
            let before = entries.len();
            thanos(&mut *entries, 0);
            debug!("Cache over capacity, snapped {} -> {}", before, entries.len());
        }
    }

    /// Insert `value` unless `keep` says the current entry should stay.
    /// Returns whether the entry was written.
    pub fn insert_unless(&self, key: K, value: V, keep: impl FnOnce(&V) -> bool) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(&key).is_some_and(keep) {
            return false;
        }
        entries.insert(key, value);
        if entries.len() > self.capacity {
            let before = entries.len();
            thanos(&mut *entries, 0);
            debug!("Cache over capacity, snapped {} -> {}", before, entries.len());
        }
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// One eviction pass. Returns how many entries were dropped.
    pub fn reduce_memory(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        thanos(&mut *entries, 0);
        before - entries.len()
    }
}
