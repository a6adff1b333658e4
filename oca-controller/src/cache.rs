//! Bounded cache of object proxies
//!
//! The device stays the source of truth for every object; the cache only keeps
//! proxy identity stable and saves class-identification round trips. When the
//! store is full, the least recently used entry is evicted and its key
//! removed from the tracked key set under the same lock, so `keys()` always
//! matches the entries that `get` can return.

use oca_core::ONo;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Entry<V> {
    value: V,
    last_used: u64,
}

/// Store with a capacity limit and an eviction callback
struct BoundedStore<V> {
    capacity: usize,
    entries: HashMap<ONo, Entry<V>>,
    clock: u64,
}

impl<V> BoundedStore<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: ONo) -> Option<&V> {
        let now = self.tick();
        self.entries.get_mut(&key).map(|entry| {
            entry.last_used = now;
            &entry.value
        })
    }

    fn insert(&mut self, key: ONo, value: V, mut on_evict: impl FnMut(ONo)) {
        let now = self.tick();
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                let Some(oldest) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| *key)
                else {
                    break;
                };
                self.entries.remove(&oldest);
                on_evict(oldest);
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                last_used: now,
            },
        );
    }

    fn remove(&mut self, key: ONo) -> Option<V> {
        self.entries.remove(&key).map(|entry| entry.value)
    }
}

struct CacheState<V> {
    store: BoundedStore<V>,
    keys: HashSet<ONo>,
}

/// Object proxies by object number
pub struct ObjectCache<V> {
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> ObjectCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                store: BoundedStore::new(capacity),
                keys: HashSet::new(),
            }),
        }
    }

    // a panic while holding the lock cannot leave keys and store disagreeing,
    // every mutation updates both before returning
    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: ONo) -> Option<V> {
        self.lock().store.get(key).cloned()
    }

    pub fn set(&self, key: ONo, value: V) {
        let mut state = self.lock();
        let CacheState { store, keys } = &mut *state;
        store.insert(key, value, |evicted| {
            log::trace!("evicting object {} from cache", evicted);
            keys.remove(&evicted);
        });
        keys.insert(key);
    }

    pub fn remove(&self, key: ONo) -> Option<V> {
        let mut state = self.lock();
        state.keys.remove(&key);
        state.store.remove(key)
    }

    pub fn remove_all(&self) {
        let mut state = self.lock();
        let keys: Vec<ONo> = state.keys.drain().collect();
        for key in keys {
            state.store.remove(key);
        }
    }

    pub fn keys(&self) -> Vec<ONo> {
        let mut keys: Vec<ONo> = self.lock().keys.iter().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Cached values, in object-number order
    pub fn values(&self) -> Vec<V> {
        let state = self.lock();
        let mut entries: Vec<(ONo, V)> = state
            .store
            .entries
            .iter()
            .map(|(key, entry)| (*key, entry.value.clone()))
            .collect();
        entries.sort_unstable_by_key(|(key, _)| *key);
        entries.into_iter().map(|(_, value)| value).collect()
    }

    pub fn count(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn contains(&self, key: ONo) -> bool {
        self.lock().keys.contains(&key)
    }
}

impl<V> std::fmt::Debug for ObjectCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .state
            .lock()
            .map(|state| state.keys.len())
            .unwrap_or_default();
        f.debug_struct("ObjectCache").field("count", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(cache: &ObjectCache<String>) {
        let present: Vec<ONo> = cache
            .keys()
            .into_iter()
            .filter(|key| cache.get(*key).is_some())
            .collect();
        assert_eq!(present, cache.keys());
        assert_eq!(cache.values().len(), cache.count());
    }

    #[test]
    fn test_get_set_remove() {
        let cache = ObjectCache::new(10);
        assert!(cache.is_empty());
        cache.set(4096, "gain".to_string());
        cache.set(4097, "mute".to_string());
        assert_eq!(cache.get(4096).as_deref(), Some("gain"));
        assert_eq!(cache.count(), 2);

        cache.set(4096, "level".to_string());
        assert_eq!(cache.get(4096).as_deref(), Some("level"));
        assert_eq!(cache.count(), 2);

        assert_eq!(cache.remove(4096).as_deref(), Some("level"));
        assert!(cache.remove(4096).is_none());
        assert!(!cache.contains(4096));
        assert_consistent(&cache);

        cache.remove_all();
        assert!(cache.is_empty());
        assert!(cache.values().is_empty());
    }

    #[test]
    fn test_eviction_keeps_keys_consistent() {
        let cache = ObjectCache::new(3);
        for ono in 4096..4100 {
            cache.set(ono, ono.to_string());
            assert_consistent(&cache);
        }
        assert_eq!(cache.count(), 3);
        assert_eq!(cache.keys(), vec![4097, 4098, 4099]);

        // touching 4097 makes 4098 the least recently used
        assert!(cache.get(4097).is_some());
        cache.set(5000, "new".to_string());
        assert_eq!(cache.keys(), vec![4097, 4099, 5000]);
        assert_consistent(&cache);
    }

    #[test]
    fn test_mixed_operations() {
        let cache = ObjectCache::new(4);
        for step in 0u32..200 {
            let ono = 4096 + (step * 7) % 11;
            match step % 3 {
                0 | 1 => cache.set(ono, step.to_string()),
                _ => {
                    cache.remove(ono);
                }
            }
            assert!(cache.count() <= 4);
            assert_consistent(&cache);
        }
    }

    #[test]
    fn test_concurrent_access() {
        let cache = std::sync::Arc::new(ObjectCache::new(8));
        let workers: Vec<_> = (0..4u32)
            .map(|worker| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        cache.set(worker * 1000 + i, format!("{}", i));
                        if i % 2 == 0 {
                            cache.remove(worker * 1000 + i);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(cache.count() <= 8);
        assert_consistent(&cache);
    }
}
