//! Bounded LRU cache with per-entry TTL.
//!
//! Used in two places: content-hash → encoded embedding bytes during
//! ingestion, and chunk-id → decoded vector during retrieval rerank.
//! Both are small, hot maps guarded by a single mutex.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_CAPACITY: usize = 2048;
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    /// Access order, most recent at the front.
    order: VecDeque<K>,
}

/// Bounded LRU + TTL map. `get` refreshes recency and lazily purges an
/// expired entry; `set` overwrites in place, extends the expiry, and
/// evicts from the back once over capacity.
pub struct LruTtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Duration,
}

fn lock_inner<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K, V> LruTtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = lock_inner(&self.inner);
        let expired = match inner.map.get(key) {
            Some(entry) => Instant::now() > entry.expires_at,
            None => return None,
        };
        if expired {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        move_to_front(&mut inner.order, key);
        inner.map.get(key).map(|e| e.value.clone())
    }

    pub fn set(&self, key: K, value: V) {
        let mut inner = lock_inner(&self.inner);
        let expires_at = Instant::now() + self.ttl;

        if let Some(entry) = inner.map.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            move_to_front(&mut inner.order, &key);
            return;
        }

        inner.order.push_front(key.clone());
        inner.map.insert(key, Entry { value, expires_at });

        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.pop_back() else {
                break;
            };
            inner.map.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        lock_inner(&self.inner).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn move_to_front<K: PartialEq + Clone>(order: &mut VecDeque<K>, key: &K) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
    order.push_front(key.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_keeps_most_recently_written() {
        let cache: LruTtlCache<String, u32> = LruTtlCache::new(3, DEFAULT_TTL);
        for i in 0..5u32 {
            cache.set(format!("k{i}"), i);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&"k0".to_string()).is_none());
        assert!(cache.get(&"k1".to_string()).is_none());
        assert_eq!(cache.get(&"k2".to_string()), Some(2));
        assert_eq!(cache.get(&"k3".to_string()), Some(3));
        assert_eq!(cache.get(&"k4".to_string()), Some(4));
    }

    #[test]
    fn get_refreshes_recency() {
        let cache: LruTtlCache<&str, u32> = LruTtlCache::new(2, DEFAULT_TTL);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.set("c", 3); // evicts "b", not the freshly-read "a"
        assert_eq!(cache.get(&"a"), Some(1));
        assert!(cache.get(&"b").is_none());
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn overwrite_moves_to_front_and_extends() {
        let cache: LruTtlCache<&str, u32> = LruTtlCache::new(2, DEFAULT_TTL);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        cache.set("c", 3); // "b" is now the oldest
        assert_eq!(cache.get(&"a"), Some(10));
        assert!(cache.get(&"b").is_none());
    }

    #[test]
    fn expired_entries_are_purged_on_get() {
        let cache: LruTtlCache<&str, u32> = LruTtlCache::new(4, Duration::from_millis(20));
        cache.set("a", 1);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&"a").is_none());
        assert!(cache.is_empty());
    }
}
