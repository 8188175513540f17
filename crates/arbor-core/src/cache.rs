//! Capacity-bounded LFU result cache with per-entry TTL

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// A cached value plus the bookkeeping used for eviction.
#[derive(Debug, Clone)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
    pub timestamp: Instant,
    pub access_count: u64,
    /// Monotonic touch counter; orders entries with equal frequency.
    recency: u64,
}

/// Hit/miss counters exposed as metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

/// Least-frequently-used cache. Expired entries count as misses and are dropped on access.
///
/// Safe to share between tasks; all operations take a short internal lock.
pub struct ResultCache<K, V> {
    name: &'static str,
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<K, CacheEntry<K, V>>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K, V> std::fmt::Debug for ResultCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        ResultCache {
            name,
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<K, V>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a key, counting a hit or a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();

        let expired = match entries.get(key) {
            Some(entry) => entry.timestamp.elapsed() > self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("{} cache entry expired", self.name);
            return None;
        }

        let recency = self.tick();
        let entry = entries.get_mut(key)?;
        entry.access_count += 1;
        entry.recency = recency;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert or replace a value. At capacity the least frequently used entry is evicted first.
    pub fn set(&self, key: K, value: V) {
        let mut entries = self.lock();
        let recency = self.tick();

        if let Some(entry) = entries.get_mut(&key) {
            entry.value = value;
            entry.timestamp = Instant::now();
            entry.recency = recency;
            return;
        }

        if entries.len() >= self.capacity {
            let victim = entries
                .values()
                .min_by_key(|e| (e.access_count, e.recency))
                .map(|e| e.key.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                timestamp: Instant::now(),
                access_count: 0,
                recency,
            },
        );
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut entries = self.lock();
        let dropped = entries.len();
        entries.clear();
        debug!("Cleared {} cache ({} entries)", self.name, dropped);
    }

    /// `hits / total requests`, or 0 before the first request.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_frequently_used() {
        let cache = ResultCache::new("test", 3, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);

        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"c");

        cache.set("d", 4);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"a") && cache.contains(&"c") && cache.contains(&"d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_frequency_ties_evict_oldest() {
        let cache = ResultCache::new("test", 2, Duration::from_secs(60));
        cache.set(1, "one");
        cache.set(2, "two");
        cache.set(3, "three");
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = ResultCache::new("test", 2, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(10));
    }

    #[test]
    fn test_hit_rate() {
        let cache = ResultCache::new("test", 10, Duration::from_secs(60));
        assert_eq!(cache.hit_rate(), 0.0);
        cache.set("a", 1);
        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"missing");
        assert!((cache.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache = ResultCache::new("test", 10, Duration::from_millis(500));
        cache.set("a", 1);

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(cache.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.expirations), (1, 1, 1));
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = ResultCache::new("test", 10, Duration::from_secs(60));
        cache.set("a", 1);
        cache.get(&"a");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
    }
}
