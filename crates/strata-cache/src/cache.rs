//! Tiered cache with LRU eviction and TTL support.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::ttl::TtlTracker;

/// Snapshot of the invalidation generation taken before a backend read.
///
/// Pass it back to [`TieredCache::put_if_unchanged`] once the read returns.
/// The fill is dropped if anything was invalidated in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadToken(u64);

/// Inner state protected by the mutex.
struct CacheInner<V> {
    lru: LruCache<String, V>,
    ttl: TtlTracker,
    /// Bumped by every invalidation (remove, invalidate_where, clear).
    generation: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
}

impl<V> CacheInner<V> {
    /// Drop `key` if its TTL elapsed. Returns true when it was dropped.
    fn expire_if_stale(&mut self, key: &str) -> bool {
        if !self.ttl.is_expired(key) {
            return false;
        }
        self.ttl.remove(key);
        if self.lru.pop(key).is_some() {
            self.expirations += 1;
            trace!(key = %key, "Cache entry expired");
        }
        true
    }
}

/// Bounded, recency-ordered read accelerator.
///
/// All operations take one short internal lock and never call out while
/// holding it, so the cache never blocks on a backend. Clones share the same
/// underlying storage.
pub struct TieredCache<V> {
    inner: Arc<Mutex<CacheInner<V>>>,
    config: CacheConfig,
}

impl<V: Clone> TieredCache<V> {
    /// Create an empty cache. A capacity of zero is clamped to one.
    pub fn new(config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.effective_capacity()).unwrap_or(NonZeroUsize::MIN);
        let inner = CacheInner {
            lru: LruCache::new(cap),
            ttl: TtlTracker::new(config.ttl),
            generation: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            invalidations: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            config,
        }
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.config.effective_capacity()
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        if inner.expire_if_stale(key) {
            inner.misses += 1;
            return None;
        }
        match inner.lru.get(key).cloned() {
            Some(value) => {
                inner.ttl.touch(key);
                inner.hits += 1;
                trace!(key = %key, "Cache hit");
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Look up `key` without touching recency, TTL or statistics.
    pub fn peek(&self, key: &str) -> Option<V> {
        let inner = self.inner.lock();
        if inner.ttl.is_expired(key) {
            None
        } else {
            inner.lru.peek(key).cloned()
        }
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner.lru.contains(key) && !inner.ttl.is_expired(key)
    }

    /// Insert or replace `key`, making it most recently used.
    ///
    /// Returns the entry evicted to make room, if any. Replacing an existing
    /// key never evicts.
    pub fn put(&self, key: impl Into<String>, value: V) -> Option<(String, V)> {
        let key = key.into();
        let mut inner = self.inner.lock();
        Self::insert_locked(&mut inner, key, value)
    }

    /// A token capturing the current invalidation generation.
    pub fn read_token(&self) -> ReadToken {
        ReadToken(self.inner.lock().generation)
    }

    /// Insert `value` only if no invalidation happened since `token` was
    /// taken. Returns whether the value was stored.
    pub fn put_if_unchanged(&self, key: impl Into<String>, value: V, token: ReadToken) -> bool {
        let key = key.into();
        let mut inner = self.inner.lock();
        if inner.generation != token.0 {
            trace!(key = %key, "Skipping stale cache fill");
            return false;
        }
        Self::insert_locked(&mut inner, key, value);
        true
    }

    fn insert_locked(inner: &mut CacheInner<V>, key: String, value: V) -> Option<(String, V)> {
        inner.ttl.touch(&key);
        match inner.lru.push(key.clone(), value) {
            Some((old_key, _)) if old_key == key => None,
            Some((evicted_key, evicted)) => {
                inner.ttl.remove(&evicted_key);
                inner.evictions += 1;
                debug!(key = %evicted_key, "Evicted LRU cache entry");
                Some((evicted_key, evicted))
            }
            None => None,
        }
    }

    /// Remove `key`, returning its value if it was cached.
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.ttl.remove(key);
        let removed = inner.lru.pop(key);
        if removed.is_some() {
            inner.invalidations += 1;
        }
        removed
    }

    /// Remove every entry whose key matches `predicate`. Returns the count.
    pub fn invalidate_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&str, &V) -> bool,
    {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let doomed: Vec<String> = inner
            .lru
            .iter()
            .filter(|(k, v)| predicate(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.lru.pop(key);
            inner.ttl.remove(key);
        }
        inner.invalidations += doomed.len() as u64;
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "Invalidated cache entries");
        }
        doomed.len()
    }

    /// Drop entries whose TTL elapsed. Returns the count.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired = inner.ttl.drain_expired();
        let mut count = 0;
        for key in expired {
            if inner.lru.pop(&key).is_some() {
                count += 1;
            }
        }
        inner.expirations += count as u64;
        count
    }

    /// Drop every entry. Statistics are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let count = inner.lru.len();
        inner.lru.clear();
        inner.ttl.clear();
        inner.invalidations += count as u64;
        debug!(count, "Cache cleared");
    }

    /// Current number of entries (expired entries not yet dropped included).
    pub fn size(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().lru.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.lru.len(),
            capacity: self.capacity(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            invalidations: inner.invalidations,
        }
    }
}

impl<V> Clone for TieredCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of entries.
    pub size: usize,

    /// Maximum capacity.
    pub capacity: usize,

    pub hits: u64,
    pub misses: u64,

    /// Entries dropped to make room for new ones.
    pub evictions: u64,

    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,

    /// Entries dropped by `remove`, `invalidate_where` or `clear`.
    pub invalidations: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn cache(capacity: usize) -> TieredCache<String> {
        TieredCache::new(CacheConfig::new().with_capacity(capacity))
    }

    #[test]
    fn test_put_and_get() {
        let cache = cache(10);
        assert!(cache.put("k1", "v1".to_string()).is_none());

        assert_eq!(cache.get("k1").as_deref(), Some("v1"));
        assert_eq!(cache.get("missing"), None);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(3);
        for i in 1..=3 {
            cache.put(format!("k{i}"), format!("v{i}"));
        }

        let evicted = cache.put("k4", "v4".to_string());

        assert_eq!(evicted, Some(("k1".to_string(), "v1".to_string())));
        assert_eq!(cache.size(), 3);
        assert!(!cache.contains("k1"));
        assert!(cache.contains("k2"));
        assert!(cache.contains("k4"));
    }

    #[test]
    fn test_lru_access_updates_order() {
        let cache = cache(3);
        for i in 1..=3 {
            cache.put(format!("k{i}"), format!("v{i}"));
        }

        // k1 becomes most recently used, so k2 is now the LRU entry.
        cache.get("k1");
        let evicted = cache.put("k4", "v4".to_string());

        assert_eq!(evicted.map(|(k, _)| k), Some("k2".to_string()));
        assert!(cache.contains("k1"));
        assert!(cache.contains("k3"));
    }

    #[test]
    fn test_peek_does_not_touch_order() {
        let cache = cache(2);
        cache.put("k1", "v1".to_string());
        cache.put("k2", "v2".to_string());

        assert_eq!(cache.peek("k1").as_deref(), Some("v1"));
        let evicted = cache.put("k3", "v3".to_string());

        assert_eq!(evicted.map(|(k, _)| k), Some("k1".to_string()));
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = cache(1);
        cache.put("k1", "v1".to_string());
        assert!(cache.put("k1", "v1b".to_string()).is_none());
        assert_eq!(cache.get("k1").as_deref(), Some("v1b"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let cache = cache(0);
        cache.put("k1", "v1".to_string());
        cache.put("k2", "v2".to_string());

        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.size(), 1);
        assert!(cache.contains("k2"));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let cache = cache(5);
        for i in 0..100 {
            cache.put(format!("k{i}"), i.to_string());
            assert!(cache.size() <= 5);
        }
        assert_eq!(cache.keys(), vec!["k99", "k98", "k97", "k96", "k95"]);
    }

    #[test]
    fn test_ttl_expiration() {
        let cache: TieredCache<String> = TieredCache::new(
            CacheConfig::new()
                .with_capacity(10)
                .with_ttl(Duration::from_millis(20)),
        );
        cache.put("k1", "v1".to_string());
        assert!(cache.contains("k1"));

        thread::sleep(Duration::from_millis(50));

        assert!(!cache.contains("k1"));
        assert_eq!(cache.get("k1"), None);
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_cleanup_expired() {
        let cache: TieredCache<String> = TieredCache::new(
            CacheConfig::new()
                .with_capacity(10)
                .with_ttl(Duration::from_millis(20)),
        );
        for i in 1..=3 {
            cache.put(format!("k{i}"), String::new());
        }

        thread::sleep(Duration::from_millis(50));

        assert_eq!(cache.cleanup_expired(), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_and_invalidate_where() {
        let cache = cache(10);
        cache.put("docs\u{1f}a", "1".to_string());
        cache.put("docs\u{1f}b", "2".to_string());
        cache.put("vec\u{1f}a", "3".to_string());

        assert_eq!(cache.remove("docs\u{1f}a").as_deref(), Some("1"));
        assert_eq!(cache.remove("docs\u{1f}a"), None);

        let removed = cache.invalidate_where(|k, _| k.starts_with("docs\u{1f}"));
        assert_eq!(removed, 1);
        assert_eq!(cache.keys(), vec!["vec\u{1f}a"]);
    }

    #[test]
    fn test_put_if_unchanged_rejects_stale_fill() {
        let cache = cache(10);

        let token = cache.read_token();
        cache.remove("k1");
        assert!(!cache.put_if_unchanged("k1", "stale".to_string(), token));
        assert!(!cache.contains("k1"));

        let token = cache.read_token();
        assert!(cache.put_if_unchanged("k1", "fresh".to_string(), token));
        assert_eq!(cache.get("k1").as_deref(), Some("fresh"));
    }

    #[test]
    fn test_clear() {
        let cache = cache(10);
        cache.put("k1", "v1".to_string());
        let token = cache.read_token();
        cache.clear();

        assert!(cache.is_empty());
        assert!(!cache.put_if_unchanged("k1", "v1".to_string(), token));
    }

    #[test]
    fn test_stats() {
        let cache = cache(1);
        cache.put("k1", "v1".to_string());
        cache.get("k1");
        cache.get("k2");
        cache.put("k2", "v2".to_string());

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.capacity, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_access_stays_bounded() {
        let cache = cache(8);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("k{}", (t * 7 + i) % 16);
                        if cache.get(&key).is_none() {
                            cache.put(key, i.to_string());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.size() <= 8);
    }
}
