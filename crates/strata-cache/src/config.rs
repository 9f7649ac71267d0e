//! Configuration for the tiered cache.

use std::time::Duration;

/// Default maximum number of cached entries.
pub const DEFAULT_CAPACITY: usize = 1_000;

/// Default TTL for entries (none by default - entries don't expire).
pub const DEFAULT_TTL: Option<Duration> = None;

/// Configuration for a [`TieredCache`](crate::TieredCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction. Zero is treated as one.
    pub capacity: usize,

    /// Optional idle time-to-live.
    /// Entries that haven't been read or written within this duration are
    /// treated as absent and dropped on the next access.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of entries.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the idle TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Disable TTL (entries only leave through eviction or invalidation).
    pub fn without_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }

    /// Capacity actually used by the cache.
    pub fn effective_capacity(&self) -> usize {
        self.capacity.max(1)
    }
}
