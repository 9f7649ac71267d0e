//! Idle-time tracking for cache entry expiration.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks the last touch of each cache key for TTL-based expiration.
#[derive(Debug)]
pub struct TtlTracker {
    touched: HashMap<String, Instant>,
    ttl: Option<Duration>,
}

impl TtlTracker {
    /// Create a tracker; `None` disables expiration entirely.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            touched: HashMap::new(),
            ttl,
        }
    }

    /// Record an access, restarting the key's idle timer.
    pub fn touch(&mut self, key: &str) {
        if self.ttl.is_some() {
            self.touched.insert(key.to_string(), Instant::now());
        }
    }

    /// Whether the key has been idle longer than the TTL.
    ///
    /// Keys that were never touched are not expired: the tracker only knows
    /// about keys the cache told it about.
    pub fn is_expired(&self, key: &str) -> bool {
        match (self.ttl, self.touched.get(key)) {
            (Some(ttl), Some(at)) => at.elapsed() > ttl,
            _ => false,
        }
    }

    /// Stop tracking a key.
    pub fn remove(&mut self, key: &str) {
        self.touched.remove(key);
    }

    /// Remove all expired keys and return them.
    pub fn drain_expired(&mut self) -> Vec<String> {
        let Some(ttl) = self.ttl else {
            return Vec::new();
        };
        let now = Instant::now();
        let expired: Vec<String> = self
            .touched
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.touched.remove(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.touched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    pub fn clear(&mut self) {
        self.touched.clear();
    }

    /// The configured TTL.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}
