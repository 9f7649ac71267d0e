//! Bounded read cache with LRU eviction and optional TTL.
//!
//! This crate provides the tiered cache that sits in front of memory
//! backends:
//! - Strict LRU eviction at a capacity fixed on construction
//! - Optional idle TTL for auto-expiring stale entries
//! - Read tokens so a slow reader cannot refill a value that was invalidated
//!   while it was in flight
//!
//! The cache is never the system of record. `put` never writes through.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use strata_cache::{CacheConfig, TieredCache};
//!
//! let config = CacheConfig::default()
//!     .with_capacity(2)
//!     .with_ttl(Duration::from_secs(60));
//!
//! let cache: TieredCache<String> = TieredCache::new(config);
//! cache.put("a", "alpha".to_string());
//! assert_eq!(cache.get("a").as_deref(), Some("alpha"));
//! ```

mod cache;
mod config;
mod ttl;

pub use cache::{CacheStats, ReadToken, TieredCache};
pub use config::CacheConfig;
pub use ttl::TtlTracker;
