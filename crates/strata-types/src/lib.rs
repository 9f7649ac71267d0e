//! Shared domain types for the Strata memory subsystem.
//!
//! Every crate in the workspace speaks in terms of [`MemoryItem`],
//! [`MemoryVector`] and [`MemoryType`]; backends, the cache and the sync layer
//! never define their own item shapes.

pub mod error;
pub mod memory;

pub use error::TypeError;
pub use memory::{
    MemoryItem, MemoryType, MemoryVector, Metadata, ScoredVector, SearchHit, VersionStamp,
    tokenize,
};

use chrono::{DateTime, Utc};

/// Timestamps are always UTC.
pub type Timestamp = DateTime<Utc>;

/// Current time.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Generate a fresh item id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
