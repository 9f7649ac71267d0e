//! Backend adapter contract.
//!
//! Every storage technology implements [`MemoryStore`]. Optional abilities
//! are separate traits reached through explicit accessors instead of probing:
//!
//! - [`VectorStore`]: embedding similarity search and collection statistics
//! - [`TransactionalStore`]: native `begin`/`commit`/`rollback`
//!
//! Snapshots (transaction rollback, recovery) capture `all_items` plus the
//! optional [`MemoryStore::auxiliary_state`].
//!
//! # Example
//!
//! ```ignore
//! use strata_memory::{DocumentStore, MemoryStore};
//!
//! let store = DocumentStore::new("docs");
//! let id = store.store(MemoryItem::new(MemoryType::Working, "hello")).await?;
//! if let Some(tx) = store.as_transactional() {
//!     tx.begin("tx-1").await?;
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_types::{MemoryItem, MemoryVector, ScoredVector, SearchHit, Timestamp, now};

use crate::error::Result;

/// What a backend can do beyond the base contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub vector: bool,
    pub transactional: bool,
    pub graph: bool,
}

impl Capabilities {
    pub const BASIC: Capabilities = Capabilities {
        vector: false,
        transactional: false,
        graph: false,
    };
}

/// Trait for memory storage backends.
///
/// # Semantics
///
/// - `store` is an upsert. An empty id is replaced by a fresh one, and the
///   item's timestamps are kept verbatim so synchronization and snapshot
///   restore reproduce exact versions.
/// - `update` keeps `id` and `created_at` and moves `updated_at` strictly
///   forward. It returns `false` when the id does not exist.
/// - Failures are `Storage` (transient) or `Corruption` (irrecoverable).
///
/// All implementations must be `Send + Sync` to allow sharing across tasks.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Label used in errors and logs.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::BASIC
    }

    /// Insert or replace an item. Returns its id.
    async fn store(&self, item: MemoryItem) -> Result<String>;

    /// Get an item by id. `Ok(None)` if absent.
    async fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>>;

    /// Ranked text search, best match first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;

    /// Replace the content of an existing item.
    async fn update(&self, id: &str, item: MemoryItem) -> Result<bool>;

    /// Remove an item. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Every id held by the backend, in a stable order.
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Every item held by the backend.
    async fn all_items(&self) -> Result<Vec<MemoryItem>> {
        let mut items = Vec::new();
        for id in self.list_keys().await? {
            if let Some(item) = self.retrieve(&id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// State outside the items themselves (graph edges) that a snapshot
    /// must carry to reproduce the backend. `None` when items are all of it.
    async fn auxiliary_state(&self) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Reinstate what [`auxiliary_state`](Self::auxiliary_state) returned.
    /// Called after the snapshot's items are back in place.
    async fn restore_auxiliary_state(&self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn as_vector_store(&self) -> Option<&dyn VectorStore> {
        None
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalStore> {
        None
    }
}

/// Size and shape of a vector collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub count: usize,
    pub dimensions: usize,
}

/// Embedding similarity search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Fixed embedding length of the collection.
    fn dimensions(&self) -> usize;

    /// Insert or replace a raw vector. Returns its id.
    async fn store_vector(&self, vector: MemoryVector) -> Result<String>;

    async fn retrieve_vector(&self, id: &str) -> Result<Option<MemoryVector>>;

    /// The `top_k` closest vectors, most similar first.
    async fn similarity_search(&self, embedding: &[f32], top_k: usize)
    -> Result<Vec<ScoredVector>>;

    async fn collection_stats(&self) -> Result<CollectionStats>;
}

/// Native transactions. Used only by the transaction coordinator.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self, transaction_id: &str) -> Result<()>;

    async fn commit(&self, transaction_id: &str) -> Result<()>;

    async fn rollback(&self, transaction_id: &str) -> Result<()>;

    /// Id of the open transaction, if any.
    fn active_transaction(&self) -> Option<String>;
}

/// The `updated_at` for a new version of an item last stamped `previous`.
///
/// Always strictly later than `previous`, even when the clock has not
/// advanced or went backwards.
pub fn next_updated_at(previous: Timestamp) -> Timestamp {
    let current = now();
    if current > previous {
        current
    } else {
        previous + chrono::Duration::microseconds(1)
    }
}

/// Build the stored form of an update: content and metadata from `item`,
/// identity and creation time from `previous`.
pub fn apply_update(previous: &MemoryItem, item: MemoryItem) -> MemoryItem {
    MemoryItem {
        id: previous.id.clone(),
        content: item.content,
        memory_type: item.memory_type,
        metadata: item.metadata,
        created_at: previous.created_at,
        updated_at: next_updated_at(previous.updated_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::MemoryType;

    #[test]
    fn test_next_updated_at_is_strictly_later() {
        let future = now() + chrono::Duration::seconds(60);
        assert!(next_updated_at(future) > future);

        let past = now() - chrono::Duration::seconds(60);
        assert!(next_updated_at(past) > past);
    }

    #[test]
    fn test_apply_update_keeps_identity() {
        let previous = MemoryItem::new(MemoryType::Working, "old").with_id("doc1");
        let replacement = MemoryItem::new(MemoryType::Semantic, "new").with_metadata("k", "v");

        let updated = apply_update(&previous, replacement);

        assert_eq!(updated.id, "doc1");
        assert_eq!(updated.content, "new");
        assert_eq!(updated.memory_type, MemoryType::Semantic);
        assert_eq!(updated.created_at, previous.created_at);
        assert!(updated.updated_at > previous.updated_at);
    }
}
