//! Multi-backend memory for Strata.
//!
//! Items live in named backends (document, vector, graph, SQLite). The
//! [`MemoryManager`] routes operations to them, caches reads, fans queries
//! out across several backends, and keeps pairs of backends in sync.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  MemoryManager                                                       │
//! │  - TieredCache of items (per collection)                             │
//! │  - type routing table                                                │
//! ├───────────────────────┬───────────────────────┬──────────────────────┤
//! │  QueryRouter          │  SyncManager          │  BackendRegistry     │
//! │  - direct / cascading │  - checkpoints        │  - name -> entry     │
//! │  - federated          │  - LWW conflict log   │  - CallPolicy        │
//! │  - cross-store        │  - transactions       │    (timeout, retry)  │
//! │  - context-aware      │  - update queue       │                      │
//! ├───────────────────────┴───────────────────────┴──────────────────────┤
//! │  RecoveryManager (optional): snapshots + operation log per backend   │
//! └──────────────────────────────────────────────────────────────────────┘
//!                 │ MemoryStore / VectorStore / TransactionalStore
//!     ┌───────────┼──────────────┬──────────────┐
//!  DocumentStore  VectorMemoryStore  GraphMemoryStore  SqliteStore
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_memory::{DocumentStore, MemoryItem, MemoryManager, MemoryType, QueryStrategy};
//!
//! # async fn demo() -> strata_memory::Result<()> {
//! let manager = MemoryManager::builder()
//!     .with_backend("docs", Arc::new(DocumentStore::new("docs")))
//!     .build()?;
//!
//! let id = manager
//!     .store("docs", MemoryItem::new(MemoryType::Working, "hello"))
//!     .await?;
//! let item = manager.retrieve("docs", &id).await?;
//! assert!(item.is_some());
//!
//! let results = manager
//!     .route_query("hello", QueryStrategy::Federated, None)
//!     .await?;
//! println!("{} hits", results.hits.len());
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod backend;
pub mod embedding;
pub mod error;
pub mod logging;
pub mod manager;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod router;
pub mod sync;
pub mod testing;
pub mod validation;

// Backend contract
pub use backend::{Capabilities, CollectionStats, MemoryStore, TransactionalStore, VectorStore};

// Adapters
pub use adapters::{
    DocumentStore, FallbackStatus, FallbackStore, GraphMemoryStore, GraphStats, Relationship,
    RelationshipType, SqliteStore, StoreStatus, VectorMemoryStore, build_backend,
};

pub use embedding::{EmbeddingProvider, HashEmbedder, SharedEmbedder, cosine_similarity};

// Errors
pub use error::{MemoryError, Result};
pub use validation::ValidationError;

// Registry and call policy
pub use registry::{BackendEntry, BackendRegistry, CallPolicy};
pub use retry::{RetryConfig, retry};

// Routing
pub use router::{
    BackendWarning, QueryRouter, QueryStrategy, RouteRequest, RoutedResults, WarningKind,
};

// Synchronization
pub use sync::{
    ConflictLog, ConflictRecord, ConflictWinner, FlushReport, QueuedUpdate, ResolutionReason,
    SyncManager, SyncReport, SyncStats, Transaction, TransactionCoordinator, TransactionReport,
    TransactionState, TxOperation,
};

pub use manager::{MemoryManager, MemoryManagerBuilder};
pub use recovery::{
    LoggedEntry, LoggedOperation, MemorySnapshot, RecoveryManager, RecoveryReport,
};
pub use logging::init_logging;
pub use testing::FlakyStore;

// Domain types
pub use strata_types::{
    MemoryItem, MemoryType, MemoryVector, Metadata, ScoredVector, SearchHit, VersionStamp,
};
