//! Reference backend adapters.
//!
//! | adapter              | capabilities            |
//! |----------------------|-------------------------|
//! | [`DocumentStore`]    | base                    |
//! | [`VectorMemoryStore`]| base + vector           |
//! | [`GraphMemoryStore`] | base + graph + native tx|
//! | [`SqliteStore`]      | base + native tx        |
//! | [`FallbackStore`]    | base, wraps other stores|

mod document;
mod fallback;
mod graph;
mod sqlite;
mod vector;

use std::collections::BTreeSet;
use std::sync::Arc;

use strata_config::{BackendConfig, BackendKind};
use strata_types::{MemoryItem, SearchHit, tokenize};
use tracing::debug;

use crate::backend::MemoryStore;
use crate::embedding::SharedEmbedder;
use crate::error::{MemoryError, Result};
use crate::validation::ValidationError;

pub use document::DocumentStore;
pub use fallback::{DEFAULT_UNAVAILABLE_AFTER, FallbackStatus, FallbackStore, StoreStatus};
pub use graph::{GraphMemoryStore, GraphStats, Relationship, RelationshipType};
pub use sqlite::SqliteStore;
pub use vector::VectorMemoryStore;

/// Construct the adapter a `[backends.<name>]` section declares.
pub fn build_backend(
    name: &str,
    config: &BackendConfig,
    embedder: &SharedEmbedder,
) -> Result<Arc<dyn MemoryStore>> {
    debug!(backend = %name, kind = %config.kind, "Building backend");
    let store: Arc<dyn MemoryStore> = match config.kind {
        BackendKind::Document => Arc::new(DocumentStore::new(name)),
        BackendKind::Graph => Arc::new(GraphMemoryStore::new(name)),
        BackendKind::Vector => {
            if let Some(dimensions) = config.dimensions
                && dimensions != embedder.dimensions()
            {
                return Err(MemoryError::Validation(ValidationError::DimensionMismatch {
                    expected: dimensions,
                    actual: embedder.dimensions(),
                }));
            }
            Arc::new(VectorMemoryStore::new(name, Arc::clone(embedder)))
        }
        BackendKind::Sqlite => match &config.path {
            Some(path) => Arc::new(SqliteStore::open(name, path)?),
            None => Arc::new(SqliteStore::open_in_memory(name)?),
        },
    };
    Ok(store)
}

/// Fraction of distinct query tokens present in `content`.
pub(crate) fn token_overlap(query_tokens: &BTreeSet<String>, content: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens: BTreeSet<String> = tokenize(content).into_iter().collect();
    let matched = query_tokens.intersection(&content_tokens).count();
    matched as f32 / query_tokens.len() as f32
}

pub(crate) fn query_tokens(query: &str) -> BTreeSet<String> {
    tokenize(query).into_iter().collect()
}

/// Score items by token overlap and keep the best `limit`.
pub(crate) fn rank_text_matches<'a>(
    backend: &str,
    query: &str,
    items: impl IntoIterator<Item = &'a MemoryItem>,
    limit: usize,
) -> Vec<SearchHit> {
    let tokens = query_tokens(query);
    let mut hits: Vec<SearchHit> = items
        .into_iter()
        .filter_map(|item| {
            let score = token_overlap(&tokens, &item.content);
            (score > 0.0).then(|| SearchHit::new(item.clone(), score, backend))
        })
        .collect();
    sort_hits(&mut hits);
    hits.truncate(limit);
    hits
}

/// Score descending, then id for a stable order.
pub(crate) fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.item.id.cmp(&b.item.id))
    });
}
