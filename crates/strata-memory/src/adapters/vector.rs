//! Embedding-backed vector store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use strata_types::{MemoryItem, MemoryType, MemoryVector, ScoredVector, SearchHit};
use tracing::{debug, trace};

use super::sort_hits;
use crate::backend::{Capabilities, CollectionStats, MemoryStore, VectorStore, apply_update};
use crate::embedding::{SharedEmbedder, cosine_similarity};
use crate::error::Result;
use crate::validation::{validate_embedding, validate_item, validate_update};

/// Metadata key recording the memory type of a raw vector.
const MEMORY_TYPE_KEY: &str = "memory_type";

#[derive(Debug, Clone)]
struct VectorEntry {
    item: MemoryItem,
    embedding: Vec<f32>,
}

impl VectorEntry {
    fn to_vector(&self) -> MemoryVector {
        MemoryVector {
            id: self.item.id.clone(),
            content: self.item.content.clone(),
            embedding: self.embedding.clone(),
            metadata: self.item.metadata.clone(),
            created_at: self.item.created_at,
        }
    }
}

/// Vector collection that embeds item content through an injected
/// [`EmbeddingProvider`](crate::EmbeddingProvider).
///
/// Items and raw vectors share one id space: a raw vector is visible as an
/// item and every stored item has an embedding.
pub struct VectorMemoryStore {
    name: String,
    embedder: SharedEmbedder,
    dimensions: usize,
    entries: RwLock<BTreeMap<String, VectorEntry>>,
}

impl std::fmt::Debug for VectorMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorMemoryStore")
            .field("name", &self.name)
            .field("embedder", &self.embedder.name())
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl VectorMemoryStore {
    /// Create a collection whose dimensionality is the embedder's.
    pub fn new(name: impl Into<String>, embedder: SharedEmbedder) -> Self {
        let dimensions = embedder.dimensions();
        Self {
            name: name.into(),
            embedder,
            dimensions,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.embedder.embed(text).await?;
        validate_embedding(&embedding, self.dimensions)?;
        Ok(embedding)
    }

    fn insert(&self, item: MemoryItem, embedding: Vec<f32>) {
        let id = item.id.clone();
        self.entries
            .write()
            .insert(id, VectorEntry { item, embedding });
    }

    fn rank(&self, query: &[f32], limit: usize) -> Vec<(VectorEntry, f32)> {
        let entries = self.entries.read();
        let mut scored: Vec<(VectorEntry, f32)> = entries
            .values()
            .map(|entry| (entry.clone(), cosine_similarity(query, &entry.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.item.id.cmp(&b.0.item.id)));
        scored.truncate(limit);
        scored
    }
}

#[async_trait]
impl MemoryStore for VectorMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            vector: true,
            ..Capabilities::BASIC
        }
    }

    async fn store(&self, mut item: MemoryItem) -> Result<String> {
        validate_item(&item)?;
        let embedding = self.embed(&item.content).await?;
        let id = item.ensure_id().to_string();
        self.insert(item, embedding);
        trace!(backend = %self.name, item_id = %id, "Stored vector item");
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>> {
        Ok(self.entries.read().get(id).map(|entry| entry.item.clone()))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let embedding = self.embed(query).await?;
        let mut hits: Vec<SearchHit> = self
            .rank(&embedding, limit)
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(entry, score)| SearchHit::new(entry.item, score, &self.name))
            .collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    async fn update(&self, id: &str, item: MemoryItem) -> Result<bool> {
        validate_update(id, &item)?;
        if !self.entries.read().contains_key(id) {
            return Ok(false);
        }
        let embedding = self.embed(&item.content).await?;

        // Re-read under the write lock: the item may have changed or gone
        // while the embedding was computed.
        let mut entries = self.entries.write();
        let Some(current) = entries.get(id) else {
            return Ok(false);
        };
        let updated = apply_update(&current.item, item);
        entries.insert(
            id.to_string(),
            VectorEntry {
                item: updated,
                embedding,
            },
        );
        debug!(backend = %self.name, item_id = %id, "Updated vector item");
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.entries.write().remove(id).is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn all_items(&self) -> Result<Vec<MemoryItem>> {
        Ok(self
            .entries
            .read()
            .values()
            .map(|entry| entry.item.clone())
            .collect())
    }

    fn as_vector_store(&self) -> Option<&dyn VectorStore> {
        Some(self)
    }
}

#[async_trait]
impl VectorStore for VectorMemoryStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn store_vector(&self, vector: MemoryVector) -> Result<String> {
        validate_embedding(&vector.embedding, self.dimensions)?;
        let memory_type = vector
            .metadata
            .get(MEMORY_TYPE_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<MemoryType>().ok())
            .unwrap_or(MemoryType::Semantic);
        let mut item = MemoryItem {
            id: vector.id,
            content: vector.content,
            memory_type,
            metadata: vector.metadata,
            created_at: vector.created_at,
            updated_at: vector.created_at,
        };
        let id = item.ensure_id().to_string();
        self.insert(item, vector.embedding);
        Ok(id)
    }

    async fn retrieve_vector(&self, id: &str) -> Result<Option<MemoryVector>> {
        Ok(self.entries.read().get(id).map(VectorEntry::to_vector))
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredVector>> {
        validate_embedding(embedding, self.dimensions)?;
        Ok(self
            .rank(embedding, top_k)
            .into_iter()
            .map(|(entry, score)| ScoredVector {
                vector: entry.to_vector(),
                score,
            })
            .collect())
    }

    async fn collection_stats(&self) -> Result<CollectionStats> {
        Ok(CollectionStats {
            name: self.name.clone(),
            count: self.entries.read().len(),
            dimensions: self.dimensions,
        })
    }
}
