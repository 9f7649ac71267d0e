//! In-memory key/value document store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use strata_types::{MemoryItem, SearchHit, VersionStamp};
use tracing::{debug, trace, warn};

use super::rank_text_matches;
use crate::backend::{MemoryStore, apply_update};
use crate::error::{MemoryError, Result};
use crate::validation::{validate_item, validate_update};

#[derive(Debug, Clone)]
struct StoredDocument {
    item: MemoryItem,
    checksum: VersionStamp,
}

impl StoredDocument {
    fn new(item: MemoryItem) -> Self {
        let checksum = item.version();
        Self { item, checksum }
    }
}

/// Key/value store keeping each item with a checksum verified on read.
///
/// Non-transactional: cross-store transactions snapshot and restore it.
#[derive(Debug)]
pub struct DocumentStore {
    name: String,
    documents: RwLock<BTreeMap<String, StoredDocument>>,
}

impl DocumentStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    fn verify(&self, doc: &StoredDocument) -> Result<MemoryItem> {
        if doc.item.version() != doc.checksum {
            warn!(backend = %self.name, item_id = %doc.item.id, "Checksum mismatch");
            return Err(MemoryError::corruption(
                &self.name,
                format!("checksum mismatch for '{}'", doc.item.id),
            ));
        }
        Ok(doc.item.clone())
    }

    /// Overwrite stored content without refreshing the checksum.
    #[cfg(test)]
    fn tamper(&self, id: &str, content: &str) {
        if let Some(doc) = self.documents.write().get_mut(id) {
            doc.item.content = content.to_string();
        }
    }
}

#[async_trait]
impl MemoryStore for DocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, mut item: MemoryItem) -> Result<String> {
        validate_item(&item)?;
        let id = item.ensure_id().to_string();
        self.documents
            .write()
            .insert(id.clone(), StoredDocument::new(item));
        trace!(backend = %self.name, item_id = %id, "Stored document");
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>> {
        let documents = self.documents.read();
        documents.get(id).map(|doc| self.verify(doc)).transpose()
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let documents = self.documents.read();
        let items = documents
            .values()
            .map(|doc| self.verify(doc))
            .collect::<Result<Vec<_>>>()?;
        Ok(rank_text_matches(&self.name, query, &items, limit))
    }

    async fn update(&self, id: &str, item: MemoryItem) -> Result<bool> {
        validate_update(id, &item)?;
        let mut documents = self.documents.write();
        let Some(existing) = documents.get(id) else {
            return Ok(false);
        };
        let previous = self.verify(existing)?;
        documents.insert(id.to_string(), StoredDocument::new(apply_update(&previous, item)));
        debug!(backend = %self.name, item_id = %id, "Updated document");
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.documents.write().remove(id).is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.documents.read().keys().cloned().collect())
    }

    async fn all_items(&self) -> Result<Vec<MemoryItem>> {
        let documents = self.documents.read();
        documents.values().map(|doc| self.verify(doc)).collect()
    }
}
