//! In-memory knowledge graph: items as nodes plus typed relationships.
//!
//! Native transactions are implemented with an undo journal. While a
//! transaction is open every mutation records how to reverse itself, and
//! `rollback` replays those records newest first.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_types::{MemoryItem, SearchHit};
use tracing::{debug, info, trace, warn};

use super::{query_tokens, sort_hits, token_overlap};
use crate::backend::{Capabilities, MemoryStore, TransactionalStore, apply_update};
use crate::error::{MemoryError, Result};
use crate::validation::{validate_item, validate_update};

/// Weight applied to a match found on a neighbour rather than the node.
const NEIGHBOUR_WEIGHT: f32 = 0.5;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Relationship types supported in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// One item supports another (evidence, citation).
    Supports,
    /// One item contradicts another.
    Contradicts,
    /// General relationship between items.
    RelatedTo,
    /// One item depends on another.
    DependsOn,
    /// One item is part of another.
    PartOf,
    /// One item was derived from another.
    DerivedFrom,
    /// A solution item solves a problem item.
    Solves,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supports => "SUPPORTS",
            Self::Contradicts => "CONTRADICTS",
            Self::RelatedTo => "RELATED_TO",
            Self::DependsOn => "DEPENDS_ON",
            Self::PartOf => "PART_OF",
            Self::DerivedFrom => "DERIVED_FROM",
            Self::Solves => "SOLVES",
        }
    }
}

/// A directed edge between two items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_id: String,
    pub to_id: String,
    pub rel_type: RelationshipType,
}

impl Relationship {
    pub fn new(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        rel_type: RelationshipType,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            rel_type,
        }
    }

    fn touches(&self, id: &str) -> bool {
        self.from_id == id || self.to_id == id
    }

    /// The endpoint that is not `id`.
    fn other(&self, id: &str) -> &str {
        if self.from_id == id {
            &self.to_id
        } else {
            &self.from_id
        }
    }
}

/// Graph statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStats {
    pub nodes: usize,
    pub relationships: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Undo Journal
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum UndoOp {
    /// Put the node back the way it was (`None` means it did not exist).
    Node {
        id: String,
        previous: Option<MemoryItem>,
    },
    /// Restore the full edge list.
    Edges(Vec<Relationship>),
}

#[derive(Debug)]
struct Journal {
    transaction_id: String,
    undo: Vec<UndoOp>,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<String, MemoryItem>,
    edges: Vec<Relationship>,
    journal: Option<Journal>,
}

impl GraphState {
    fn record(&mut self, op: UndoOp) {
        if let Some(journal) = &mut self.journal {
            journal.undo.push(op);
        }
    }

    fn put_node(&mut self, item: MemoryItem) {
        let id = item.id.clone();
        let previous = self.nodes.insert(id.clone(), item);
        self.record(UndoOp::Node { id, previous });
    }

    fn remove_node(&mut self, id: &str) -> bool {
        let Some(previous) = self.nodes.remove(id) else {
            return false;
        };
        self.record(UndoOp::Node {
            id: id.to_string(),
            previous: Some(previous),
        });
        if self.edges.iter().any(|e| e.touches(id)) {
            self.record(UndoOp::Edges(self.edges.clone()));
            self.edges.retain(|e| !e.touches(id));
        }
        true
    }

    fn add_edge(&mut self, relationship: Relationship) {
        if self.edges.contains(&relationship) {
            return;
        }
        self.record(UndoOp::Edges(self.edges.clone()));
        self.edges.push(relationship);
    }

    /// Replace the edge list, dropping edges whose endpoints are missing.
    /// Returns how many were dropped.
    fn replace_edges(&mut self, edges: Vec<Relationship>) -> usize {
        let total = edges.len();
        let kept: Vec<Relationship> = edges
            .into_iter()
            .filter(|e| self.nodes.contains_key(&e.from_id) && self.nodes.contains_key(&e.to_id))
            .collect();
        let dropped = total - kept.len();
        if kept != self.edges {
            let previous = std::mem::replace(&mut self.edges, kept);
            self.record(UndoOp::Edges(previous));
        }
        dropped
    }

    fn neighbours<'a>(&'a self, id: &'a str) -> impl Iterator<Item = (&'a Relationship, &'a MemoryItem)> {
        self.edges
            .iter()
            .filter(move |e| e.touches(id))
            .filter_map(move |e| self.nodes.get(e.other(id)).map(|node| (e, node)))
    }

    fn check_transaction(&self, transaction_id: &str, operation: &str) -> Result<()> {
        match &self.journal {
            Some(journal) if journal.transaction_id == transaction_id => Ok(()),
            Some(journal) => Err(MemoryError::InvalidTransactionState {
                transaction_id: transaction_id.to_string(),
                state: format!("not open (active: {})", journal.transaction_id),
                operation: operation.to_string(),
            }),
            None => Err(MemoryError::InvalidTransactionState {
                transaction_id: transaction_id.to_string(),
                state: "not open".to_string(),
                operation: operation.to_string(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Graph Store
// ─────────────────────────────────────────────────────────────────────────────

/// Graph-shaped memory store with native transactions.
#[derive(Debug)]
pub struct GraphMemoryStore {
    name: String,
    state: Mutex<GraphState>,
}

impl GraphMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(GraphState::default()),
        }
    }

    /// Add a directed relationship. Both endpoints must exist.
    pub fn relate(&self, relationship: Relationship) -> Result<()> {
        let mut state = self.state.lock();
        for id in [&relationship.from_id, &relationship.to_id] {
            if !state.nodes.contains_key(id.as_str()) {
                return Err(MemoryError::not_found(&self.name, id.as_str()));
            }
        }
        debug!(
            backend = %self.name,
            from = %relationship.from_id,
            to = %relationship.to_id,
            rel_type = relationship.rel_type.as_str(),
            "Adding relationship"
        );
        state.add_edge(relationship);
        Ok(())
    }

    /// Items directly connected to `id`, in either direction.
    pub fn related(&self, id: &str) -> Vec<(RelationshipType, MemoryItem)> {
        let state = self.state.lock();
        state
            .neighbours(id)
            .map(|(edge, node)| (edge.rel_type, node.clone()))
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        let state = self.state.lock();
        GraphStats {
            nodes: state.nodes.len(),
            relationships: state.edges.len(),
        }
    }
}

#[async_trait]
impl MemoryStore for GraphMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: true,
            graph: true,
            ..Capabilities::BASIC
        }
    }

    async fn store(&self, mut item: MemoryItem) -> Result<String> {
        validate_item(&item)?;
        let id = item.ensure_id().to_string();
        self.state.lock().put_node(item);
        trace!(backend = %self.name, item_id = %id, "Stored node");
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>> {
        Ok(self.state.lock().nodes.get(id).cloned())
    }

    /// Matches on a node's own content score fully; matches that only occur
    /// on a neighbour score at half weight.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let tokens = query_tokens(query);
        let state = self.state.lock();
        let mut hits: Vec<SearchHit> = state
            .nodes
            .values()
            .filter_map(|node| {
                let direct = token_overlap(&tokens, &node.content);
                let via_neighbour = state
                    .neighbours(&node.id)
                    .map(|(_, n)| token_overlap(&tokens, &n.content) * NEIGHBOUR_WEIGHT)
                    .fold(0.0f32, f32::max);
                let score = direct.max(via_neighbour);
                (score > 0.0).then(|| SearchHit::new(node.clone(), score, &self.name))
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn update(&self, id: &str, item: MemoryItem) -> Result<bool> {
        validate_update(id, &item)?;
        let mut state = self.state.lock();
        let Some(previous) = state.nodes.get(id) else {
            return Ok(false);
        };
        let updated = apply_update(previous, item);
        state.put_node(updated);
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.state.lock().remove_node(id))
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().nodes.keys().cloned().collect())
    }

    async fn all_items(&self) -> Result<Vec<MemoryItem>> {
        Ok(self.state.lock().nodes.values().cloned().collect())
    }

    async fn auxiliary_state(&self) -> Result<Option<serde_json::Value>> {
        let state = self.state.lock();
        let edges = serde_json::to_value(&state.edges)
            .map_err(|e| MemoryError::storage(&self.name, format!("encode edges: {e}")))?;
        Ok(Some(edges))
    }

    async fn restore_auxiliary_state(&self, state: serde_json::Value) -> Result<()> {
        let edges: Vec<Relationship> = serde_json::from_value(state)
            .map_err(|e| MemoryError::corruption(&self.name, format!("decode edges: {e}")))?;
        let dropped = self.state.lock().replace_edges(edges);
        if dropped > 0 {
            warn!(backend = %self.name, dropped, "Skipped edges with missing endpoints");
        }
        Ok(())
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalStore> {
        Some(self)
    }
}

#[async_trait]
impl TransactionalStore for GraphMemoryStore {
    async fn begin(&self, transaction_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(journal) = &state.journal {
            return Err(MemoryError::InvalidTransactionState {
                transaction_id: transaction_id.to_string(),
                state: format!("blocked by open transaction {}", journal.transaction_id),
                operation: "begin".to_string(),
            });
        }
        state.journal = Some(Journal {
            transaction_id: transaction_id.to_string(),
            undo: Vec::new(),
        });
        debug!(backend = %self.name, transaction_id, "Graph transaction started");
        Ok(())
    }

    async fn commit(&self, transaction_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_transaction(transaction_id, "commit")?;
        state.journal = None;
        debug!(backend = %self.name, transaction_id, "Graph transaction committed");
        Ok(())
    }

    async fn rollback(&self, transaction_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_transaction(transaction_id, "rollback")?;
        let Some(journal) = state.journal.take() else {
            return Ok(());
        };
        let undone = journal.undo.len();
        for op in journal.undo.into_iter().rev() {
            match op {
                UndoOp::Node {
                    id,
                    previous: Some(item),
                } => {
                    state.nodes.insert(id, item);
                }
                UndoOp::Node { id, previous: None } => {
                    state.nodes.remove(&id);
                }
                UndoOp::Edges(edges) => state.edges = edges,
            }
        }
        info!(backend = %self.name, transaction_id, undone, "Graph transaction rolled back");
        Ok(())
    }

    fn active_transaction(&self) -> Option<String> {
        self.state
            .lock()
            .journal
            .as_ref()
            .map(|j| j.transaction_id.clone())
    }
}
