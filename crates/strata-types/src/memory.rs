//! Memory items, vectors and the memory-type taxonomy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::{Timestamp, new_id, now};

/// String-keyed metadata attached to items and vectors.
///
/// A `BTreeMap` keeps equality and fingerprints independent of the order in
/// which keys were inserted.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Memory Type
// ─────────────────────────────────────────────────────────────────────────────

/// Category of a memory item.
///
/// The manager routes writes to a backend through a `MemoryType -> backend`
/// dispatch table fixed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    /// Immediate context, discarded quickly.
    ShortTerm,
    /// Context of the task currently being worked on.
    Working,
    /// Past events and executions.
    Episodic,
    /// General knowledge.
    Semantic,
    /// Durable knowledge kept across sessions.
    LongTerm,
    /// Solutions to previously solved problems.
    Solution,
    /// Links between other items.
    Relationship,
    /// Reference documentation.
    Documentation,
    /// Source code fragments.
    Code,
}

impl MemoryType {
    /// Every variant, in declaration order.
    pub const ALL: [MemoryType; 9] = [
        Self::ShortTerm,
        Self::Working,
        Self::Episodic,
        Self::Semantic,
        Self::LongTerm,
        Self::Solution,
        Self::Relationship,
        Self::Documentation,
        Self::Code,
    ];

    /// Canonical string form, as stored by backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "SHORT_TERM",
            Self::Working => "WORKING",
            Self::Episodic => "EPISODIC",
            Self::Semantic => "SEMANTIC",
            Self::LongTerm => "LONG_TERM",
            Self::Solution => "SOLUTION",
            Self::Relationship => "RELATIONSHIP",
            Self::Documentation => "DOCUMENTATION",
            Self::Code => "CODE",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = TypeError;

    /// Accepts the canonical form as well as lower/kebab case
    /// (`working`, `short-term`, `long_term`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| TypeError::UnknownMemoryType(s.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Item
// ─────────────────────────────────────────────────────────────────────────────

/// A single unit of memory held by a backend.
///
/// `id` never changes once the item is stored. Content is replaced only
/// through an explicit update, which moves `updated_at` forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    pub memory_type: MemoryType,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl MemoryItem {
    /// Create an item without an id; the backend assigns one on first store.
    pub fn new(memory_type: MemoryType, content: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: String::new(),
            content: content.into(),
            memory_type,
            metadata: Metadata::new(),
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Set an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override `updated_at` (and `created_at` when it would otherwise be later).
    pub fn with_updated_at(mut self, ts: Timestamp) -> Self {
        self.updated_at = ts;
        if self.created_at > ts {
            self.created_at = ts;
        }
        self
    }

    /// Assign a fresh id if the item does not have one yet. Returns the id.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = new_id();
        }
        &self.id
    }

    /// Deterministic fingerprint over `(memory_type, content)`.
    ///
    /// Two backends holding the same logical item under different ids produce
    /// the same fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let mut hash = simple_hash(self.memory_type.as_str().as_bytes(), FNV_OFFSET);
        hash = simple_hash(&[0x1f], hash);
        simple_hash(self.content.as_bytes(), hash)
    }

    /// Version stamp used by synchronization checkpoints.
    pub fn version(&self) -> VersionStamp {
        VersionStamp {
            updated_at: self.updated_at,
            fingerprint: self.fingerprint(),
            metadata_hash: metadata_hash(&self.metadata),
        }
    }

    /// True when both items carry the same content, type, metadata and
    /// `updated_at`.
    pub fn same_version(&self, other: &MemoryItem) -> bool {
        self.updated_at == other.updated_at
            && self.memory_type == other.memory_type
            && self.content == other.content
            && self.metadata == other.metadata
    }

    /// A token-set view of the content, lowercased, used for text search.
    pub fn tokens(&self) -> Vec<String> {
        tokenize(&self.content)
    }
}

/// Identity of one version of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    pub updated_at: Timestamp,
    pub fingerprint: u64,
    pub metadata_hash: u64,
}

/// Split text into lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// FNV-1a, stable across processes and platforms.
fn simple_hash(bytes: &[u8], seed: u64) -> u64 {
    bytes.iter().fold(seed, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

fn metadata_hash(metadata: &Metadata) -> u64 {
    metadata.iter().fold(FNV_OFFSET, |hash, (k, v)| {
        let hash = simple_hash(k.as_bytes(), hash);
        simple_hash(v.to_string().as_bytes(), hash)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Vector
// ─────────────────────────────────────────────────────────────────────────────

/// An embedding together with the content it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryVector {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
}

impl MemoryVector {
    pub fn new(id: impl Into<String>, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata: Metadata::new(),
            created_at: now(),
        }
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Number of dimensions of the embedding.
    pub fn dimensions(&self) -> usize {
        self.embedding.len()
    }
}

/// A vector paired with its similarity to a query embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredVector {
    pub vector: MemoryVector,
    /// Cosine similarity in `[-1.0, 1.0]`, higher is closer.
    pub score: f32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Search Results
// ─────────────────────────────────────────────────────────────────────────────

/// One ranked result of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub item: MemoryItem,
    /// Relevance score, higher is better. Scales differ between backends.
    pub score: f32,
    /// Name of the backend the hit came from.
    pub backend: String,
}

impl SearchHit {
    pub fn new(item: MemoryItem, score: f32, backend: impl Into<String>) -> Self {
        Self {
            item,
            score,
            backend: backend.into(),
        }
    }
}
