//! Validation utilities for items and vectors entering a backend.
//!
//! This module provides validation for:
//! - Embedding dimensions and values
//! - Item content
//! - Id immutability on update

use strata_types::{MemoryItem, MemoryType};

// ─────────────────────────────────────────────────────────────────────────────
// Validation Error
// ─────────────────────────────────────────────────────────────────────────────

/// Specific validation error types. Never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Item content contains NUL bytes.
    #[error("memory content contains NUL bytes")]
    InvalidContent,

    /// Embedding dimension mismatch.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// Embedding contains invalid values (NaN or Inf).
    #[error("embedding contains {count} invalid values (NaN or Inf)")]
    InvalidEmbeddingValues {
        /// Number of invalid values found.
        count: usize,
    },

    /// An update tried to change an item's id.
    #[error("item id '{actual}' does not match target id '{expected}'")]
    IdMismatch { expected: String, actual: String },

    /// The id argument is empty.
    #[error("item id is empty")]
    EmptyId,

    /// The backend cannot serve vector operations.
    #[error("backend '{0}' is not vector-capable")]
    NotVectorCapable(String),

    /// Neither the dispatch table nor a default backend covers this type.
    #[error("no backend is routed for memory type {0}")]
    UnroutableType(MemoryType),

    /// Malformed argument to a routed or transactional operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate an embedding vector.
///
/// Checks:
/// 1. Dimension matches expected size
/// 2. No NaN or Inf values
pub fn validate_embedding(embedding: &[f32], expected_dim: usize) -> Result<(), ValidationError> {
    if embedding.len() != expected_dim {
        return Err(ValidationError::DimensionMismatch {
            expected: expected_dim,
            actual: embedding.len(),
        });
    }

    let invalid_count = embedding
        .iter()
        .filter(|v| v.is_nan() || v.is_infinite())
        .count();

    if invalid_count > 0 {
        return Err(ValidationError::InvalidEmbeddingValues {
            count: invalid_count,
        });
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Item Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate item content. Any text is accepted, the empty string included,
/// except text containing NUL bytes.
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.contains('\0') {
        return Err(ValidationError::InvalidContent);
    }
    Ok(())
}

/// Validate an item before any backend sees it.
pub fn validate_item(item: &MemoryItem) -> Result<(), ValidationError> {
    validate_content(&item.content)
}

/// Validate an update: the target id is non-empty and the replacement item
/// either carries no id or the same one.
pub fn validate_update(target_id: &str, item: &MemoryItem) -> Result<(), ValidationError> {
    if target_id.is_empty() {
        return Err(ValidationError::EmptyId);
    }
    if !item.id.is_empty() && item.id != target_id {
        return Err(ValidationError::IdMismatch {
            expected: target_id.to_string(),
            actual: item.id.clone(),
        });
    }
    validate_item(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_embedding_valid() {
        let embedding = vec![0.1, 0.2, 0.3, 0.4];
        assert!(validate_embedding(&embedding, 4).is_ok());
    }

    #[test]
    fn test_validate_embedding_wrong_dimension() {
        let embedding = vec![0.1, 0.2, 0.3];
        let result = validate_embedding(&embedding, 4);
        assert_eq!(
            result,
            Err(ValidationError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_validate_embedding_nan_and_infinity() {
        let embedding = vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 0.4];
        assert_eq!(
            validate_embedding(&embedding, 4),
            Err(ValidationError::InvalidEmbeddingValues { count: 3 })
        );
    }

    #[test]
    fn test_validate_content() {
        assert!(validate_content("hello").is_ok());
        assert!(validate_content("").is_ok());
        assert_eq!(validate_content("a\0b"), Err(ValidationError::InvalidContent));
    }

    #[test]
    fn test_validate_update_rejects_id_change() {
        let item = MemoryItem::new(MemoryType::Working, "x").with_id("other");
        assert!(matches!(
            validate_update("doc1", &item),
            Err(ValidationError::IdMismatch { .. })
        ));

        let same = MemoryItem::new(MemoryType::Working, "x").with_id("doc1");
        assert!(validate_update("doc1", &same).is_ok());

        let anonymous = MemoryItem::new(MemoryType::Working, "x");
        assert!(validate_update("doc1", &anonymous).is_ok());
        assert_eq!(validate_update("", &anonymous), Err(ValidationError::EmptyId));
    }
}
