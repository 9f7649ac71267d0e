//! Error types for the memory crate.

use std::time::Duration;

use thiserror::Error;

use crate::validation::ValidationError;

/// Errors that can occur in the memory crate.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The input does not fit the target backend's shape.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// No backend is registered under this name.
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// A backend is already registered under this name.
    #[error("Backend already registered: {0}")]
    DuplicateBackend(String),

    /// Transient backend failure. Retried with backoff.
    #[error("Storage error in '{backend}': {message}")]
    Storage { backend: String, message: String },

    /// Irrecoverable backend failure. Never retried.
    #[error("Corruption in '{backend}': {message}")]
    Corruption { backend: String, message: String },

    /// Divergent versions of one item. Resolved internally during sync.
    #[error("Conflict on '{id}' between '{store_a}' and '{store_b}'")]
    Conflict {
        id: String,
        store_a: String,
        store_b: String,
    },

    /// A transaction failed and every participant was restored.
    #[error("Transaction {transaction_id} aborted: {reason}")]
    TransactionAborted {
        transaction_id: String,
        reason: String,
    },

    /// A backend call exceeded its deadline.
    #[error("Backend '{backend}' timed out after {after:?}")]
    Timeout { backend: String, after: Duration },

    /// An operation targeted an item that does not exist.
    #[error("Item '{id}' not found in '{backend}'")]
    NotFound { backend: String, id: String },

    /// Every backend targeted by a routed query failed.
    #[error("All backends failed for {strategy} query: {}", .failures.join("; "))]
    AllBackendsFailed {
        strategy: String,
        failures: Vec<String>,
    },

    /// The transaction is not in a state that permits the operation.
    #[error("Transaction {transaction_id} is {state}; cannot {operation}")]
    InvalidTransactionState {
        transaction_id: String,
        state: String,
        operation: String,
    },

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A snapshot or operation log could not be written, read or replayed.
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Filesystem failure outside a backend (snapshot and log files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be turned into a manager.
    #[error("Configuration error: {0}")]
    Config(#[from] strata_config::ConfigError),
}

impl MemoryError {
    pub fn storage(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Storage {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn corruption(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Corruption {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(backend: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            backend: backend.into(),
            id: id.into(),
        }
    }

    /// Only transient storage failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Backend the error originated from, when known.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::Storage { backend, .. }
            | Self::Corruption { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::NotFound { backend, .. } => Some(backend),
            Self::BackendNotFound(name) | Self::DuplicateBackend(name) => Some(name),
            _ => None,
        }
    }
}

/// Result type alias for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_is_retryable() {
        assert!(MemoryError::storage("docs", "disk busy").is_retryable());
        assert!(!MemoryError::corruption("docs", "bad checksum").is_retryable());
        assert!(
            !MemoryError::Timeout {
                backend: "docs".into(),
                after: Duration::from_millis(5),
            }
            .is_retryable()
        );
        assert!(!MemoryError::from(ValidationError::InvalidContent).is_retryable());
        assert!(!MemoryError::BackendNotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_all_backends_failed_message() {
        let err = MemoryError::AllBackendsFailed {
            strategy: "federated".into(),
            failures: vec!["a: down".into(), "b: down".into()],
        };
        assert_eq!(
            err.to_string(),
            "All backends failed for federated query: a: down; b: down"
        );
    }

    #[test]
    fn test_backend_accessor() {
        assert_eq!(MemoryError::not_found("graph", "n1").backend(), Some("graph"));
        assert_eq!(MemoryError::from(ValidationError::InvalidContent).backend(), None);
    }
}
