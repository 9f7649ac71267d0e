//! Errors raised while interpreting shared types.

use thiserror::Error;

/// Errors produced by parsing or converting domain types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("unknown memory type: {0}")]
    UnknownMemoryType(String),
}
