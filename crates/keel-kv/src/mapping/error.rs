use crate::error::KvError;
use thiserror::Error;

/// Errors from saving or loading mapped objects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapperError {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] KvError),

    /// A required field has no value in the store.
    #[error("required field '{field}' missing under '{path}'")]
    MissingField { path: String, field: &'static str },

    /// A stored value could not be decoded.
    #[error("malformed value at '{key}': {reason}")]
    Malformed { key: String, reason: String },

    /// A field value could not be encoded.
    #[error("cannot encode '{key}': {reason}")]
    Encode { key: String, reason: String },

    /// The subtree was written for a different type.
    #[error("object at '{path}' is a '{found}', expected '{expected}'")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: String,
    },
}

impl MapperError {
    /// Whether the error came from a retryable store failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, MapperError::Store(e) if e.is_retryable())
    }

    /// Whether the error is a lost optimistic-concurrency race.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, MapperError::Store(e) if e.is_conflict())
    }
}
