//! # KV Errors
//!
//! Failure modes of the store contract. A missing key is not an error: reads
//! return `Ok(None)`.

use crate::store::Version;
use thiserror::Error;

/// Errors returned by [`KeyValueStore`](crate::KeyValueStore) operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    /// A conditional write lost a compare-and-swap race.
    ///
    /// The caller must re-read and retry; the store never retries.
    #[error("version conflict on '{key}': expected {expected:?}, found {actual:?}")]
    Conflict {
        key: String,
        expected: Option<Version>,
        actual: Option<Version>,
    },

    /// The write required the key to be absent.
    #[error("key '{key}' already exists")]
    AlreadyExists { key: String },

    /// The write required the key to be present.
    #[error("key '{key}' does not exist")]
    Absent { key: String },

    /// Transport or connection failure. Retryable.
    #[error("key-value store unavailable: {message}")]
    Unavailable { message: String },

    /// Malformed key.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Contradictory write options.
    #[error("invalid write options for '{key}': {reason}")]
    InvalidOptions { key: String, reason: &'static str },
}

impl KvError {
    /// Whether the operation may succeed if simply repeated later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Unavailable { .. })
    }

    /// Whether the error is an optimistic-concurrency failure.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            KvError::Conflict { .. } | KvError::AlreadyExists { .. } | KvError::Absent { .. }
        )
    }
}
