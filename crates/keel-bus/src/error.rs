//! # Bus Errors
//!
//! Failures of bus creation and lookup. Subscriber failures are not errors
//! here: they are recovered during dispatch and reported as
//! [`ExceptionInfo`](crate::ExceptionInfo).

use keel_kv::KvError;
use thiserror::Error;

/// Errors from the bus registry.
#[derive(Debug, Error)]
pub enum BusError {
    /// The name is registered with a different payload type.
    #[error("bus '{name}' carries {existing}, requested {requested}")]
    TypeConflict {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// The name is registered as a different kind of bus (plain or
    /// persistent).
    #[error("bus '{name}' already exists as a {existing} bus")]
    KindConflict {
        name: String,
        existing: &'static str,
    },

    /// Bus names must be non-empty and must not contain '/'.
    #[error("invalid bus name '{name}'")]
    InvalidName { name: String },

    /// History capacity must be at least one.
    #[error("invalid history capacity {capacity} for bus '{name}'")]
    InvalidCapacity { name: String, capacity: usize },

    /// A durable bus was requested but the registry has no store.
    #[error("bus '{name}' requires a key-value store")]
    StoreMissing { name: String },

    /// Restoring a durable bus's journal failed.
    #[error("journal of bus '{name}' unavailable: {source}")]
    Journal {
        name: String,
        #[source]
        source: KvError,
    },
}

impl BusError {
    /// Whether this is a name re-requested with an incompatible shape.
    #[must_use]
    pub fn is_creation_conflict(&self) -> bool {
        matches!(
            self,
            BusError::TypeConflict { .. } | BusError::KindConflict { .. }
        )
    }
}
