//! # Store Contract
//!
//! The narrow interface this crate requires from a distributed key-value
//! service (etcd-like): versioned get/set/delete over string keys and byte
//! values, prefix listing, and prefix watches.
//!
//! Production: a client for the cluster's KV service.
//! Testing: [`InMemoryKvStore`](crate::InMemoryKvStore).

use crate::error::KvError;
use crate::watch::WatchStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Monotonic modification index assigned by the store on every write.
pub type Version = u64;

/// A stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Full key path.
    pub key: String,
    /// Raw value.
    pub value: Vec<u8>,
    /// Version of the last write to this key.
    pub version: Version,
    /// Time to live the entry was written with, if any.
    pub ttl: Option<Duration>,
}

/// Options for a single write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Compare-and-swap: write only if the current version equals this.
    pub expected_version: Option<Version>,
    /// Expire the entry after this duration.
    pub ttl: Option<Duration>,
    /// Fail with [`KvError::AlreadyExists`] if the key is present.
    pub fail_if_exists: bool,
    /// Fail with [`KvError::Absent`] if the key is missing.
    pub fail_if_absent: bool,
}

impl WriteOptions {
    /// Unconditional write without TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the current version to be `version`.
    #[must_use]
    pub fn expect_version(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Expire the entry after `ttl`.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn fail_if_exists(mut self) -> Self {
        self.fail_if_exists = true;
        self
    }

    #[must_use]
    pub fn fail_if_absent(mut self) -> Self {
        self.fail_if_absent = true;
        self
    }

    /// Reject contradictory combinations.
    pub fn validate(&self, key: &str) -> Result<(), KvError> {
        if self.fail_if_exists && self.fail_if_absent {
            return Err(KvError::InvalidOptions {
                key: key.to_string(),
                reason: "fail_if_exists and fail_if_absent are mutually exclusive",
            });
        }
        if self.fail_if_exists && self.expected_version.is_some() {
            return Err(KvError::InvalidOptions {
                key: key.to_string(),
                reason: "an expected version implies the key exists",
            });
        }
        Ok(())
    }
}

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    /// The entry's TTL elapsed.
    Expired,
    /// The watcher fell behind and events were dropped; resynchronize.
    Lagged,
}

/// A change notification delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: ChangeKind,
    /// New value for `Created`/`Updated`, `None` otherwise.
    pub value: Option<Vec<u8>>,
    /// Store version at which the change happened (0 for `Lagged`).
    pub version: Version,
}

/// Abstract interface for the distributed key-value store.
///
/// All methods take `&self`: implementations are shared between components
/// behind an `Arc` and synchronize internally.
pub trait KeyValueStore: Send + Sync {
    /// Get an entry. A missing key is `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    /// Write a value, returning the new version.
    fn set(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<Version, KvError>;

    /// Unconditional write.
    fn put(&self, key: &str, value: &[u8]) -> Result<Version, KvError> {
        self.set(key, value, &WriteOptions::default())
    }

    /// Delete a key, optionally only at `expected_version`.
    ///
    /// Returns `Ok(false)` if an unconditional delete found nothing.
    fn delete(&self, key: &str, expected_version: Option<Version>) -> Result<bool, KvError>;

    /// Delete `prefix` and everything below it. Returns the number of keys removed.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, KvError>;

    /// All entries at or below `prefix`, ordered by key.
    fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, KvError>;

    /// Watch changes at or below `prefix`.
    ///
    /// Dropping (or closing) the stream releases the watch.
    fn watch(&self, prefix: &str) -> Result<WatchStream, KvError>;
}
