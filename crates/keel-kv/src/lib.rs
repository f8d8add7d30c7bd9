//! # Keel KV
//!
//! Key-value store contract and typed object mapping for the Keel cluster
//! manager.
//!
//! ## Components
//!
//! - [`KeyValueStore`]: etcd-like store contract (versioned writes, TTL,
//!   prefix listing, prefix watches)
//! - [`InMemoryKvStore`]: in-process implementation used in tests and
//!   single-node runs
//! - [`ObjectMapper`]: saves and loads [`KvMapped`] object graphs as KV
//!   subtrees
//! - [`KvMap`]: cached map of named objects kept coherent by a watch reader
//!
//! ## Error Model
//!
//! A missing key or object is `Ok(None)`. Store failures are [`KvError`];
//! only [`KvError::Unavailable`] is retryable. Lost compare-and-swap races
//! are surfaced to the caller and never retried internally.

pub mod config;
pub mod error;
pub mod kv_map;
pub mod mapping;
pub mod memory;
pub mod path;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod watch;

pub use config::KvConfig;
pub use error::KvError;
pub use kv_map::{KvMap, KvMapAction, KvMapEvent, KvMapListener};
pub use mapping::{FieldInfo, FieldKind, KvMapped, MapperError, ObjectMapper, Schema, SchemaBuilder};
pub use memory::InMemoryKvStore;
pub use store::{ChangeKind, KeyValueStore, KvEntry, Version, WatchEvent, WriteOptions};
pub use watch::{spawn_watch, WatchSender, WatchStream, WatchTask};
