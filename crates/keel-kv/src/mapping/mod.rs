//! # Object Mapping
//!
//! Declarative mapping between typed object graphs and KV subtrees.
//!
//! - [`schema`]: per-type field tables ([`Schema`], [`KvMapped`])
//! - [`mapper`]: [`ObjectMapper`], typed save/load against a store
//! - [`error`]: [`MapperError`]

pub mod error;
pub mod mapper;
pub mod schema;

pub use error::MapperError;
pub use mapper::ObjectMapper;
pub use schema::{
    index_segment, FieldInfo, FieldKind, KvMapped, Schema, SchemaBuilder, Subtree, TYPE_MARKER,
};
