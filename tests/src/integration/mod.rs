//! # Integration Flows
//!
//! - [`fan_in`]: severity aggregation across independently created buses
//! - [`durable_bus`]: persistent buses journaled to the KV store
//! - [`mapping`]: object graphs saved and loaded through the KV store
//! - [`kv_map`]: cached maps kept coherent by watches, publishing on a bus
//! - [`concurrency`]: many publishers, churning subscribers

pub mod concurrency;
pub mod durable_bus;
pub mod fan_in;
pub mod mapping;
