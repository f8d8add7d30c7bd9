//! KV configuration from environment variables.

use std::env;

/// Default root prefix for mapped objects.
pub const DEFAULT_PREFIX: &str = "keel";

/// Default per-watch event buffer.
pub const DEFAULT_WATCH_BUFFER: usize = 1024;

/// Configuration for the KV layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvConfig {
    /// Root prefix under which mapped objects live.
    pub prefix: String,

    /// Capacity of each watch channel before events are dropped as lagged.
    pub watch_buffer: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

impl KvConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KEEL_KV_PREFIX`: Root prefix (default: keel)
    /// - `KEEL_KV_WATCH_BUFFER`: Watch channel capacity (default: 1024)
    pub fn from_env() -> Self {
        Self {
            prefix: env::var("KEEL_KV_PREFIX")
                .map(|v| v.trim_matches('/').to_string())
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),

            watch_buffer: env::var("KEEL_KV_WATCH_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_WATCH_BUFFER),
        }
    }

    /// Prefix for objects of one kind, e.g. `keel/pipelines`.
    pub fn namespace(&self, kind: &str) -> String {
        crate::path::join(&[self.prefix.as_str(), kind])
    }
}
