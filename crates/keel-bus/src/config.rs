//! Bus configuration from environment variables.

use std::env;

/// Default number of messages a persistent bus retains.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_240;

/// Default KV prefix for durable bus journals.
pub const DEFAULT_JOURNAL_PREFIX: &str = "keel/bus";

/// Default name of the aggregated severity bus.
pub const DEFAULT_ERRORS_BUS: &str = "bus.errors";

/// Configuration for the bus registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// History capacity used when none is given at creation.
    pub history_capacity: usize,

    /// KV prefix under which durable buses journal their history.
    pub journal_prefix: String,

    /// Name of the fan-in aggregator's output bus.
    pub errors_bus: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            journal_prefix: DEFAULT_JOURNAL_PREFIX.to_string(),
            errors_bus: DEFAULT_ERRORS_BUS.to_string(),
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KEEL_BUS_HISTORY_CAPACITY`: Persistent bus history size (default: 10240)
    /// - `KEEL_BUS_JOURNAL_PREFIX`: Journal key prefix (default: keel/bus)
    /// - `KEEL_ERRORS_BUS`: Aggregated severity bus name (default: bus.errors)
    pub fn from_env() -> Self {
        Self {
            history_capacity: env::var("KEEL_BUS_HISTORY_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_HISTORY_CAPACITY),

            journal_prefix: env::var("KEEL_BUS_JOURNAL_PREFIX")
                .map(|v| v.trim_matches('/').to_string())
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_JOURNAL_PREFIX.to_string()),

            errors_bus: env::var("KEEL_ERRORS_BUS")
                .ok()
                .filter(|v| !v.is_empty() && !v.contains('/'))
                .unwrap_or_else(|| DEFAULT_ERRORS_BUS.to_string()),
        }
    }

    /// Override the default history capacity.
    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}
