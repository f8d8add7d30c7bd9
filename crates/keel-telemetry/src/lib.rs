//! # Keel Telemetry
//!
//! Installs the process-wide `tracing` subscriber for Keel services.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keel_telemetry::{init_logging, TelemetryConfig};
//!
//! fn main() {
//!     init_logging(&TelemetryConfig::from_env()).expect("Failed to init logging");
//!     tracing::info!("manager started");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `KEEL_SERVICE_NAME` | `keel` | Service name attached to startup logs |
//! | `KEEL_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `KEEL_JSON_LOGS` | `false` (`true` in containers) | JSON formatted output |
//! | `KEEL_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::{build_filter, init_logging};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to install subscriber: {0}")]
    Install(String),
}
