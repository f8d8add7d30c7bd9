//! # Fan-In Aggregator
//!
//! Collects WARNING and ERROR messages from every bus in a registry into one
//! persistent bus (`bus.errors` by default). Sources are enumerated once, at
//! start; buses created later are not watched.
//!
//! ```text
//! nodes ─────┐
//! images ────┼──► severity filter ──► bus.errors (PersistentBus<SeverityEvent>)
//! pipelines ─┘
//! ```

use crate::error::BusError;
use crate::message::{Message, Severity};
use crate::persistent::PersistentBus;
use crate::registry::{BusRegistry, ErasedConsumer, SourceMessage};
use crate::subscription::{Subscription, Subscriptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A forwarded message with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityEvent {
    /// Name of the bus the message was accepted on.
    pub source: String,
    pub severity: Severity,
    /// Payload type of the source bus.
    pub message_type: String,
    /// The original message, as JSON.
    pub payload: serde_json::Value,
}

impl Message for SeverityEvent {
    fn severity(&self) -> Option<Severity> {
        Some(self.severity)
    }
}

/// Subscribes to every registered bus and republishes alerting messages.
pub struct FanInAggregator {
    output: PersistentBus<SeverityEvent>,
    sources: Vec<String>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl FanInAggregator {
    /// Create the output bus and subscribe to every other registered bus.
    ///
    /// The output bus is durable when the registry has a store.
    pub fn start(registry: &BusRegistry) -> Result<Self, BusError> {
        let name = registry.config().errors_bus.clone();
        let output = if registry.store().is_some() {
            registry.create_durable::<SeverityEvent>(&name, None)?
        } else {
            registry.create_persistent::<SeverityEvent>(&name, None)?
        };

        let label = format!("fan-in:{name}");
        let mut sources = Vec::new();
        let mut subscriptions = Vec::new();
        for (source, bus) in registry.erased_sources() {
            if source == name {
                continue;
            }
            let forward = forwarder(output.clone(), source.clone(), bus.type_name());
            subscriptions.push(bus.open_erased(label.clone(), forward));
            sources.push(source);
        }

        info!(bus = %name, sources = sources.len(), "Fan-in aggregator started");
        Ok(Self {
            output,
            sources,
            subscriptions: Mutex::new(subscriptions),
        })
    }

    /// Observe-only view of the aggregated bus.
    #[must_use]
    pub fn subscriptions(&self) -> Subscriptions<SeverityEvent> {
        self.output.as_subscriptions()
    }

    /// Aggregated messages retained so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<SeverityEvent> {
        self.output.history()
    }

    /// Names of the buses subscribed at start.
    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Number of upstream subscriptions still held.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.open_count() == 0
    }

    /// Release every upstream subscription. Later calls do nothing.
    ///
    /// Returns the number of subscriptions released by this call.
    pub fn close(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let released = subscriptions.iter().filter(|s| s.close()).count();
        if !subscriptions.is_empty() {
            debug!(bus = %self.output.id(), released, "Fan-in aggregator closed");
        }
        released
    }
}

impl Drop for FanInAggregator {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FanInAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanInAggregator")
            .field("output", &self.output.id())
            .field("sources", &self.sources)
            .field("open", &self.open_count())
            .finish()
    }
}

fn forwarder(
    output: PersistentBus<SeverityEvent>,
    source: String,
    message_type: &'static str,
) -> ErasedConsumer {
    Arc::new(move |message: &dyn SourceMessage| -> anyhow::Result<()> {
        match message.severity() {
            Some(severity) if severity.is_alerting() => output.accept(SeverityEvent {
                source: source.clone(),
                severity,
                message_type: message_type.to_string(),
                payload: message.payload(),
            }),
            _ => {}
        }
        Ok(())
    })
}
