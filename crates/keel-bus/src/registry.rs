//! # Bus Registry
//!
//! Creates and names buses. A name resolves to exactly one bus for the
//! lifetime of the registry; asking for it again returns the same instance,
//! asking for it with another payload type is a [`BusError::TypeConflict`].
//!
//! Every bus registers a type-erased source entry on creation. The fan-in
//! aggregator enumerates those entries instead of inspecting components.

use crate::bus::{ExceptionSink, MessageBus};
use crate::config::BusConfig;
use crate::consumer::{named, ConsumerRef};
use crate::error::BusError;
use crate::message::{Message, Severity};
use crate::persistent::PersistentBus;
use crate::subscription::{Subscription, Subscriptions};
use keel_kv::path::validate_segment;
use keel_kv::KeyValueStore;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A bus as handed out by the registry.
pub enum Bus<M: Message> {
    Plain(MessageBus<M>),
    Persistent(PersistentBus<M>),
}

impl<M: Message> Clone for Bus<M> {
    fn clone(&self) -> Self {
        match self {
            Bus::Plain(bus) => Bus::Plain(bus.clone()),
            Bus::Persistent(bus) => Bus::Persistent(bus.clone()),
        }
    }
}

impl<M: Message> Bus<M> {
    #[must_use]
    pub fn id(&self) -> &str {
        self.as_message_bus().id()
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self, Bus::Persistent(_))
    }

    /// Publish `message`, recording it in history for persistent buses.
    pub fn accept(&self, message: M) {
        match self {
            Bus::Plain(bus) => bus.accept(message),
            Bus::Persistent(bus) => bus.accept(message),
        }
    }

    pub fn subscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.as_message_bus().subscribe(consumer)
    }

    pub fn unsubscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.as_message_bus().unsubscribe(consumer)
    }

    pub fn open_subscription(&self, consumer: ConsumerRef<M>) -> Subscription {
        self.as_message_bus().open_subscription(consumer)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.as_message_bus().subscriber_count()
    }

    /// Retained history; empty for plain buses.
    #[must_use]
    pub fn history(&self) -> Vec<M> {
        match self {
            Bus::Plain(_) => Vec::new(),
            Bus::Persistent(bus) => bus.history(),
        }
    }

    #[must_use]
    pub fn as_persistent(&self) -> Option<&PersistentBus<M>> {
        match self {
            Bus::Plain(_) => None,
            Bus::Persistent(bus) => Some(bus),
        }
    }

    /// Observe-only view of this bus.
    #[must_use]
    pub fn as_subscriptions(&self) -> Subscriptions<M> {
        Subscriptions::new(self.clone())
    }

    /// Callback that publishes a clone of its argument on this bus.
    ///
    /// Fits wherever a plain listener is expected, such as
    /// [`KvMap::set_listener`](keel_kv::KvMap::set_listener).
    #[must_use]
    pub fn publisher(&self) -> Arc<dyn Fn(&M) + Send + Sync> {
        let bus = self.clone();
        Arc::new(move |message: &M| bus.accept(message.clone()))
    }

    pub fn close(&self) -> usize {
        self.as_message_bus().close()
    }

    pub(crate) fn as_message_bus(&self) -> &MessageBus<M> {
        match self {
            Bus::Plain(bus) => bus,
            Bus::Persistent(bus) => bus.message_bus(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Bus::Plain(_) => "plain",
            Bus::Persistent(_) => "persistent",
        }
    }
}

impl<M: Message> fmt::Debug for Bus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bus::Plain(bus) => bus.fmt(f),
            Bus::Persistent(bus) => bus.fmt(f),
        }
    }
}

/// A message seen through a type-erased source.
pub(crate) trait SourceMessage {
    fn severity(&self) -> Option<Severity>;
    fn payload(&self) -> serde_json::Value;
}

impl<M: Message> SourceMessage for M {
    fn severity(&self) -> Option<Severity> {
        Message::severity(self)
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub(crate) type ErasedConsumer =
    Arc<dyn Fn(&dyn SourceMessage) -> anyhow::Result<()> + Send + Sync>;

/// A registered bus, independent of its payload type.
pub(crate) trait ErasedSource: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn open_erased(&self, label: String, consumer: ErasedConsumer) -> Subscription;
    fn close(&self) -> usize;
}

impl<M: Message> ErasedSource for Bus<M> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn open_erased(&self, label: String, consumer: ErasedConsumer) -> Subscription {
        self.open_subscription(named(label, move |message: &M| {
            consumer(message as &dyn SourceMessage)
        }))
    }

    fn close(&self) -> usize {
        Bus::close(self)
    }
}

/// Description of a registered bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: String,
    pub type_name: &'static str,
    pub persistent: bool,
}

struct RegisteredBus {
    type_id: TypeId,
    type_name: &'static str,
    persistent: bool,
    handle: Box<dyn Any + Send + Sync>,
    source: Arc<dyn ErasedSource>,
}

/// Creates, names and tracks buses.
///
/// One registry is created at startup and passed to the components that
/// publish or subscribe.
pub struct BusRegistry {
    config: BusConfig,
    default_sink: ExceptionSink,
    store: Option<Arc<dyn KeyValueStore>>,
    buses: Mutex<BTreeMap<String, RegisteredBus>>,
}

impl BusRegistry {
    /// Registry whose buses report failures through [`ExceptionSink::logging`].
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            default_sink: ExceptionSink::logging(),
            store: None,
            buses: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sink used for buses created without one.
    #[must_use]
    pub fn with_default_sink(mut self, sink: ExceptionSink) -> Self {
        self.default_sink = sink;
        self
    }

    /// Store backing durable buses.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.store.as_ref()
    }

    /// Get or create the bus called `name`.
    ///
    /// With `capacity` the bus is persistent; an existing plain bus then
    /// yields [`BusError::KindConflict`]. Without it, an existing bus of
    /// either kind is returned. `sink` only applies when the bus is created.
    pub fn create<M: Message>(
        &self,
        name: &str,
        sink: Option<ExceptionSink>,
        capacity: Option<usize>,
    ) -> Result<Bus<M>, BusError> {
        let sink = sink.unwrap_or_else(|| self.default_sink.clone());
        match capacity {
            None => self.get_or_create(name, false, || Ok(Bus::Plain(MessageBus::new(name, sink)))),
            Some(capacity) => {
                check_capacity(name, capacity)?;
                self.get_or_create(name, true, || {
                    Ok(Bus::Persistent(PersistentBus::new(name, sink, capacity)))
                })
            }
        }
    }

    /// Get or create a plain bus.
    pub fn create_bus<M: Message>(&self, name: &str) -> Result<MessageBus<M>, BusError> {
        match self.create::<M>(name, None, None)? {
            Bus::Plain(bus) => Ok(bus),
            Bus::Persistent(_) => Err(BusError::KindConflict {
                name: name.to_string(),
                existing: "persistent",
            }),
        }
    }

    /// Get or create an in-memory persistent bus. `None` uses the configured
    /// history capacity.
    pub fn create_persistent<M: Message>(
        &self,
        name: &str,
        capacity: Option<usize>,
    ) -> Result<PersistentBus<M>, BusError> {
        let capacity = capacity.unwrap_or(self.config.history_capacity);
        let bus = self.create::<M>(name, None, Some(capacity))?;
        expect_persistent(name, bus)
    }

    /// Get or create a persistent bus journaled to the registry's store.
    pub fn create_durable<M: Message + DeserializeOwned>(
        &self,
        name: &str,
        capacity: Option<usize>,
    ) -> Result<PersistentBus<M>, BusError> {
        let Some(store) = self.store.clone() else {
            return Err(BusError::StoreMissing {
                name: name.to_string(),
            });
        };
        let capacity = capacity.unwrap_or(self.config.history_capacity);
        check_capacity(name, capacity)?;
        let sink = self.default_sink.clone();
        let prefix = self.config.journal_prefix.clone();
        let bus = self.get_or_create(name, true, || {
            PersistentBus::durable(name, sink, capacity, store, &prefix)
                .map(Bus::Persistent)
                .map_err(|source| BusError::Journal {
                    name: name.to_string(),
                    source,
                })
        })?;
        expect_persistent(name, bus)
    }

    /// The bus called `name`, if it exists with payload type `M`.
    #[must_use]
    pub fn get<M: Message>(&self, name: &str) -> Option<Bus<M>> {
        let buses = self.buses.lock();
        let entry = buses.get(name)?;
        if entry.type_id != TypeId::of::<M>() {
            return None;
        }
        entry.handle.downcast_ref::<Bus<M>>().cloned()
    }

    /// Observe-only view of the bus called `name`.
    #[must_use]
    pub fn subscriptions<M: Message>(&self, name: &str) -> Option<Subscriptions<M>> {
        self.get::<M>(name).map(|bus| bus.as_subscriptions())
    }

    /// Registered bus names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.buses.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.buses.lock().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buses.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered bus.
    #[must_use]
    pub fn sources(&self) -> Vec<SourceInfo> {
        self.buses
            .lock()
            .iter()
            .map(|(name, entry)| SourceInfo {
                name: name.clone(),
                type_name: entry.type_name,
                persistent: entry.persistent,
            })
            .collect()
    }

    /// Drop every registration on every bus and forget all buses.
    ///
    /// Returns the number of registrations removed.
    pub fn close(&self) -> usize {
        let buses = std::mem::take(&mut *self.buses.lock());
        let removed: usize = buses.values().map(|entry| entry.source.close()).sum();
        debug!(buses = buses.len(), removed, "Bus registry closed");
        removed
    }

    pub(crate) fn erased_sources(&self) -> Vec<(String, Arc<dyn ErasedSource>)> {
        self.buses
            .lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.source.clone()))
            .collect()
    }

    fn get_or_create<M, F>(
        &self,
        name: &str,
        requires_history: bool,
        build: F,
    ) -> Result<Bus<M>, BusError>
    where
        M: Message,
        F: FnOnce() -> Result<Bus<M>, BusError>,
    {
        validate_segment(name).map_err(|_| BusError::InvalidName {
            name: name.to_string(),
        })?;

        let mut buses = self.buses.lock();
        if let Some(entry) = buses.get(name) {
            let existing = (entry.type_id == TypeId::of::<M>())
                .then(|| entry.handle.downcast_ref::<Bus<M>>())
                .flatten();
            let Some(bus) = existing else {
                return Err(BusError::TypeConflict {
                    name: name.to_string(),
                    existing: entry.type_name,
                    requested: std::any::type_name::<M>(),
                });
            };
            if requires_history && !bus.is_persistent() {
                return Err(BusError::KindConflict {
                    name: name.to_string(),
                    existing: bus.kind(),
                });
            }
            return Ok(bus.clone());
        }

        let bus = build()?;
        debug!(
            bus = name,
            kind = bus.kind(),
            payload = std::any::type_name::<M>(),
            "Bus created"
        );
        buses.insert(
            name.to_string(),
            RegisteredBus {
                type_id: TypeId::of::<M>(),
                type_name: std::any::type_name::<M>(),
                persistent: bus.is_persistent(),
                handle: Box::new(bus.clone()),
                source: Arc::new(bus.clone()),
            },
        );
        Ok(bus)
    }
}

impl Default for BusRegistry {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl fmt::Debug for BusRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusRegistry")
            .field("buses", &self.names())
            .field("durable", &self.store.is_some())
            .finish()
    }
}

fn check_capacity(name: &str, capacity: usize) -> Result<(), BusError> {
    if capacity == 0 {
        return Err(BusError::InvalidCapacity {
            name: name.to_string(),
            capacity,
        });
    }
    Ok(())
}

fn expect_persistent<M: Message>(name: &str, bus: Bus<M>) -> Result<PersistentBus<M>, BusError> {
    match bus {
        Bus::Persistent(bus) => Ok(bus),
        Bus::Plain(_) => Err(BusError::KindConflict {
            name: name.to_string(),
            existing: "plain",
        }),
    }
}
