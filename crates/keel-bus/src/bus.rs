//! # Message Bus
//!
//! In-process typed pub/sub channel. `accept` dispatches synchronously on the
//! caller's thread to a snapshot of the subscriber list taken at call time,
//! in subscription order.
//!
//! ## Failure Isolation
//!
//! Each delivery runs under `catch_unwind`. A consumer that returns `Err` or
//! panics is reported to the bus's [`ExceptionSink`] and stays subscribed;
//! the remaining consumers still receive the message and nothing reaches the
//! publisher.
//!
//! ## Registration Kinds
//!
//! | Call                | Deduplicated            | Removed by             |
//! |---------------------|-------------------------|------------------------|
//! | `subscribe`         | yes, by consumer `Arc`  | `unsubscribe`          |
//! | `open_subscription` | no                      | `Subscription::close`  |
//!
//! Both kinds fire the optional subscribe/unsubscribe listeners set through
//! [`MessageBusBuilder`], after the subscriber list has been updated.

use crate::consumer::{same_consumer, ConsumerRef};
use crate::message::Message;
use crate::registry::Bus;
use crate::subscription::{Registrar, Subscription, Subscriptions};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Why a delivery failed.
#[derive(Debug, Clone)]
pub enum SubscriberFailure {
    /// The consumer returned an error.
    Error(Arc<anyhow::Error>),
    /// The consumer panicked; the payload rendered as text.
    Panic(String),
}

impl fmt::Display for SubscriberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberFailure::Error(e) => write!(f, "{e:#}"),
            SubscriberFailure::Panic(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Report of one failed delivery.
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub bus_id: String,
    /// Label of the failing consumer.
    pub consumer: String,
    /// The offending message, as JSON.
    pub message: serde_json::Value,
    pub failure: SubscriberFailure,
}

/// Receiver of [`ExceptionInfo`]s, fixed when a bus is created.
#[derive(Clone)]
pub struct ExceptionSink(Arc<dyn Fn(&ExceptionInfo) + Send + Sync>);

impl ExceptionSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ExceptionInfo) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Log every failure at ERROR level.
    #[must_use]
    pub fn logging() -> Self {
        Self::new(|info| {
            error!(
                bus = %info.bus_id,
                consumer = %info.consumer,
                message = %info.message,
                failure = %info.failure,
                "Subscriber failed"
            );
        })
    }

    /// Deliver a report. A panicking sink is logged and swallowed.
    pub fn report(&self, info: &ExceptionInfo) {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.0)(info)));
        if outcome.is_err() {
            error!(bus = %info.bus_id, consumer = %info.consumer, "Exception sink panicked");
        }
    }
}

impl Default for ExceptionSink {
    fn default() -> Self {
        Self::logging()
    }
}

impl fmt::Debug for ExceptionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExceptionSink")
    }
}

/// Called with the bus id and the consumer when a registration is added or
/// removed.
pub type SubscribeListener<M> = Arc<dyn Fn(&str, &ConsumerRef<M>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationKind {
    Direct,
    Scoped,
}

pub(crate) struct Registration<M> {
    id: u64,
    kind: RegistrationKind,
    consumer: ConsumerRef<M>,
}

impl<M> Registration<M> {
    fn is_direct(&self, consumer: &ConsumerRef<M>) -> bool {
        self.kind == RegistrationKind::Direct && same_consumer(&self.consumer, consumer)
    }
}

impl<M> Clone for Registration<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            consumer: self.consumer.clone(),
        }
    }
}

/// Subscriber list snapshot used for one dispatch.
pub(crate) type Snapshot<M> = Arc<Vec<Registration<M>>>;

pub(crate) struct BusCore<M> {
    id: String,
    /// Copy-on-write: dispatch clones the `Arc`, writers replace the `Vec`.
    registrations: RwLock<Snapshot<M>>,
    next_id: AtomicU64,
    sink: ExceptionSink,
    on_subscribe: Option<SubscribeListener<M>>,
    on_unsubscribe: Option<SubscribeListener<M>>,
}

impl<M: Message> BusCore<M> {
    pub(crate) fn snapshot(&self) -> Snapshot<M> {
        self.registrations.read().clone()
    }

    pub(crate) fn dispatch(&self, message: &M, snapshot: &[Registration<M>]) {
        for registration in snapshot {
            self.deliver(&registration.consumer, message);
        }
    }

    pub(crate) fn deliver(&self, consumer: &ConsumerRef<M>, message: &M) {
        let outcome = catch_unwind(AssertUnwindSafe(|| consumer.accept(message)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => SubscriberFailure::Error(Arc::new(e)),
            Err(payload) => SubscriberFailure::Panic(panic_message(payload.as_ref())),
        };
        self.sink.report(&ExceptionInfo {
            bus_id: self.id.clone(),
            consumer: consumer.label().to_string(),
            message: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
            failure,
        });
    }

    fn contains_direct(&self, consumer: &ConsumerRef<M>) -> bool {
        self.registrations
            .read()
            .iter()
            .any(|r| r.is_direct(consumer))
    }

    /// Returns `false` if `consumer` already had a direct registration.
    ///
    /// Listeners are not called; see [`subscribed`](Self::subscribed).
    pub(crate) fn add_direct(&self, consumer: &ConsumerRef<M>) -> bool {
        let mut registrations = self.registrations.write();
        if registrations.iter().any(|r| r.is_direct(consumer)) {
            return false;
        }
        let mut next = Vec::with_capacity(registrations.len() + 1);
        next.extend(registrations.iter().cloned());
        next.push(Registration {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: RegistrationKind::Direct,
            consumer: consumer.clone(),
        });
        *registrations = Arc::new(next);
        debug!(bus = %self.id, consumer = consumer.label(), "Subscribed");
        true
    }

    pub(crate) fn unsubscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        {
            let mut registrations = self.registrations.write();
            let next: Vec<_> = registrations
                .iter()
                .filter(|r| !r.is_direct(consumer))
                .cloned()
                .collect();
            if next.len() == registrations.len() {
                return false;
            }
            *registrations = Arc::new(next);
        }
        debug!(bus = %self.id, consumer = consumer.label(), "Unsubscribed");
        self.unsubscribed(consumer);
        true
    }

    /// Listeners are not called; see [`subscribed`](Self::subscribed).
    pub(crate) fn add_scoped(&self, consumer: ConsumerRef<M>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registrations = self.registrations.write();
        let mut next = Vec::with_capacity(registrations.len() + 1);
        next.extend(registrations.iter().cloned());
        debug!(bus = %self.id, consumer = consumer.label(), id, "Subscription opened");
        next.push(Registration {
            id,
            kind: RegistrationKind::Scoped,
            consumer,
        });
        *registrations = Arc::new(next);
        id
    }

    /// Run the subscribe listener. Callers hold no bus locks.
    pub(crate) fn subscribed(&self, consumer: &ConsumerRef<M>) {
        self.notify(self.on_subscribe.as_ref(), consumer);
    }

    fn unsubscribed(&self, consumer: &ConsumerRef<M>) {
        self.notify(self.on_unsubscribe.as_ref(), consumer);
    }

    fn notify(&self, listener: Option<&SubscribeListener<M>>, consumer: &ConsumerRef<M>) {
        let Some(listener) = listener else {
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| listener(&self.id, consumer)));
        if outcome.is_err() {
            error!(bus = %self.id, consumer = consumer.label(), "Subscribe listener panicked");
        }
    }

    fn len(&self) -> usize {
        self.registrations.read().len()
    }

    fn clear(&self) -> usize {
        let removed = std::mem::take(&mut *self.registrations.write());
        for registration in removed.iter() {
            self.unsubscribed(&registration.consumer);
        }
        removed.len()
    }
}

impl<M: Message> Registrar for BusCore<M> {
    fn release(&self, id: u64) -> bool {
        let removed = {
            let mut registrations = self.registrations.write();
            let Some(position) = registrations
                .iter()
                .position(|r| r.kind == RegistrationKind::Scoped && r.id == id)
            else {
                return false;
            };
            let mut next = registrations.as_ref().clone();
            let removed = next.remove(position);
            *registrations = Arc::new(next);
            removed
        };
        debug!(bus = %self.id, id, "Subscription closed");
        self.unsubscribed(&removed.consumer);
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Typed publish/subscribe channel.
///
/// Cloning yields another handle to the same bus.
pub struct MessageBus<M: Message> {
    core: Arc<BusCore<M>>,
}

impl<M: Message> Clone for MessageBus<M> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<M: Message> MessageBus<M> {
    /// Create a standalone bus. Buses shared between components come from a
    /// [`BusRegistry`](crate::BusRegistry).
    pub fn new(id: impl Into<String>, sink: ExceptionSink) -> Self {
        Self::builder(id).sink(sink).build()
    }

    /// Start configuring a bus with subscribe/unsubscribe listeners.
    pub fn builder(id: impl Into<String>) -> MessageBusBuilder<M> {
        MessageBusBuilder {
            id: id.into(),
            sink: ExceptionSink::default(),
            on_subscribe: None,
            on_unsubscribe: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Name of the payload type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    /// Number of registrations, direct and scoped.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.core.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriber_count() == 0
    }

    /// Deliver `message` to every current subscriber.
    pub fn accept(&self, message: M) {
        let snapshot = self.core.snapshot();
        self.core.dispatch(&message, &snapshot);
    }

    /// Register `consumer` directly. A second call with the same consumer is
    /// a no-op and returns `false`.
    pub fn subscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        if !self.core.add_direct(consumer) {
            return false;
        }
        self.core.subscribed(consumer);
        true
    }

    /// Remove the direct registration of `consumer`. Scoped subscriptions of
    /// the same consumer are unaffected.
    pub fn unsubscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.core.unsubscribe(consumer)
    }

    /// Whether `consumer` has a direct registration.
    #[must_use]
    pub fn is_subscribed(&self, consumer: &ConsumerRef<M>) -> bool {
        self.core.contains_direct(consumer)
    }

    /// Register `consumer` for as long as the returned handle lives.
    pub fn open_subscription(&self, consumer: ConsumerRef<M>) -> Subscription {
        let id = self.core.add_scoped(consumer.clone());
        self.core.subscribed(&consumer);
        Subscription::new(self.core.id.clone(), id, self.registrar())
    }

    /// Observe-only view of this bus.
    #[must_use]
    pub fn as_subscriptions(&self) -> Subscriptions<M> {
        Subscriptions::new(Bus::Plain(self.clone()))
    }

    /// Drop every registration. Outstanding [`Subscription`]s close as no-ops.
    pub fn close(&self) -> usize {
        let removed = self.core.clear();
        debug!(bus = %self.core.id, removed, "Bus closed");
        removed
    }

    pub(crate) fn core(&self) -> &Arc<BusCore<M>> {
        &self.core
    }

    pub(crate) fn registrar(&self) -> Weak<dyn Registrar> {
        let weak: Weak<BusCore<M>> = Arc::downgrade(&self.core);
        weak
    }
}

/// Configures a [`MessageBus`] before it is created.
pub struct MessageBusBuilder<M: Message> {
    id: String,
    sink: ExceptionSink,
    on_subscribe: Option<SubscribeListener<M>>,
    on_unsubscribe: Option<SubscribeListener<M>>,
}

impl<M: Message> MessageBusBuilder<M> {
    /// Receiver of delivery failures. Defaults to [`ExceptionSink::logging`].
    #[must_use]
    pub fn sink(mut self, sink: ExceptionSink) -> Self {
        self.sink = sink;
        self
    }

    /// Called after a consumer is registered, directly or scoped.
    #[must_use]
    pub fn on_subscribe<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str, &ConsumerRef<M>) + Send + Sync + 'static,
    {
        self.on_subscribe = Some(Arc::new(listener));
        self
    }

    /// Called after a registration is removed, including by
    /// [`MessageBus::close`].
    #[must_use]
    pub fn on_unsubscribe<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str, &ConsumerRef<M>) + Send + Sync + 'static,
    {
        self.on_unsubscribe = Some(Arc::new(listener));
        self
    }

    pub fn build(self) -> MessageBus<M> {
        MessageBus {
            core: Arc::new(BusCore {
                id: self.id,
                registrations: RwLock::new(Arc::new(Vec::new())),
                next_id: AtomicU64::new(1),
                sink: self.sink,
                on_subscribe: self.on_subscribe,
                on_unsubscribe: self.on_unsubscribe,
            }),
        }
    }

    /// Build a [`PersistentBus`](crate::PersistentBus) retaining `capacity`
    /// messages.
    pub fn build_persistent(self, capacity: usize) -> crate::PersistentBus<M> {
        crate::PersistentBus::from_bus(self.build(), capacity)
    }
}

impl<M: Message> fmt::Debug for MessageBus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("id", &self.core.id)
            .field("type", &self.type_name())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
