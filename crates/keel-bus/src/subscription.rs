//! # Subscriptions
//!
//! [`Subscription`] is the scoped handle returned by `open_subscription`:
//! closing or dropping it removes exactly that registration, once.
//! [`Subscriptions`] is the observe-only surface of a bus, handed to
//! components that may listen but must not publish.

use crate::bus::MessageBus;
use crate::consumer::ConsumerRef;
use crate::message::Message;
use crate::registry::Bus;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

/// Removes registrations by id on behalf of a [`Subscription`].
pub(crate) trait Registrar: Send + Sync {
    fn release(&self, id: u64) -> bool;
}

/// Scoped registration on a bus.
///
/// Not deduplicated: every `open_subscription` call yields an independent
/// registration, even for a consumer that is already subscribed.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus_id: String,
    id: u64,
    registrar: Weak<dyn Registrar>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(bus_id: String, id: u64, registrar: Weak<dyn Registrar>) -> Self {
        Self {
            bus_id,
            id,
            registrar,
            active: AtomicBool::new(true),
        }
    }

    /// Id of the bus this subscription belongs to.
    #[must_use]
    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the registration. Only the first call has an effect.
    ///
    /// Returns `true` if this call removed the registration from a live bus.
    pub fn close(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.registrar.upgrade() {
            Some(registrar) => registrar.release(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("bus_id", &self.bus_id)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Observe-only view of a bus: no `accept`.
pub struct Subscriptions<M: Message> {
    bus: Bus<M>,
}

impl<M: Message> Clone for Subscriptions<M> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
        }
    }
}

impl<M: Message> Subscriptions<M> {
    pub(crate) fn new(bus: Bus<M>) -> Self {
        Self { bus }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.plain().id()
    }

    /// Whether the underlying bus keeps history.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self.bus, Bus::Persistent(_))
    }

    pub fn subscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.plain().subscribe(consumer)
    }

    pub fn unsubscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.plain().unsubscribe(consumer)
    }

    pub fn open_subscription(&self, consumer: ConsumerRef<M>) -> Subscription {
        self.plain().open_subscription(consumer)
    }

    /// Retained history, oldest first. Empty for buses without history.
    #[must_use]
    pub fn history(&self) -> Vec<M> {
        match &self.bus {
            Bus::Plain(_) => Vec::new(),
            Bus::Persistent(bus) => bus.history(),
        }
    }

    /// Subscribe and replay up to `count` retained messages first.
    pub fn subscribe_with_history(&self, consumer: &ConsumerRef<M>, count: usize) -> bool {
        match &self.bus {
            Bus::Plain(bus) => bus.subscribe(consumer),
            Bus::Persistent(bus) => bus.subscribe_with_history(consumer, count),
        }
    }

    /// Open a scoped subscription and replay up to `count` retained messages first.
    pub fn open_subscription_with_history(
        &self,
        consumer: ConsumerRef<M>,
        count: usize,
    ) -> Subscription {
        match &self.bus {
            Bus::Plain(bus) => bus.open_subscription(consumer),
            Bus::Persistent(bus) => bus.open_subscription_with_history(consumer, count),
        }
    }

    fn plain(&self) -> &MessageBus<M> {
        self.bus.as_message_bus()
    }
}

impl<M: Message> fmt::Debug for Subscriptions<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriptions")
            .field("id", &self.id())
            .field("persistent", &self.is_persistent())
            .finish()
    }
}
