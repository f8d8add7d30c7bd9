//! # Key-Filtered Subscriptions
//!
//! [`ConditionalSubscriptions`] wraps the observe-only surface of a bus with
//! a key extractor and a predicate. `subscribe_on_key` registers a consumer
//! that only sees messages whose extracted key matches the subscription key.
//!
//! ```
//! use keel_bus::{consumer, ConditionalSubscriptions, ExceptionSink, MessageBus};
//!
//! let bus = MessageBus::<String>::new("nodes", ExceptionSink::logging());
//! let by_host = ConditionalSubscriptions::on_equal_keys(bus.as_subscriptions(), |m: &String| {
//!     m.split(':').next().unwrap_or_default().to_string()
//! });
//! let _web = by_host.subscribe_on_key(
//!     "web-1".to_string(),
//!     consumer(|m: &String| {
//!         println!("web-1 event: {m}");
//!         Ok(())
//!     }),
//! );
//! bus.accept("web-1:up".to_string());
//! bus.accept("db-1:down".to_string());
//! ```

use crate::consumer::{named, ConsumerRef};
use crate::message::Message;
use crate::subscription::{Subscription, Subscriptions};
use std::fmt;
use std::sync::Arc;

/// Derives the routing key of a message.
pub type KeyExtractor<M, K> = Arc<dyn Fn(&M) -> K + Send + Sync>;

/// Decides delivery from the subscription key and the message key, in that
/// order.
pub type KeyPredicate<K> = Arc<dyn Fn(&K, &K) -> bool + Send + Sync>;

/// Observe-only bus view with key-filtered subscriptions.
pub struct ConditionalSubscriptions<M: Message, K> {
    subscriptions: Subscriptions<M>,
    extractor: KeyExtractor<M, K>,
    predicate: KeyPredicate<K>,
}

impl<M: Message, K> Clone for ConditionalSubscriptions<M, K> {
    fn clone(&self) -> Self {
        Self {
            subscriptions: self.subscriptions.clone(),
            extractor: self.extractor.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<M: Message, K: Send + Sync + 'static> ConditionalSubscriptions<M, K> {
    pub fn new<E, P>(subscriptions: Subscriptions<M>, extractor: E, predicate: P) -> Self
    where
        E: Fn(&M) -> K + Send + Sync + 'static,
        P: Fn(&K, &K) -> bool + Send + Sync + 'static,
    {
        Self {
            subscriptions,
            extractor: Arc::new(extractor),
            predicate: Arc::new(predicate),
        }
    }

    /// Deliver messages whose key matches `key`, for as long as the returned
    /// handle lives. Failures are reported under the consumer's label.
    pub fn subscribe_on_key(&self, key: K, consumer: ConsumerRef<M>) -> Subscription {
        let extractor = self.extractor.clone();
        let predicate = self.predicate.clone();
        let label = consumer.label().to_string();
        let filtered = named(label, move |message: &M| {
            if predicate(&key, &extractor(message)) {
                consumer.accept(message)
            } else {
                Ok(())
            }
        });
        self.subscriptions.open_subscription(filtered)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.subscriptions.id()
    }

    /// Unfiltered direct subscription.
    pub fn subscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.subscriptions.subscribe(consumer)
    }

    pub fn unsubscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.subscriptions.unsubscribe(consumer)
    }

    /// Unfiltered scoped subscription.
    pub fn open_subscription(&self, consumer: ConsumerRef<M>) -> Subscription {
        self.subscriptions.open_subscription(consumer)
    }

    #[must_use]
    pub fn history(&self) -> Vec<M> {
        self.subscriptions.history()
    }

    /// The unfiltered view.
    #[must_use]
    pub fn subscriptions(&self) -> &Subscriptions<M> {
        &self.subscriptions
    }
}

impl<M: Message, K: PartialEq + Send + Sync + 'static> ConditionalSubscriptions<M, K> {
    /// Deliver when the message key equals the subscription key.
    pub fn on_equal_keys<E>(subscriptions: Subscriptions<M>, extractor: E) -> Self
    where
        E: Fn(&M) -> K + Send + Sync + 'static,
    {
        Self::new(subscriptions, extractor, |a: &K, b: &K| a == b)
    }
}

impl<M: Message, K> fmt::Debug for ConditionalSubscriptions<M, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalSubscriptions")
            .field("id", &self.subscriptions.id())
            .finish()
    }
}
