//! # Keel Bus
//!
//! Typed in-process publish/subscribe for the Keel cluster manager.
//!
//! ## Components
//!
//! - [`MessageBus`]: synchronous typed channel with failure isolation
//! - [`ConditionalSubscriptions`]: subscriptions filtered by a message key
//! - [`PersistentBus`]: message bus with bounded, optionally durable history
//! - [`BusRegistry`]: one bus per name, type-checked
//! - [`FanInAggregator`]: republishes WARNING/ERROR messages from every
//!   registered bus onto `bus.errors`
//!
//! ## Delivery Guarantees
//!
//! - `accept` runs every subscriber on the caller's thread, in subscription
//!   order, against the subscriber list as it was when `accept` was called
//! - A failing or panicking subscriber is reported to the bus's
//!   [`ExceptionSink`] and stays subscribed
//! - Messages from one publisher reach each subscriber in publish order;
//!   ordering across publishers is not defined
//!
//! ## Example
//!
//! ```
//! use keel_bus::{consumer, BusRegistry, ConsumerRef};
//!
//! let registry = BusRegistry::default();
//! let bus = registry.create_bus::<String>("images").unwrap();
//! let log: ConsumerRef<String> = consumer(|m: &String| {
//!     println!("image event: {m}");
//!     Ok(())
//! });
//! bus.subscribe(&log);
//! bus.accept("pulled nginx:1.27".to_string());
//! ```

pub mod aggregator;
pub mod bus;
pub mod conditional;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod persistent;
pub mod registry;
pub mod subscription;

pub use aggregator::{FanInAggregator, SeverityEvent};
pub use bus::{
    ExceptionInfo, ExceptionSink, MessageBus, MessageBusBuilder, SubscribeListener,
    SubscriberFailure,
};
pub use conditional::{ConditionalSubscriptions, KeyExtractor, KeyPredicate};
pub use config::BusConfig;
pub use consumer::{consumer, named, same_consumer, Consumer, ConsumerRef};
pub use error::BusError;
pub use message::{parse_severity, Message, Severity, UnknownSeverity, WithSeverity};
pub use persistent::PersistentBus;
pub use registry::{Bus, BusRegistry, SourceInfo};
pub use subscription::{Subscription, Subscriptions};
