//! # Persistent Bus
//!
//! A [`MessageBus`] that also keeps the most recent `capacity` messages.
//! A message joins the history once its dispatch has finished. Eviction is
//! by count, oldest first.
//!
//! A persistent bus may be durable: every accepted message is journaled as
//! JSON under `{journal_prefix}/{bus}/{seq:020}` and evicted messages are
//! deleted, so a bus re-created over the same store starts with the retained
//! history. Journal writes are best effort; failures are logged and never
//! reach the publisher.

use crate::bus::{ExceptionSink, MessageBus};
use crate::consumer::ConsumerRef;
use crate::message::Message;
use crate::registry::Bus;
use crate::subscription::{Subscription, Subscriptions};
use keel_kv::path::{child_name, join};
use keel_kv::{KeyValueStore, KvError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

struct HistoryState<M> {
    /// Dispatched messages, ordered by sequence number.
    entries: VecDeque<(u64, M)>,
    /// Accepted messages whose dispatch has not finished yet.
    in_flight: BTreeMap<u64, M>,
    next_seq: u64,
}

impl<M: Clone> HistoryState<M> {
    fn with_entries(entries: VecDeque<(u64, M)>, next_seq: u64) -> Self {
        Self {
            entries,
            in_flight: BTreeMap::new(),
            next_seq,
        }
    }

    fn tail(&self, count: usize) -> Vec<M> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries
            .iter()
            .skip(skip)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Like [`tail`](Self::tail), counting in-flight messages as well. A
    /// consumer registered now misses those, so replay has to cover them.
    fn replay_tail(&self, count: usize) -> Vec<M> {
        let mut merged: Vec<(u64, &M)> = self
            .entries
            .iter()
            .map(|(seq, m)| (*seq, m))
            .chain(self.in_flight.iter().map(|(seq, m)| (*seq, m)))
            .collect();
        merged.sort_by_key(|(seq, _)| *seq);
        let skip = merged.len().saturating_sub(count);
        merged
            .into_iter()
            .skip(skip)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

struct Journal {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl Journal {
    fn key(&self, seq: u64) -> String {
        join(&[self.prefix.as_str(), &format!("{seq:020}")])
    }

    fn append<M: Message>(&self, seq: u64, message: &M) {
        let key = self.key(seq);
        let bytes = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Cannot encode message for journal");
                return;
            }
        };
        if let Err(e) = self.store.put(&key, &bytes) {
            warn!(key = %key, error = %e, "Journal append failed");
        }
    }

    fn evict(&self, seq: u64) {
        let key = self.key(seq);
        if let Err(e) = self.store.delete(&key, None) {
            warn!(key = %key, error = %e, "Journal eviction failed");
        }
    }

    /// Journaled messages, oldest first, trimmed to `capacity`.
    fn restore<M: Message + DeserializeOwned>(
        &self,
        capacity: usize,
    ) -> Result<Vec<(u64, M)>, KvError> {
        let mut restored = Vec::new();
        for entry in self.store.list(&self.prefix)? {
            let Some(name) = child_name(&self.prefix, &entry.key) else {
                continue;
            };
            let Ok(seq) = name.parse::<u64>() else {
                continue;
            };
            match serde_json::from_slice::<M>(&entry.value) {
                Ok(message) => restored.push((seq, message)),
                Err(e) => warn!(key = %entry.key, error = %e, "Skipping undecodable journal entry"),
            }
        }
        restored.sort_by_key(|(seq, _)| *seq);

        let excess = restored.len().saturating_sub(capacity);
        for (seq, _) in restored.drain(..excess) {
            self.evict(seq);
        }
        Ok(restored)
    }
}

/// Message bus with bounded replay history.
pub struct PersistentBus<M: Message> {
    bus: MessageBus<M>,
    state: Arc<Mutex<HistoryState<M>>>,
    capacity: usize,
    journal: Option<Arc<Journal>>,
}

impl<M: Message> Clone for PersistentBus<M> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            state: self.state.clone(),
            capacity: self.capacity,
            journal: self.journal.clone(),
        }
    }
}

impl<M: Message> PersistentBus<M> {
    /// In-memory bus retaining the last `capacity` messages (at least one).
    pub fn new(id: impl Into<String>, sink: ExceptionSink, capacity: usize) -> Self {
        Self::from_bus(MessageBus::new(id, sink), capacity)
    }

    pub(crate) fn from_bus(bus: MessageBus<M>, capacity: usize) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(HistoryState::with_entries(VecDeque::new(), 0))),
            capacity: capacity.max(1),
            journal: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.bus.id()
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.bus.type_name()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether history is journaled to a store.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Number of retained messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained messages, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<M> {
        let state = self.state.lock();
        state.tail(state.entries.len())
    }

    /// The `count` most recent retained messages, oldest first.
    #[must_use]
    pub fn history_tail(&self, count: usize) -> Vec<M> {
        self.state.lock().tail(count)
    }

    /// Deliver to every subscriber, then append to history.
    pub fn accept(&self, message: M) {
        let (seq, snapshot) = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.in_flight.insert(seq, message.clone());
            // Taken under the history lock so a concurrent replay sees each
            // message either in its replay or live, never both.
            (seq, self.bus.core().snapshot())
        };
        self.bus.core().dispatch(&message, &snapshot);
        self.commit(seq);
    }

    /// Move a dispatched message into history, keeping sequence order.
    fn commit(&self, seq: u64) {
        let mut state = self.state.lock();
        let Some(message) = state.in_flight.remove(&seq) else {
            return;
        };
        let position = state
            .entries
            .iter()
            .rposition(|(retained, _)| *retained < seq)
            .map_or(0, |p| p + 1);
        if position == 0 && state.entries.len() >= self.capacity {
            // Older than everything retained and no room left.
            return;
        }
        if let Some(journal) = &self.journal {
            journal.append(seq, &message);
        }
        state.entries.insert(position, (seq, message));
        while state.entries.len() > self.capacity {
            if let Some((evicted, _)) = state.entries.pop_front() {
                if let Some(journal) = &self.journal {
                    journal.evict(evicted);
                }
            }
        }
    }

    pub fn subscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.bus.subscribe(consumer)
    }

    pub fn unsubscribe(&self, consumer: &ConsumerRef<M>) -> bool {
        self.bus.unsubscribe(consumer)
    }

    pub fn open_subscription(&self, consumer: ConsumerRef<M>) -> Subscription {
        self.bus.open_subscription(consumer)
    }

    /// Subscribe directly and replay up to `count` recent messages.
    ///
    /// The replay also covers messages still being dispatched. Nothing is
    /// replayed if `consumer` was already subscribed. Messages accepted
    /// while the replay runs may reach the consumer before the replay
    /// finishes, but none is lost or delivered twice.
    pub fn subscribe_with_history(&self, consumer: &ConsumerRef<M>, count: usize) -> bool {
        let replay = {
            let state = self.state.lock();
            if !self.bus.core().add_direct(consumer) {
                return false;
            }
            state.replay_tail(count)
        };
        self.bus.core().subscribed(consumer);
        self.replay(consumer, &replay);
        true
    }

    /// Open a scoped subscription and replay up to `count` recent messages.
    pub fn open_subscription_with_history(
        &self,
        consumer: ConsumerRef<M>,
        count: usize,
    ) -> Subscription {
        let (id, replay) = {
            let state = self.state.lock();
            let id = self.bus.core().add_scoped(consumer.clone());
            (id, state.replay_tail(count))
        };
        self.bus.core().subscribed(&consumer);
        self.replay(&consumer, &replay);
        Subscription::new(self.id().to_string(), id, self.bus.registrar())
    }

    /// Observe-only view of this bus.
    #[must_use]
    pub fn as_subscriptions(&self) -> Subscriptions<M> {
        Subscriptions::new(Bus::Persistent(self.clone()))
    }

    /// Drop every registration. History is kept.
    pub fn close(&self) -> usize {
        self.bus.close()
    }

    pub(crate) fn message_bus(&self) -> &MessageBus<M> {
        &self.bus
    }

    fn replay(&self, consumer: &ConsumerRef<M>, messages: &[M]) {
        if messages.is_empty() {
            return;
        }
        debug!(
            bus = %self.id(),
            consumer = consumer.label(),
            count = messages.len(),
            "Replaying history"
        );
        for message in messages {
            self.bus.core().deliver(consumer, message);
        }
    }
}

impl<M: Message + DeserializeOwned> PersistentBus<M> {
    /// Durable bus journaling to `store` under `{journal_prefix}/{id}`.
    ///
    /// Previously journaled messages are restored, up to `capacity`.
    pub fn durable(
        id: impl Into<String>,
        sink: ExceptionSink,
        capacity: usize,
        store: Arc<dyn KeyValueStore>,
        journal_prefix: &str,
    ) -> Result<Self, KvError> {
        let id = id.into();
        let capacity = capacity.max(1);
        let journal = Journal {
            store,
            prefix: join(&[journal_prefix, id.as_str()]),
        };
        let restored: Vec<(u64, M)> = journal.restore(capacity)?;
        let next_seq = restored.last().map_or(0, |(seq, _)| seq + 1);
        debug!(bus = %id, restored = restored.len(), "Journal restored");

        let mut bus = Self::new(id, sink, capacity);
        bus.state = Arc::new(Mutex::new(HistoryState::with_entries(
            restored.into_iter().collect(),
            next_seq,
        )));
        bus.journal = Some(Arc::new(journal));
        Ok(bus)
    }
}

impl<M: Message> fmt::Debug for PersistentBus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentBus")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .field("capacity", &self.capacity)
            .field("retained", &self.len())
            .field("durable", &self.is_durable())
            .finish()
    }
}
