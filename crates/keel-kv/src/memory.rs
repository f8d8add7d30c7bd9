//! # In-Memory Store
//!
//! [`KeyValueStore`] implementation for tests and single-node runs. Keeps the
//! etcd-like semantics the rest of the crate depends on: a global revision
//! counter, per-key versions, compare-and-swap, TTL expiry and prefix watches.

use crate::config::KvConfig;
use crate::error::KvError;
use crate::path::{is_under, validate_key};
use crate::store::{ChangeKind, KeyValueStore, KvEntry, Version, WatchEvent, WriteOptions};
use crate::watch::{WatchSender, WatchStream};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

struct Slot {
    value: Vec<u8>,
    version: Version,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }

    fn to_entry(&self, key: &str) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: self.value.clone(),
            version: self.version,
            ttl: self.ttl,
        }
    }
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Slot>,
    revision: Version,
}

struct Watcher {
    id: u64,
    prefix: String,
    sender: WatchSender,
}

struct Inner {
    state: RwLock<State>,
    watchers: Mutex<Vec<Watcher>>,
    next_watcher: AtomicU64,
    available: AtomicBool,
    watch_buffer: usize,
}

impl Inner {
    fn notify(&self, key: &str, kind: ChangeKind, value: Option<&[u8]>, version: Version) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|watcher| {
            if !is_under(&watcher.prefix, key) {
                return !watcher.sender.is_closed();
            }
            watcher.sender.offer(WatchEvent {
                key: key.to_string(),
                kind,
                value: value.map(<[u8]>::to_vec),
                version,
            })
        });
    }

    /// Drop expired entries, emitting `Expired` events.
    fn purge_expired(&self, state: &mut State, now: Instant) -> usize {
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, slot)| !slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.remove(key);
            state.revision += 1;
            self.notify(key, ChangeKind::Expired, None, state.revision);
        }
        expired.len()
    }

    fn unregister(&self, id: u64) {
        self.watchers.lock().retain(|watcher| watcher.id != id);
        debug!(watcher = id, "Watch released");
    }
}

/// In-memory key-value store.
///
/// Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct InMemoryKvStore {
    inner: Arc<Inner>,
}

impl InMemoryKvStore {
    /// Create an empty store with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&KvConfig::default())
    }

    /// Create an empty store using `config.watch_buffer` for watch channels.
    #[must_use]
    pub fn with_config(config: &KvConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                watchers: Mutex::new(Vec::new()),
                next_watcher: AtomicU64::new(1),
                available: AtomicBool::new(true),
                watch_buffer: config.watch_buffer,
            }),
        }
    }

    /// Simulate a partition: while unavailable every operation fails with
    /// [`KvError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .read()
            .entries
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current store revision.
    #[must_use]
    pub fn revision(&self) -> Version {
        self.inner.state.read().revision
    }

    /// Number of registered watches.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.inner.watchers.lock();
        watchers.retain(|watcher| !watcher.sender.is_closed());
        watchers.len()
    }

    /// Remove expired entries now instead of on the next write.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.inner.state.write();
        self.inner.purge_expired(&mut state, Instant::now())
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.inner.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(KvError::Unavailable {
                message: "in-memory store marked unavailable".to_string(),
            })
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        self.check_available()?;
        validate_key(key)?;
        let now = Instant::now();
        let state = self.inner.state.read();
        Ok(state
            .entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.to_entry(key)))
    }

    fn set(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<Version, KvError> {
        self.check_available()?;
        validate_key(key)?;
        options.validate(key)?;

        let now = Instant::now();
        let mut state = self.inner.state.write();
        self.inner.purge_expired(&mut state, now);

        let current = state.entries.get(key).map(|slot| slot.version);
        if options.fail_if_exists && current.is_some() {
            return Err(KvError::AlreadyExists {
                key: key.to_string(),
            });
        }
        if options.fail_if_absent && current.is_none() {
            return Err(KvError::Absent {
                key: key.to_string(),
            });
        }
        if let Some(expected) = options.expected_version {
            if current != Some(expected) {
                return Err(KvError::Conflict {
                    key: key.to_string(),
                    expected: Some(expected),
                    actual: current,
                });
            }
        }

        state.revision += 1;
        let version = state.revision;
        state.entries.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                version,
                ttl: options.ttl,
                expires_at: options.ttl.map(|ttl| now + ttl),
            },
        );
        let kind = if current.is_some() {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        self.inner.notify(key, kind, Some(value), version);
        Ok(version)
    }

    fn delete(&self, key: &str, expected_version: Option<Version>) -> Result<bool, KvError> {
        self.check_available()?;
        validate_key(key)?;

        let mut state = self.inner.state.write();
        self.inner.purge_expired(&mut state, Instant::now());

        let current = state.entries.get(key).map(|slot| slot.version);
        if let Some(expected) = expected_version {
            if current != Some(expected) {
                return Err(KvError::Conflict {
                    key: key.to_string(),
                    expected: Some(expected),
                    actual: current,
                });
            }
        }
        if state.entries.remove(key).is_none() {
            return Ok(false);
        }
        state.revision += 1;
        let version = state.revision;
        self.inner.notify(key, ChangeKind::Deleted, None, version);
        Ok(true)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, KvError> {
        self.check_available()?;
        validate_key(prefix)?;

        let mut state = self.inner.state.write();
        self.inner.purge_expired(&mut state, Instant::now());

        let doomed: Vec<String> = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| is_under(prefix, key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.entries.remove(key);
            state.revision += 1;
            let version = state.revision;
            self.inner.notify(key, ChangeKind::Deleted, None, version);
        }
        Ok(doomed.len())
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, KvError> {
        self.check_available()?;
        if !prefix.is_empty() {
            validate_key(prefix)?;
        }
        let now = Instant::now();
        let state = self.inner.state.read();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, slot)| is_under(prefix, key) && slot.is_live(now))
            .map(|(key, slot)| slot.to_entry(key))
            .collect())
    }

    fn watch(&self, prefix: &str) -> Result<WatchStream, KvError> {
        self.check_available()?;
        if !prefix.is_empty() {
            validate_key(prefix)?;
        }
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let (sender, stream) = WatchStream::channel(prefix, self.inner.watch_buffer, move || {
            if let Some(inner) = weak.upgrade() {
                inner.unregister(id);
            }
        });
        self.inner.watchers.lock().push(Watcher {
            id,
            prefix: prefix.to_string(),
            sender,
        });
        debug!(watcher = id, prefix = %prefix, "Watch registered");
        Ok(stream)
    }
}
