//! Store wrapper that runs a one-shot hook in the middle of an operation,
//! used to interleave a second writer deterministically.

use crate::error::KvError;
use crate::memory::InMemoryKvStore;
use crate::store::{KeyValueStore, KvEntry, Version, WriteOptions};
use crate::watch::WatchStream;
use parking_lot::Mutex;
use std::sync::Arc;

/// Operation after which an armed hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookPoint {
    Set,
    List,
}

type Hook = Box<dyn FnOnce() + Send>;

pub(crate) struct HookedStore {
    inner: Arc<InMemoryKvStore>,
    hook: Mutex<Option<(HookPoint, Hook)>>,
}

impl HookedStore {
    pub(crate) fn new(inner: Arc<InMemoryKvStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            hook: Mutex::new(None),
        })
    }

    /// Run `hook` once, right after the next `point` operation completes.
    pub(crate) fn arm(&self, point: HookPoint, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some((point, Box::new(hook)));
    }

    fn fire(&self, point: HookPoint) {
        let hook = {
            let mut slot = self.hook.lock();
            match slot.take() {
                Some((armed, hook)) if armed == point => Some(hook),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl KeyValueStore for HookedStore {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<Version, KvError> {
        let version = self.inner.set(key, value, options)?;
        self.fire(HookPoint::Set);
        Ok(version)
    }

    fn delete(&self, key: &str, expected_version: Option<Version>) -> Result<bool, KvError> {
        self.inner.delete(key, expected_version)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, KvError> {
        self.inner.delete_prefix(prefix)
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, KvError> {
        let entries = self.inner.list(prefix)?;
        self.fire(HookPoint::List);
        Ok(entries)
    }

    fn watch(&self, prefix: &str) -> Result<WatchStream, KvError> {
        self.inner.watch(prefix)
    }
}
