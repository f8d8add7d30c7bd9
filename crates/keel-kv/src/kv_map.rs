//! # Cached Object Map
//!
//! [`KvMap`] keeps a local cache of named mapped objects in front of an
//! [`ObjectMapper`]. A watch reader task evicts cache entries whose subtree
//! changed in the store, so the next read goes back to the store.

use crate::mapping::schema::{save_object, Subtree};
use crate::mapping::{KvMapped, MapperError, ObjectMapper, TYPE_MARKER};
use crate::path::{child_name, join};
use crate::store::{ChangeKind, Version, WatchEvent};
use crate::watch::{spawn_watch, WatchTask};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to an entry of a [`KvMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KvMapAction {
    Created,
    Updated,
    Deleted,
    /// The cached copy was dropped after a change in the store.
    Invalidated,
}

/// Change notification from a [`KvMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvMapEvent {
    /// Prefix of the map.
    pub map: String,
    /// Object name.
    pub name: String,
    pub action: KvMapAction,
}

/// Callback receiving [`KvMapEvent`]s.
pub type KvMapListener = Arc<dyn Fn(&KvMapEvent) + Send + Sync>;

struct Cache<T> {
    entries: HashMap<String, T>,
    /// Bumped by every invalidation; a load started under an older epoch is
    /// not cached.
    epoch: u64,
}

struct Shared<T> {
    prefix: String,
    cache: Mutex<Cache<T>>,
    listener: RwLock<Option<KvMapListener>>,
}

impl<T> Shared<T> {
    fn emit(&self, name: &str, action: KvMapAction) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(&KvMapEvent {
                map: self.prefix.clone(),
                name: name.to_string(),
                action,
            });
        }
    }

    fn epoch(&self) -> u64 {
        self.cache.lock().epoch
    }

    fn invalidate(&self, name: &str) -> bool {
        let removed = {
            let mut cache = self.cache.lock();
            cache.epoch += 1;
            cache.entries.remove(name).is_some()
        };
        if removed {
            self.emit(name, KvMapAction::Invalidated);
        }
        removed
    }

    fn invalidate_all(&self) -> usize {
        let names: Vec<String> = {
            let mut cache = self.cache.lock();
            cache.epoch += 1;
            cache.entries.drain().map(|(name, _)| name).collect()
        };
        for name in &names {
            self.emit(name, KvMapAction::Invalidated);
        }
        names.len()
    }

    /// Cache `object` unless an invalidation happened since `epoch`.
    fn cache_if_current(&self, name: &str, object: T, epoch: u64) -> bool {
        let mut cache = self.cache.lock();
        if cache.epoch != epoch {
            return false;
        }
        cache.entries.insert(name.to_string(), object);
        true
    }
}

impl<T: KvMapped> Shared<T> {
    /// Whether a store change under `name` matches the cached copy, as it
    /// does for this map's own writes.
    fn agrees(&self, name: &str, event: &WatchEvent) -> bool {
        let cache = self.cache.lock();
        let Some(object) = cache.entries.get(name) else {
            return false;
        };
        let mut tree = Subtree::new();
        let path = join(&[self.prefix.as_str(), name]);
        if save_object(object, &path, &mut tree).is_err() {
            return false;
        }
        match event.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                let cached = tree.get(&event.key);
                cached.is_some() && cached == event.value.as_deref()
            }
            ChangeKind::Deleted | ChangeKind::Expired => !tree.contains(&event.key),
            ChangeKind::Lagged => false,
        }
    }

    fn on_store_change(&self, event: &WatchEvent) {
        match event.kind {
            ChangeKind::Lagged => {
                let dropped = self.invalidate_all();
                warn!(prefix = %self.prefix, dropped, "Watch lagged, cache cleared");
                return;
            }
            ChangeKind::Deleted | ChangeKind::Expired if event.key == self.prefix => {
                let dropped = self.invalidate_all();
                debug!(prefix = %self.prefix, dropped, "Map root removed, cache cleared");
                return;
            }
            _ => {}
        }
        let Some(name) = child_name(&self.prefix, &event.key) else {
            return;
        };
        if self.agrees(name, event) {
            return;
        }
        if self.invalidate(name) {
            debug!(prefix = %self.prefix, name, kind = ?event.kind, "Cache entry invalidated");
        }
    }
}

/// Named objects of type `T` cached over an [`ObjectMapper`].
///
/// Only present objects are cached. Clones share the cache.
pub struct KvMap<T> {
    mapper: ObjectMapper<T>,
    shared: Arc<Shared<T>>,
}

impl<T> Clone for KvMap<T> {
    fn clone(&self) -> Self {
        Self {
            mapper: self.mapper.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: KvMapped + Clone> KvMap<T> {
    pub fn new(mapper: ObjectMapper<T>) -> Self {
        let shared = Arc::new(Shared {
            prefix: mapper.prefix().to_string(),
            cache: Mutex::new(Cache {
                entries: HashMap::new(),
                epoch: 0,
            }),
            listener: RwLock::new(None),
        });
        Self { mapper, shared }
    }

    /// Attach a listener for change events.
    #[must_use]
    pub fn with_listener(self, listener: KvMapListener) -> Self {
        self.set_listener(Some(listener));
        self
    }

    pub fn set_listener(&self, listener: Option<KvMapListener>) {
        *self.shared.listener.write() = listener;
    }

    #[must_use]
    pub fn mapper(&self) -> &ObjectMapper<T> {
        &self.mapper
    }

    /// Load every object stored below the prefix into the cache.
    ///
    /// Returns the number of objects found.
    pub fn load(&self) -> Result<usize, MapperError> {
        let names = self.mapper.list()?;
        let mut found = 0;
        for name in &names {
            if self.get(name)?.is_some() {
                found += 1;
            }
        }
        debug!(prefix = %self.shared.prefix, found, "Loaded map");
        Ok(found)
    }

    /// Get an object, loading it from the store on a cache miss.
    pub fn get(&self, name: &str) -> Result<Option<T>, MapperError> {
        let epoch = {
            let cache = self.shared.cache.lock();
            if let Some(cached) = cache.entries.get(name) {
                return Ok(Some(cached.clone()));
            }
            cache.epoch
        };
        let loaded = self.mapper.load(name)?;
        if let Some(object) = &loaded {
            self.shared.cache_if_current(name, object.clone(), epoch);
        }
        Ok(loaded)
    }

    /// The cached copy of `name`, without touching the store.
    #[must_use]
    pub fn get_if_present(&self, name: &str) -> Option<T> {
        self.shared.cache.lock().entries.get(name).cloned()
    }

    /// Save an object and cache it.
    pub fn put(&self, name: &str, object: T) -> Result<Version, MapperError> {
        let existed = self.exists(name)?;
        let epoch = self.shared.epoch();
        let version = self.mapper.save(name, &object)?;
        self.stored(name, object, existed, epoch);
        Ok(version)
    }

    /// Save an object only if the stored version is still `expected`.
    pub fn put_versioned(
        &self,
        name: &str,
        object: T,
        expected: Version,
    ) -> Result<Version, MapperError> {
        let epoch = self.shared.epoch();
        let version = match self.mapper.save_versioned(name, &object, expected) {
            Ok(version) => version,
            Err(e) => {
                if e.is_conflict() {
                    self.shared.invalidate(name);
                }
                return Err(e);
            }
        };
        self.stored(name, object, true, epoch);
        Ok(version)
    }

    /// Return the object called `name`, creating it with `create` if absent.
    ///
    /// Creation fails over to the stored object when another writer created
    /// it first.
    pub fn compute_if_absent<F>(&self, name: &str, create: F) -> Result<T, MapperError>
    where
        F: FnOnce(&str) -> T,
    {
        if let Some(existing) = self.get(name)? {
            return Ok(existing);
        }
        let object = create(name);
        let epoch = self.shared.epoch();
        match self.mapper.create(name, &object) {
            Ok(_) => {
                self.stored(name, object.clone(), false, epoch);
                Ok(object)
            }
            Err(e) if e.is_conflict() => self.get(name)?.ok_or(e),
            Err(e) => Err(e),
        }
    }

    /// Replace the object called `name` with what `update` returns for the
    /// current one. Returning `None` removes the object.
    pub fn compute<F>(&self, name: &str, update: F) -> Result<Option<T>, MapperError>
    where
        F: FnOnce(&str, Option<&T>) -> Option<T>,
    {
        let current = self.get(name)?;
        match update(name, current.as_ref()) {
            Some(object) => {
                self.put(name, object.clone())?;
                Ok(Some(object))
            }
            None => {
                if current.is_some() {
                    self.remove(name)?;
                }
                Ok(None)
            }
        }
    }

    /// Delete an object. Returns `false` if it did not exist.
    pub fn remove(&self, name: &str) -> Result<bool, MapperError> {
        let removed = self.mapper.delete(name)?;
        {
            let mut cache = self.shared.cache.lock();
            cache.epoch += 1;
            cache.entries.remove(name);
        }
        if removed {
            self.shared.emit(name, KvMapAction::Deleted);
        }
        Ok(removed)
    }

    /// Names of all objects in the store.
    pub fn names(&self) -> Result<Vec<String>, MapperError> {
        self.mapper.list()
    }

    /// Names of the cached objects, sorted.
    #[must_use]
    pub fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.cache.lock().entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cached objects ordered by name. Use [`load`](Self::load) first to see
    /// everything in the store.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.snapshot().into_iter().map(|(_, o)| o).collect()
    }

    /// Call `action` for every cached object, ordered by name.
    ///
    /// Runs on a snapshot, so `action` may use the map.
    pub fn for_each<F>(&self, mut action: F)
    where
        F: FnMut(&str, &T),
    {
        for (name, object) in self.snapshot() {
            action(&name, &object);
        }
    }

    /// Drop the cached copy of `name`.
    pub fn invalidate(&self, name: &str) -> bool {
        self.shared.invalidate(name)
    }

    /// Drop every cached object.
    pub fn invalidate_all(&self) -> usize {
        self.shared.invalidate_all()
    }

    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.shared.cache.lock().entries.len()
    }

    /// Start the watch reader that keeps the cache coherent with the store.
    ///
    /// A change below the map prefix invalidates the affected entry unless it
    /// matches the cached copy. A lagged watch or removal of the prefix key
    /// itself clears the whole cache. Dropping the returned handle stops the
    /// reader. Must be called from within a Tokio runtime.
    pub fn watch(&self) -> Result<WatchTask, MapperError> {
        let stream = self.mapper.store().watch(self.mapper.prefix())?;
        let shared = self.shared.clone();
        let task = spawn_watch(stream, move |event| shared.on_store_change(&event));
        Ok(task)
    }

    fn snapshot(&self) -> Vec<(String, T)> {
        let mut entries: Vec<(String, T)> = self
            .shared
            .cache
            .lock()
            .entries
            .iter()
            .map(|(name, object)| (name.clone(), object.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn exists(&self, name: &str) -> Result<bool, MapperError> {
        if self.shared.cache.lock().entries.contains_key(name) {
            return Ok(true);
        }
        let marker = join(&[self.mapper.path(name)?.as_str(), TYPE_MARKER]);
        Ok(self.mapper.store().get(&marker)?.is_some())
    }

    fn stored(&self, name: &str, object: T, existed: bool, epoch: u64) {
        if !self.shared.cache_if_current(name, object, epoch) {
            debug!(prefix = %self.shared.prefix, name, "Invalidated during write, not cached");
        }
        let action = if existed {
            KvMapAction::Updated
        } else {
            KvMapAction::Created
        };
        self.shared.emit(name, action);
    }
}
