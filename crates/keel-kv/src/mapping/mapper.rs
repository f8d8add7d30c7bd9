//! Typed save/load of mapped objects against a [`KeyValueStore`].

use super::error::MapperError;
use super::schema::{load_object, save_object, KvMapped, Subtree, TYPE_MARKER};
use crate::path::{child_name, join, validate_key, validate_segment};
use crate::store::{KeyValueStore, Version, WriteOptions};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Saves and loads objects of type `T` below a fixed prefix.
///
/// Each object lives at `{prefix}/{name}`; its type marker key carries the
/// object-level version used by [`save_versioned`](Self::save_versioned).
pub struct ObjectMapper<T> {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ObjectMapper<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ObjectMapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMapper")
            .field("prefix", &self.prefix)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: KvMapped> ObjectMapper<T> {
    /// Create a mapper for objects stored below `prefix`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        prefix: impl Into<String>,
    ) -> Result<Self, MapperError> {
        let prefix = join(&[prefix.into()]);
        validate_key(&prefix)?;
        Ok(Self {
            store,
            prefix,
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Root path of the object called `name`.
    pub fn path(&self, name: &str) -> Result<String, MapperError> {
        validate_segment(name)?;
        Ok(join(&[self.prefix.as_str(), name]))
    }

    /// Object name for a key below the prefix, if any.
    #[must_use]
    pub fn name_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        child_name(&self.prefix, key)
    }

    /// Write `object` unconditionally. Returns the new object version.
    pub fn save(&self, name: &str, object: &T) -> Result<Version, MapperError> {
        self.write(name, object, &WriteOptions::new())
    }

    /// Write `object` only if no object called `name` exists yet.
    pub fn create(&self, name: &str, object: &T) -> Result<Version, MapperError> {
        self.write(name, object, &WriteOptions::new().fail_if_exists())
    }

    /// Write `object` only if the stored object is still at `expected`.
    ///
    /// A lost race surfaces as [`MapperError::is_conflict`]; it is not
    /// retried here.
    pub fn save_versioned(
        &self,
        name: &str,
        object: &T,
        expected: Version,
    ) -> Result<Version, MapperError> {
        self.write(name, object, &WriteOptions::new().expect_version(expected))
    }

    /// Load the object called `name`. A never-saved name is `Ok(None)`.
    pub fn load(&self, name: &str) -> Result<Option<T>, MapperError> {
        Ok(self.load_versioned(name)?.map(|(object, _)| object))
    }

    /// Load the object together with its version.
    pub fn load_versioned(&self, name: &str) -> Result<Option<(T, Version)>, MapperError> {
        let path = self.path(name)?;
        let marker = join(&[path.as_str(), TYPE_MARKER]);
        let entries = self.store.list(&path)?;
        let Some(found) = entries.iter().find(|e| e.key == marker) else {
            return Ok(None);
        };
        let version = found.version;
        let tree: Subtree = entries.into_iter().map(|e| (e.key, e.value)).collect();
        let object = load_object::<T>(&path, &tree)?;
        Ok(object.map(|object| (object, version)))
    }

    /// Remove the object's subtree. Returns `false` if nothing was stored.
    pub fn delete(&self, name: &str) -> Result<bool, MapperError> {
        let path = self.path(name)?;
        let removed = self.store.delete_prefix(&path)?;
        debug!(path = %path, removed, "Deleted mapped object");
        Ok(removed > 0)
    }

    /// Names of all objects stored below the prefix, sorted.
    pub fn list(&self) -> Result<Vec<String>, MapperError> {
        let mut names = BTreeSet::new();
        for entry in self.store.list(&self.prefix)? {
            let Some(name) = self.name_of(&entry.key) else {
                continue;
            };
            if entry.key == join(&[self.prefix.as_str(), name, TYPE_MARKER]) {
                names.insert(name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Marker first (carrying `options`), then every leaf of the new subtree,
    /// then pruning of keys the new subtree no longer contains.
    ///
    /// Pruning works from a listing taken after the leaves are written, so
    /// keys added by a concurrent writer in between are removed as well.
    fn write(
        &self,
        name: &str,
        object: &T,
        options: &WriteOptions,
    ) -> Result<Version, MapperError> {
        let path = self.path(name)?;
        let marker = join(&[path.as_str(), TYPE_MARKER]);

        let mut tree = Subtree::new();
        save_object(object, &path, &mut tree)?;
        let marker_value = tree.remove(&marker).unwrap_or_default();

        let version = self.store.set(&marker, &marker_value, options)?;
        for (key, value) in tree.iter() {
            self.store.put(key, value)?;
        }

        let mut pruned = 0usize;
        for entry in self.store.list(&path)? {
            if entry.key != marker && !tree.contains(&entry.key) {
                self.store.delete(&entry.key, None)?;
                pruned += 1;
            }
        }

        debug!(path = %path, version, written = tree.len(), pruned, "Saved mapped object");
        Ok(version)
    }
}
