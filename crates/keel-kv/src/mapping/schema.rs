//! # Mapping Schemas
//!
//! A [`Schema`] is built once per type and lists the persisted fields, each
//! with its key fragment, shape and optionality. Field access goes through
//! plain function pointers, so a schema is a static table rather than
//! something discovered at runtime.
//!
//! ## Layout
//!
//! ```text
//! <path>/@type                 "pipeline"          (type marker, object root)
//! <path>/name                  "\"web\""           (scalar, JSON)
//! <path>/tags/00000000         "\"edge\""          (list element)
//! <path>/source/@type          "source"            (nested object)
//! <path>/source/image          "\"nginx\""
//! <path>/stages/00000000/@type "stage"             (list of nested objects)
//! ```
//!
//! Lists are compacted on every save: elements always occupy indices
//! `0..len`, so removing an element shifts the following ones down and the
//! trailing index disappears.

use super::error::MapperError;
use crate::path::{join, SEPARATOR};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Key fragment holding an object's type name. Its presence marks the root
/// of a mapped object.
pub const TYPE_MARKER: &str = "@type";

/// A type that can be saved to and loaded from a KV subtree.
///
/// ```ignore
/// impl KvMapped for Stage {
///     fn schema() -> &'static Schema<Self> {
///         static SCHEMA: OnceLock<Schema<Stage>> = OnceLock::new();
///         SCHEMA.get_or_init(|| {
///             Schema::builder("stage")
///                 .field("name", |s: &Stage| &s.name, |s, v| s.name = v)
///                 .build()
///         })
///     }
/// }
/// ```
pub trait KvMapped: Default + Send + Sync + 'static {
    fn schema() -> &'static Schema<Self>;
}

/// Shape of a persisted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    List,
    Nested,
    NestedList,
}

/// Description of one persisted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Key fragment below the object path.
    pub key: &'static str,
    pub kind: FieldKind,
    /// Optional fields load as `None` (lists as empty) when absent.
    pub optional: bool,
}

/// Flattened subtree: absolute key to raw value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Subtree {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Subtree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Numeric child segments directly below `prefix`, ordered by index.
    fn indices(&self, prefix: &str) -> Vec<(usize, String)> {
        let start = format!("{prefix}{SEPARATOR}");
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for key in self
            .entries
            .range(start.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&start))
        {
            let rest = &key[start.len()..];
            let segment = rest.split(SEPARATOR).next().unwrap_or(rest);
            if let Ok(index) = segment.parse::<usize>() {
                if seen.insert(segment.to_string()) {
                    out.push((index, segment.to_string()));
                }
            }
        }
        out.sort();
        out
    }
}

impl FromIterator<(String, Vec<u8>)> for Subtree {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Key segment for list element `index`.
#[must_use]
pub fn index_segment(index: usize) -> String {
    format!("{index:08}")
}

trait FieldMapping<T>: Send + Sync {
    fn info(&self) -> FieldInfo;
    fn save(&self, object: &T, path: &str, out: &mut Subtree) -> Result<(), MapperError>;
    fn load(&self, object: &mut T, path: &str, tree: &Subtree) -> Result<(), MapperError>;
}

/// Persisted field table for `T`.
pub struct Schema<T> {
    type_name: &'static str,
    fields: Vec<Box<dyn FieldMapping<T>>>,
}

impl<T: 'static> Schema<T> {
    /// Start a schema for objects tagged `type_name`.
    #[must_use]
    pub fn builder(type_name: &'static str) -> SchemaBuilder<T> {
        SchemaBuilder {
            type_name,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldInfo> + '_ {
        self.fields.iter().map(|field| field.info())
    }
}

impl<T> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<FieldInfo> = self.fields.iter().map(|field| field.info()).collect();
        f.debug_struct("Schema")
            .field("type_name", &self.type_name)
            .field("fields", &fields)
            .finish()
    }
}

/// Builder for [`Schema`].
pub struct SchemaBuilder<T> {
    type_name: &'static str,
    fields: Vec<Box<dyn FieldMapping<T>>>,
}

impl<T: 'static> SchemaBuilder<T> {
    /// Required scalar field.
    #[must_use]
    pub fn field<V>(self, key: &'static str, get: fn(&T) -> &V, set: fn(&mut T, V)) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.push(Box::new(Scalar { key, get, set }))
    }

    /// Optional scalar field; `None` is stored as an absent key.
    #[must_use]
    pub fn optional_field<V>(
        self,
        key: &'static str,
        get: fn(&T) -> &Option<V>,
        set: fn(&mut T, Option<V>),
    ) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.push(Box::new(OptionalScalar { key, get, set }))
    }

    /// Ordered list of scalars stored as indexed child keys.
    #[must_use]
    pub fn list<V>(self, key: &'static str, get: fn(&T) -> &Vec<V>, set: fn(&mut T, Vec<V>)) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.push(Box::new(ScalarList { key, get, set }))
    }

    /// Required nested mapped object.
    #[must_use]
    pub fn nested<N: KvMapped>(
        self,
        key: &'static str,
        get: fn(&T) -> &N,
        set: fn(&mut T, N),
    ) -> Self {
        self.push(Box::new(Nested { key, get, set }))
    }

    /// Optional nested mapped object; a missing subtree loads as `None`.
    #[must_use]
    pub fn optional_nested<N: KvMapped>(
        self,
        key: &'static str,
        get: fn(&T) -> &Option<N>,
        set: fn(&mut T, Option<N>),
    ) -> Self {
        self.push(Box::new(OptionalNested { key, get, set }))
    }

    /// Ordered list of nested mapped objects, one subtree per element.
    #[must_use]
    pub fn nested_list<N: KvMapped>(
        self,
        key: &'static str,
        get: fn(&T) -> &Vec<N>,
        set: fn(&mut T, Vec<N>),
    ) -> Self {
        self.push(Box::new(NestedList { key, get, set }))
    }

    /// Finish the schema.
    ///
    /// # Panics
    ///
    /// If two fields share a key fragment or a fragment is not a single path
    /// segment. Schemas are static tables, so this is a programming error.
    #[must_use]
    pub fn build(self) -> Schema<T> {
        let mut keys = BTreeSet::new();
        for field in &self.fields {
            let key = field.info().key;
            assert!(
                !key.is_empty() && !key.contains(SEPARATOR) && key != TYPE_MARKER,
                "schema '{}': invalid key fragment '{}'",
                self.type_name,
                key
            );
            assert!(
                keys.insert(key),
                "schema '{}': duplicate key fragment '{}'",
                self.type_name,
                key
            );
        }
        Schema {
            type_name: self.type_name,
            fields: self.fields,
        }
    }

    fn push(mut self, field: Box<dyn FieldMapping<T>>) -> Self {
        self.fields.push(field);
        self
    }
}

fn encode<V: Serialize + ?Sized>(key: &str, value: &V) -> Result<Vec<u8>, MapperError> {
    serde_json::to_vec(value).map_err(|e| MapperError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<V: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<V, MapperError> {
    serde_json::from_slice(bytes).map_err(|e| MapperError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Write `object` and its nested objects into `out` below `path`.
pub(crate) fn save_object<T: KvMapped>(
    object: &T,
    path: &str,
    out: &mut Subtree,
) -> Result<(), MapperError> {
    let schema = T::schema();
    let marker = join(&[path, TYPE_MARKER]);
    out.insert(marker.clone(), encode(&marker, schema.type_name())?);
    for field in &schema.fields {
        field.save(object, path, out)?;
    }
    Ok(())
}

/// Rebuild an object from the subtree at `path`.
///
/// Returns `Ok(None)` when no type marker exists at `path`.
pub(crate) fn load_object<T: KvMapped>(
    path: &str,
    tree: &Subtree,
) -> Result<Option<T>, MapperError> {
    let schema = T::schema();
    let marker = join(&[path, TYPE_MARKER]);
    let Some(raw) = tree.get(&marker) else {
        return Ok(None);
    };
    let found: String = decode(&marker, raw)?;
    if found != schema.type_name() {
        return Err(MapperError::TypeMismatch {
            path: path.to_string(),
            expected: schema.type_name(),
            found,
        });
    }

    let mut object = T::default();
    for field in &schema.fields {
        field.load(&mut object, path, tree)?;
    }
    Ok(Some(object))
}

struct Scalar<T, V> {
    key: &'static str,
    get: fn(&T) -> &V,
    set: fn(&mut T, V),
}

impl<T, V> FieldMapping<T> for Scalar<T, V>
where
    V: Serialize + DeserializeOwned,
{
    fn info(&self) -> FieldInfo {
        FieldInfo {
            key: self.key,
            kind: FieldKind::Scalar,
            optional: false,
        }
    }

    fn save(&self, object: &T, path: &str, out: &mut Subtree) -> Result<(), MapperError> {
        let key = join(&[path, self.key]);
        let value = encode(&key, (self.get)(object))?;
        out.insert(key, value);
        Ok(())
    }

    fn load(&self, object: &mut T, path: &str, tree: &Subtree) -> Result<(), MapperError> {
        let key = join(&[path, self.key]);
        let Some(raw) = tree.get(&key) else {
            return Err(MapperError::MissingField {
                path: path.to_string(),
                field: self.key,
            });
        };
        (self.set)(object, decode(&key, raw)?);
        Ok(())
    }
}

struct OptionalScalar<T, V> {
    key: &'static str,
    get: fn(&T) -> &Option<V>,
    set: fn(&mut T, Option<V>),
}

impl<T, V> FieldMapping<T> for OptionalScalar<T, V>
where
    V: Serialize + DeserializeOwned,
{
    fn info(&self) -> FieldInfo {
        FieldInfo {
            key: self.key,
            kind: FieldKind::Scalar,
            optional: true,
        }
    }

    fn save(&self, object: &T, path: &str, out: &mut Subtree) -> Result<(), MapperError> {
        if let Some(value) = (self.get)(object) {
            let key = join(&[path, self.key]);
            let value = encode(&key, value)?;
            out.insert(key, value);
        }
        Ok(())
    }

    fn load(&self, object: &mut T, path: &str, tree: &Subtree) -> Result<(), MapperError> {
        let key = join(&[path, self.key]);
        let value = match tree.get(&key) {
            Some(raw) => Some(decode(&key, raw)?),
            None => None,
        };
        (self.set)(object, value);
        Ok(())
    }
}

struct ScalarList<T, V> {
    key: &'static str,
    get: fn(&T) -> &Vec<V>,
    set: fn(&mut T, Vec<V>),
}

impl<T, V> FieldMapping<T> for ScalarList<T, V>
where
    V: Serialize + DeserializeOwned,
{
    fn info(&self) -> FieldInfo {
        FieldInfo {
            key: self.key,
            kind: FieldKind::List,
            optional: true,
        }
    }

    fn save(&self, object: &T, path: &str, out: &mut Subtree) -> Result<(), MapperError> {
        let base = join(&[path, self.key]);
        for (index, value) in (self.get)(object).iter().enumerate() {
            let key = join(&[base.as_str(), &index_segment(index)]);
            let value = encode(&key, value)?;
            out.insert(key, value);
        }
        Ok(())
    }

    fn load(&self, object: &mut T, path: &str, tree: &Subtree) -> Result<(), MapperError> {
        let base = join(&[path, self.key]);
        let mut values = Vec::new();
        for (_, segment) in tree.indices(&base) {
            let key = join(&[base.as_str(), &segment]);
            if let Some(raw) = tree.get(&key) {
                values.push(decode(&key, raw)?);
            }
        }
        (self.set)(object, values);
        Ok(())
    }
}

struct Nested<T, N> {
    key: &'static str,
    get: fn(&T) -> &N,
    set: fn(&mut T, N),
}

impl<T, N: KvMapped> FieldMapping<T> for Nested<T, N> {
    fn info(&self) -> FieldInfo {
        FieldInfo {
            key: self.key,
            kind: FieldKind::Nested,
            optional: false,
        }
    }

    fn save(&self, object: &T, path: &str, out: &mut Subtree) -> Result<(), MapperError> {
        save_object((self.get)(object), &join(&[path, self.key]), out)
    }

    fn load(&self, object: &mut T, path: &str, tree: &Subtree) -> Result<(), MapperError> {
        match load_object::<N>(&join(&[path, self.key]), tree)? {
            Some(value) => {
                (self.set)(object, value);
                Ok(())
            }
            None => Err(MapperError::MissingField {
                path: path.to_string(),
                field: self.key,
            }),
        }
    }
}

struct OptionalNested<T, N> {
    key: &'static str,
    get: fn(&T) -> &Option<N>,
    set: fn(&mut T, Option<N>),
}

impl<T, N: KvMapped> FieldMapping<T> for OptionalNested<T, N> {
    fn info(&self) -> FieldInfo {
        FieldInfo {
            key: self.key,
            kind: FieldKind::Nested,
            optional: true,
        }
    }

    fn save(&self, object: &T, path: &str, out: &mut Subtree) -> Result<(), MapperError> {
        match (self.get)(object) {
            Some(value) => save_object(value, &join(&[path, self.key]), out),
            None => Ok(()),
        }
    }

    fn load(&self, object: &mut T, path: &str, tree: &Subtree) -> Result<(), MapperError> {
        let value = load_object::<N>(&join(&[path, self.key]), tree)?;
        (self.set)(object, value);
        Ok(())
    }
}

struct NestedList<T, N> {
    key: &'static str,
    get: fn(&T) -> &Vec<N>,
    set: fn(&mut T, Vec<N>),
}

impl<T, N: KvMapped> FieldMapping<T> for NestedList<T, N> {
    fn info(&self) -> FieldInfo {
        FieldInfo {
            key: self.key,
            kind: FieldKind::NestedList,
            optional: true,
        }
    }

    fn save(&self, object: &T, path: &str, out: &mut Subtree) -> Result<(), MapperError> {
        let base = join(&[path, self.key]);
        for (index, value) in (self.get)(object).iter().enumerate() {
            save_object(value, &join(&[base.as_str(), &index_segment(index)]), out)?;
        }
        Ok(())
    }

    fn load(&self, object: &mut T, path: &str, tree: &Subtree) -> Result<(), MapperError> {
        let base = join(&[path, self.key]);
        let mut values = Vec::new();
        for (_, segment) in tree.indices(&base) {
            let item_path = join(&[base.as_str(), &segment]);
            match load_object::<N>(&item_path, tree)? {
                Some(value) => values.push(value),
                None => {
                    return Err(MapperError::Malformed {
                        key: item_path,
                        reason: "list element has no type marker".to_string(),
                    })
                }
            }
        }
        (self.set)(object, values);
        Ok(())
    }
}
