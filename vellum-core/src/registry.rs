//! Catalog of persisted types.
//!
//! The registry maps `(name, version)` pairs to concrete Rust types and back,
//! and knows how to encode and decode each registered type as JSON. Durable
//! stores use it to turn stored rows back into typed events and snapshots.
//!
//! Build it once at startup and share it:
//!
//! ```
//! use std::sync::Arc;
//!
//! use serde::{Deserialize, Serialize};
//! use vellum_core::{registry::TypeRegistry, versioned::Versioned};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Opened { owner: String }
//!
//! impl Versioned for Opened {
//!     const NAME: &'static str = "account-opened";
//! }
//!
//! let registry = Arc::new(TypeRegistry::builder().register::<Opened>().build()?);
//! assert!(registry.lookup("account-opened", 0).is_some());
//! # Ok::<(), vellum_core::registry::TypeDefinitionConflict>(())
//! ```

use std::{
    any::TypeId,
    collections::{BTreeMap, HashMap},
    fmt,
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::versioned::{TypeKey, Versioned, VersionedValue};

type EncodeFn = fn(&dyn VersionedValue) -> Option<Result<serde_json::Value, serde_json::Error>>;
type DecodeFn = fn(serde_json::Value) -> Result<Box<dyn VersionedValue>, serde_json::Error>;

/// Invalid set of type definitions, detected while building the registry.
///
/// These are programming errors and should abort startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeDefinitionConflict {
    #[error("type definition conflict: `{first}` and `{second}` are both registered as `{key}`")]
    Duplicate {
        key: TypeKey,
        first: &'static str,
        second: &'static str,
    },
    #[error(
        "type definition conflict: `{name}` mixes unversioned and versioned definitions \
         (versions {versions:?}); either every definition uses version 0 or none does"
    )]
    MixedVersioning {
        name: &'static str,
        versions: Vec<u32>,
    },
}

/// Failure to construct a concrete value from its stored form.
#[derive(Debug, Error)]
#[error("failed to create `{type_name}`: {source}")]
pub struct CreationError {
    pub type_name: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Error from encoding or decoding through the registry.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("type `{type_name}` is not registered")]
    Unregistered { type_name: &'static str },
    #[error("no type registered for `{name}@v{version}`")]
    UnknownType { name: String, version: u32 },
    #[error(transparent)]
    Creation(#[from] CreationError),
}

/// Registered information about one concrete type.
#[derive(Clone, Copy)]
pub struct TypeEntry {
    pub key: TypeKey,
    pub type_name: &'static str,
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl TypeEntry {
    fn of<T>() -> Self
    where
        T: Versioned + Serialize + DeserializeOwned,
    {
        Self {
            key: TypeKey::of::<T>(),
            type_name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            encode: encode_as::<T>,
            decode: decode_as::<T>,
        }
    }
}

impl fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeEntry")
            .field("key", &self.key)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

fn encode_as<T>(value: &dyn VersionedValue) -> Option<Result<serde_json::Value, serde_json::Error>>
where
    T: Versioned + Serialize,
{
    value.downcast_ref::<T>().map(serde_json::to_value)
}

fn decode_as<T>(value: serde_json::Value) -> Result<Box<dyn VersionedValue>, serde_json::Error>
where
    T: Versioned + DeserializeOwned,
{
    serde_json::from_value::<T>(value).map(|v| Box::new(v) as Box<dyn VersionedValue>)
}

/// Collects type registrations before validation.
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    entries: Vec<TypeEntry>,
}

impl TypeRegistryBuilder {
    /// Add a type to the catalog.
    #[must_use]
    pub fn register<T>(mut self) -> Self
    where
        T: Versioned + Serialize + DeserializeOwned,
    {
        self.entries.push(TypeEntry::of::<T>());
        self
    }

    /// Validate the registrations and freeze them into a [`TypeRegistry`].
    ///
    /// # Errors
    ///
    /// Returns [`TypeDefinitionConflict::Duplicate`] when two different
    /// types claim the same `(name, version)`, and
    /// [`TypeDefinitionConflict::MixedVersioning`] when a name has both
    /// version `0` and positive versions.
    pub fn build(self) -> Result<TypeRegistry, TypeDefinitionConflict> {
        let mut by_name: HashMap<&'static str, BTreeMap<u32, TypeEntry>> = HashMap::new();
        let mut by_type: HashMap<TypeId, TypeKey> = HashMap::new();

        for entry in self.entries {
            if by_type.contains_key(&entry.type_id) {
                continue;
            }
            let versions = by_name.entry(entry.key.name).or_default();
            if let Some(existing) = versions.get(&entry.key.version) {
                return Err(TypeDefinitionConflict::Duplicate {
                    key: entry.key,
                    first: existing.type_name,
                    second: entry.type_name,
                });
            }
            versions.insert(entry.key.version, entry);
            by_type.insert(entry.type_id, entry.key);
        }

        for (name, versions) in &by_name {
            if versions.len() > 1 && versions.contains_key(&0) {
                return Err(TypeDefinitionConflict::MixedVersioning {
                    name: *name,
                    versions: versions.keys().copied().collect(),
                });
            }
        }

        tracing::debug!(
            names = by_name.len(),
            types = by_type.len(),
            "type registry built"
        );
        Ok(TypeRegistry { by_name, by_type })
    }
}

/// Immutable `(name, version)` catalog.
///
/// There is no way to mutate a registry after [`TypeRegistryBuilder::build`],
/// so it can be shared freely (usually as `Arc<TypeRegistry>`) and read
/// without locking.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_name: HashMap<&'static str, BTreeMap<u32, TypeEntry>>,
    by_type: HashMap<TypeId, TypeKey>,
}

impl TypeRegistry {
    #[must_use]
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// The registered key for `T`, if `T` was registered.
    #[must_use]
    pub fn resolve<T: Versioned>(&self) -> Option<TypeKey> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// The registered key for the runtime type of `value`.
    #[must_use]
    pub fn resolve_value(&self, value: &dyn VersionedValue) -> Option<TypeKey> {
        self.by_type.get(&value.as_any().type_id()).copied()
    }

    #[must_use]
    pub fn lookup(&self, name: &str, version: u32) -> Option<&TypeEntry> {
        self.by_name.get(name)?.get(&version)
    }

    /// Highest registered version for `name`.
    #[must_use]
    pub fn latest_version(&self, name: &str) -> Option<u32> {
        self.by_name
            .get(name)?
            .last_key_value()
            .map(|(version, _)| *version)
    }

    /// All registered versions for `name`, ascending.
    #[must_use]
    pub fn versions(&self, name: &str) -> Vec<u32> {
        self.by_name
            .get(name)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Encode a value into its key and JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unregistered`] if the value's type is not in the
    /// catalog, or [`CodecError::Creation`] if serialisation fails.
    pub fn encode(
        &self,
        value: &dyn VersionedValue,
    ) -> Result<(TypeKey, serde_json::Value), CodecError> {
        let unregistered = || CodecError::Unregistered {
            type_name: value.type_name(),
        };
        let key = self.resolve_value(value).ok_or_else(unregistered)?;
        let entry = self.lookup(key.name, key.version).ok_or_else(unregistered)?;
        let json = (entry.encode)(value)
            .ok_or_else(unregistered)?
            .map_err(|source| CreationError {
                type_name: entry.type_name,
                source,
            })?;
        Ok((key, json))
    }

    /// Decode the stored JSON form of `(name, version)`.
    ///
    /// The result is the stored shape, not necessarily the latest one; pass
    /// it through [`upgrade_to_latest`](crate::versioned::upgrade_to_latest)
    /// before handing it to application code.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownType`] for an unregistered pair, or
    /// [`CodecError::Creation`] if the JSON does not fit the type.
    pub fn decode(
        &self,
        name: &str,
        version: u32,
        data: serde_json::Value,
    ) -> Result<Box<dyn VersionedValue>, CodecError> {
        let entry = self
            .lookup(name, version)
            .ok_or_else(|| CodecError::UnknownType {
                name: name.to_string(),
                version,
            })?;
        (entry.decode)(data).map_err(|source| {
            CodecError::Creation(CreationError {
                type_name: entry.type_name,
                source,
            })
        })
    }
}
