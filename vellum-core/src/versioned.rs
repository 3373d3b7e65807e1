//! Versioned types and the upgrade protocol.
//!
//! Every persisted shape (events and snapshot payloads) carries a
//! `(name, version)` pair. The name identifies the logical fact ("funds
//! deposited"), the version identifies one concrete schema of it. Historical
//! shapes stay in the codebase and know how to produce their successor via
//! [`Versioned::upgrade`]; [`upgrade_to_latest`] walks that chain until it
//! reaches the current shape.
//!
//! ```
//! use vellum_core::versioned::{TypeKey, Versioned, VersionedValue, upgrade_into};
//!
//! #[derive(Debug)]
//! struct DepositedV1 { cents: i64 }
//!
//! #[derive(Debug)]
//! struct Deposited { amount: i64, currency: String }
//!
//! impl Versioned for DepositedV1 {
//!     const NAME: &'static str = "funds-deposited";
//!     const VERSION: u32 = 1;
//!
//!     fn upgrade(&self) -> Option<Box<dyn VersionedValue>> {
//!         Some(Box::new(Deposited { amount: self.cents, currency: "EUR".into() }))
//!     }
//! }
//!
//! impl Versioned for Deposited {
//!     const NAME: &'static str = "funds-deposited";
//!     const VERSION: u32 = 2;
//! }
//!
//! let latest: std::sync::Arc<Deposited> =
//!     upgrade_into(std::sync::Arc::new(DepositedV1 { cents: 250 })).unwrap();
//! assert_eq!(latest.amount, 250);
//! assert_eq!(TypeKey::of::<Deposited>().version, 2);
//! ```

use std::{any::Any, fmt, sync::Arc};

use thiserror::Error;

/// The `(name, version)` pair identifying one concrete persisted shape.
///
/// Version `0` marks an unversioned (singleton) type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    pub name: &'static str,
    pub version: u32,
}

impl TypeKey {
    #[must_use]
    pub const fn new(name: &'static str, version: u32) -> Self {
        Self { name, version }
    }

    /// Resolve the key of a concrete type.
    ///
    /// The pair comes from associated constants, so resolution is free and
    /// identical for every value of `T`.
    #[must_use]
    pub const fn of<T: Versioned>() -> Self {
        Self::new(T::NAME, T::VERSION)
    }

    #[must_use]
    pub const fn is_versioned(&self) -> bool {
        self.version > 0
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// A type with a stable persisted identity that may upgrade to a newer
/// shape.
///
/// Implement this on every event and snapshot payload. Keep old shapes
/// around and have each one return its direct successor from
/// [`upgrade`](Self::upgrade); the latest shape keeps the default `None`.
///
/// `#[derive(Versioned)]` generates this implementation.
pub trait Versioned: Any + Send + Sync + fmt::Debug {
    /// Logical name shared by every version of this shape.
    const NAME: &'static str;

    /// Schema version. `0` means the name is unversioned.
    const VERSION: u32 = 0;

    /// Produce the next shape in the upgrade chain, or `None` if this is the
    /// latest.
    fn upgrade(&self) -> Option<Box<dyn VersionedValue>> {
        None
    }
}

/// Object-safe view of a [`Versioned`] value.
///
/// Stores and aggregates hold events as `Arc<dyn VersionedValue>`, so a
/// single log can carry many concrete event types. This trait is implemented
/// for every `Versioned` type and should not be implemented by hand.
pub trait VersionedValue: Any + Send + Sync + fmt::Debug {
    fn type_key(&self) -> TypeKey;

    /// The concrete Rust type name, for diagnostics.
    fn type_name(&self) -> &'static str;

    fn upgrade_value(&self) -> Option<Box<dyn VersionedValue>>;

    fn as_any(&self) -> &dyn Any;

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Versioned> VersionedValue for T {
    fn type_key(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn upgrade_value(&self) -> Option<Box<dyn VersionedValue>> {
        self.upgrade()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl dyn VersionedValue {
    /// Borrow the value as a concrete type.
    #[must_use]
    pub fn downcast_ref<T: Versioned>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    #[must_use]
    pub fn is<T: Versioned>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Failure while walking an upgrade chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    /// A step produced a value with a different logical name.
    #[error(
        "type upgrade conflict: `{from}` upgraded to `{to}` (hint: an upgrade must keep the type \
         name)"
    )]
    NameChanged { from: TypeKey, to: TypeKey },
    /// A step did not strictly increase the version.
    #[error(
        "type version upgrade conflict: `{from}` upgraded to `{to}` (hint: each upgrade must \
         strictly increase the version)"
    )]
    VersionNotIncreased { from: TypeKey, to: TypeKey },
    /// The latest shape is not the type the caller asked for.
    #[error("expected `{expected}` after upgrade, found `{found}`")]
    UnexpectedType {
        expected: &'static str,
        found: TypeKey,
    },
}

/// Upgrade a value through its chain until it reports no successor.
///
/// A value without a successor is returned unchanged. Each step must keep the
/// name and strictly increase the version; a violation fails with
/// [`UpgradeError::NameChanged`] or [`UpgradeError::VersionNotIncreased`]
/// respectively, which also rules out cycles.
///
/// # Errors
///
/// Returns an [`UpgradeError`] if any step breaks the chain invariants.
pub fn upgrade_to_latest(
    value: Arc<dyn VersionedValue>,
) -> Result<Arc<dyn VersionedValue>, UpgradeError> {
    let mut current = value;
    while let Some(next) = current.upgrade_value() {
        let from = current.type_key();
        let to = next.type_key();
        if to.name != from.name {
            return Err(UpgradeError::NameChanged { from, to });
        }
        if to.version <= from.version {
            return Err(UpgradeError::VersionNotIncreased { from, to });
        }
        tracing::trace!(%from, %to, "upgraded value");
        current = Arc::from(next);
    }
    Ok(current)
}

/// Upgrade a value and view the result as `T`.
///
/// # Errors
///
/// Returns an [`UpgradeError`] if the chain is broken, or
/// [`UpgradeError::UnexpectedType`] if the latest shape is not `T`.
pub fn upgrade_into<T: Versioned>(value: Arc<dyn VersionedValue>) -> Result<Arc<T>, UpgradeError> {
    let latest = upgrade_to_latest(value)?;
    let found = latest.type_key();
    latest.into_any_arc().downcast::<T>().map_err(|_| UpgradeError::UnexpectedType {
        expected: std::any::type_name::<T>(),
        found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct OpenedV1 {
        owner: String,
    }

    #[derive(Debug, PartialEq)]
    struct OpenedV2 {
        owner: String,
        currency: String,
    }

    #[derive(Debug, PartialEq)]
    struct Opened {
        owner: String,
        currency: String,
        overdraft: i64,
    }

    impl Versioned for OpenedV1 {
        const NAME: &'static str = "account-opened";
        const VERSION: u32 = 1;

        fn upgrade(&self) -> Option<Box<dyn VersionedValue>> {
            Some(Box::new(OpenedV2 {
                owner: self.owner.clone(),
                currency: "EUR".to_string(),
            }))
        }
    }

    impl Versioned for OpenedV2 {
        const NAME: &'static str = "account-opened";
        const VERSION: u32 = 2;

        fn upgrade(&self) -> Option<Box<dyn VersionedValue>> {
            Some(Box::new(Opened {
                owner: self.owner.clone(),
                currency: self.currency.clone(),
                overdraft: 0,
            }))
        }
    }

    impl Versioned for Opened {
        const NAME: &'static str = "account-opened";
        const VERSION: u32 = 3;
    }

    #[derive(Debug)]
    struct Renamed;

    impl Versioned for Renamed {
        const NAME: &'static str = "renamed";
        const VERSION: u32 = 1;

        fn upgrade(&self) -> Option<Box<dyn VersionedValue>> {
            Some(Box::new(Opened {
                owner: String::new(),
                currency: String::new(),
                overdraft: 0,
            }))
        }
    }

    #[derive(Debug)]
    struct Downgrades;

    impl Versioned for Downgrades {
        const NAME: &'static str = "account-opened";
        const VERSION: u32 = 4;

        fn upgrade(&self) -> Option<Box<dyn VersionedValue>> {
            Some(Box::new(OpenedV2 {
                owner: String::new(),
                currency: String::new(),
            }))
        }
    }

    #[derive(Debug)]
    struct SameVersion;

    impl Versioned for SameVersion {
        const NAME: &'static str = "account-opened";
        const VERSION: u32 = 3;

        fn upgrade(&self) -> Option<Box<dyn VersionedValue>> {
            Some(Box::new(Opened {
                owner: String::new(),
                currency: String::new(),
                overdraft: 0,
            }))
        }
    }

    #[test]
    fn type_key_resolves_from_constants() {
        assert_eq!(
            TypeKey::of::<OpenedV2>(),
            TypeKey::new("account-opened", 2)
        );
        assert_eq!(TypeKey::of::<Opened>().to_string(), "account-opened@v3");
        assert!(TypeKey::of::<Opened>().is_versioned());
    }

    #[test]
    fn terminal_value_is_returned_unchanged() {
        let value: Arc<dyn VersionedValue> = Arc::new(Opened {
            owner: "ada".into(),
            currency: "GBP".into(),
            overdraft: 5,
        });
        let latest = upgrade_to_latest(Arc::clone(&value)).unwrap();
        assert!(Arc::ptr_eq(&value, &latest));
    }

    #[test]
    fn chain_resolves_to_latest_from_any_starting_point() {
        let from_v1 = upgrade_into::<Opened>(Arc::new(OpenedV1 {
            owner: "ada".into(),
        }))
        .unwrap();
        let from_v2 = upgrade_into::<Opened>(Arc::new(OpenedV2 {
            owner: "ada".into(),
            currency: "EUR".into(),
        }))
        .unwrap();

        assert_eq!(*from_v1, *from_v2);
        assert_eq!(from_v1.currency, "EUR");
    }

    #[test]
    fn name_change_is_a_type_upgrade_conflict() {
        let err = upgrade_to_latest(Arc::new(Renamed)).unwrap_err();
        assert_eq!(
            err,
            UpgradeError::NameChanged {
                from: TypeKey::new("renamed", 1),
                to: TypeKey::new("account-opened", 3),
            }
        );
        assert!(err.to_string().contains("keep the type name"));
    }

    #[test]
    fn lower_version_is_a_version_upgrade_conflict() {
        let err = upgrade_to_latest(Arc::new(Downgrades)).unwrap_err();
        assert!(matches!(err, UpgradeError::VersionNotIncreased { .. }));
    }

    #[test]
    fn same_version_is_a_version_upgrade_conflict() {
        let err = upgrade_to_latest(Arc::new(SameVersion)).unwrap_err();
        assert_eq!(
            err,
            UpgradeError::VersionNotIncreased {
                from: TypeKey::new("account-opened", 3),
                to: TypeKey::new("account-opened", 3),
            }
        );
    }

    #[test]
    fn upgrade_into_rejects_unexpected_latest_shape() {
        let err = upgrade_into::<OpenedV2>(Arc::new(OpenedV1 {
            owner: "ada".into(),
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::UnexpectedType { found, .. } if found == TypeKey::new("account-opened", 3)
        ));
    }

    #[test]
    fn dyn_downcast_helpers() {
        let value: Arc<dyn VersionedValue> = Arc::new(OpenedV1 {
            owner: "ada".into(),
        });
        assert!(value.is::<OpenedV1>());
        assert!(!value.is::<Opened>());
        assert_eq!(value.downcast_ref::<OpenedV1>().unwrap().owner, "ada");
        assert!(value.type_name().ends_with("OpenedV1"));
    }
}
