//! PostgreSQL-backed stores for vellum.
//!
//! This crate provides `PostgreSQL` implementations of the core store
//! contracts:
//!
//! - [`Store`] - [`EventWriter`](vellum_core::store::EventWriter) and
//!   [`EventReader`](vellum_core::store::EventReader) over `vellum_events`
//! - [`snapshot::Store`] - [`SnapshotReader`](vellum_core::snapshot::SnapshotReader)
//!   and [`SnapshotWriter`](vellum_core::snapshot::SnapshotWriter) over
//!   `vellum_snapshots`
//!
//! Both decode payloads through a shared
//! [`TypeRegistry`](vellum_core::registry::TypeRegistry), so every event and
//! snapshot type that may be read back (including historical shapes) must be
//! registered. The two stores can share one connection pool.

mod error;
pub mod snapshot;
mod store;

pub use error::Error;
pub use store::{Store, StoreOptions};

/// Convert a log version into its `BIGINT` column value.
pub(crate) fn to_db_version(version: u64) -> Result<i64, Error> {
    i64::try_from(version).map_err(|_| Error::VersionOverflow(version))
}

/// Convert a stored `BIGINT` back into a log version.
pub(crate) fn from_db_version(value: i64) -> Result<u64, Error> {
    u64::try_from(value).map_err(|_| Error::InvalidVersion(value))
}

/// Query bound for an optional upper or lower version limit; `0` stays `0`.
pub(crate) fn range_bound(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}
