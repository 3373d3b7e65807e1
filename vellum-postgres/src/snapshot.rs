//! PostgreSQL-backed snapshot store implementation.
//!
//! This module provides [`Store`], an implementation of
//! [`SnapshotReader`] and [`SnapshotWriter`] for `PostgreSQL`. When to take
//! a snapshot is decided by the repository's
//! [`SnapshotPolicy`](vellum_core::snapshot::SnapshotPolicy), not here.

use std::{fmt, future::Future, sync::Arc};

use sqlx::{PgPool, Row, postgres::PgRow};
use vellum_core::{
    identity::Identity,
    registry::TypeRegistry,
    snapshot::{Snapshot, SnapshotReader, SnapshotWriter},
};

use crate::{Error, from_db_version, range_bound, to_db_version};

/// A PostgreSQL-backed snapshot store.
///
/// Snapshots live in a dedicated table (`vellum_snapshots`), keyed by
/// aggregate kind, aggregate id and version, in the same database as the event store. Older
/// snapshots are kept so that a bounded read can find the newest one at or
/// below a given version.
///
/// # Schema
///
/// The store uses the following table schema (created by [`migrate()`](Self::migrate)):
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS vellum_snapshots (
///     aggregate_kind TEXT NOT NULL,
///     aggregate_id   TEXT NOT NULL,
///     version        BIGINT NOT NULL,
///     state_name     TEXT NOT NULL,
///     state_version  BIGINT NOT NULL,
///     content        JSONB NOT NULL,
///     created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
///     PRIMARY KEY (aggregate_kind, aggregate_id, version)
/// )
/// ```
///
/// # Example
///
/// ```ignore
/// use vellum::{Repository, snapshot::SnapshotPolicy, store::postgres};
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let registry = Arc::new(TypeRegistry::builder().register::<Opened>().build()?);
/// let events = postgres::Store::new(pool.clone(), Arc::clone(&registry));
/// let snapshots = vellum::snapshot::postgres::Store::new(pool, registry);
///
/// events.migrate().await?;
/// snapshots.migrate().await?;
///
/// let repo = Repository::new(events).with_snapshots(snapshots, SnapshotPolicy::EveryNEvents(100));
/// ```
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    registry: Arc<TypeRegistry>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("registered_types", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool, registry: Arc<TypeRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Apply the snapshot schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup alongside the event store migrations.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the schema creation query fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS vellum_snapshots (
                aggregate_kind TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                version        BIGINT NOT NULL,
                state_name     TEXT NOT NULL,
                state_version  BIGINT NOT NULL,
                content        JSONB NOT NULL,
                created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (aggregate_kind, aggregate_id, version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self, aggregate_id), fields(aggregate_id = %aggregate_id))]
    async fn fetch<Id: Identity>(
        &self,
        aggregate_kind: &str,
        aggregate_id: &Id,
        max_version: u64,
    ) -> Result<Option<Snapshot<Id>>, Error> {
        let row = sqlx::query(
            r"
            SELECT version, aggregate_kind, state_name, state_version, content
            FROM vellum_snapshots
            WHERE aggregate_kind = $1 AND aggregate_id = $2 AND ($3 = 0 OR version <= $3)
            ORDER BY version DESC
            LIMIT 1
            ",
        )
        .bind(aggregate_kind)
        .bind(aggregate_id.to_string())
        .bind(range_bound(max_version))
        .fetch_optional(&self.pool)
        .await?;

        let snapshot = row
            .map(|row| self.decode_row(aggregate_id, &row))
            .transpose()?;
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    fn decode_row<Id: Identity>(
        &self,
        aggregate_id: &Id,
        row: &PgRow,
    ) -> Result<Snapshot<Id>, Error> {
        let version: i64 = row.try_get("version")?;
        let state_name: String = row.try_get("state_name")?;
        let state_version: i64 = row.try_get("state_version")?;
        let state_version =
            u32::try_from(state_version).map_err(|_| Error::InvalidVersion(state_version))?;
        let content: sqlx::types::Json<serde_json::Value> = row.try_get("content")?;

        Ok(Snapshot {
            aggregate_id: aggregate_id.clone(),
            aggregate_kind: row.try_get("aggregate_kind")?,
            version: from_db_version(version)?,
            state: Arc::from(self.registry.decode(&state_name, state_version, content.0)?),
        })
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(
            aggregate_kind = %snapshot.aggregate_kind,
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version
        )
    )]
    async fn store<Id: Identity>(&self, snapshot: Snapshot<Id>) -> Result<(), Error> {
        let (key, content) = self.registry.encode(snapshot.state.as_ref())?;

        sqlx::query(
            r"
            INSERT INTO vellum_snapshots
                (aggregate_kind, aggregate_id, version, state_name, state_version, content)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (aggregate_kind, aggregate_id, version)
            DO UPDATE SET state_name = EXCLUDED.state_name,
                          state_version = EXCLUDED.state_version,
                          content = EXCLUDED.content,
                          created_at = now()
            ",
        )
        .bind(&snapshot.aggregate_kind)
        .bind(snapshot.aggregate_id.to_string())
        .bind(to_db_version(snapshot.version)?)
        .bind(key.name)
        .bind(i64::from(key.version))
        .bind(sqlx::types::Json(content))
        .execute(&self.pool)
        .await?;

        tracing::debug!(state = %key, "snapshot stored");
        Ok(())
    }
}

impl<Id: Identity> SnapshotReader<Id> for Store {
    type Error = Error;

    fn read<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Id,
        max_version: u64,
    ) -> impl Future<Output = Result<Option<Snapshot<Id>>, Self::Error>> + Send + 'a {
        self.fetch(aggregate_kind, aggregate_id, max_version)
    }
}

impl<Id: Identity> SnapshotWriter<Id> for Store {
    type Error = Error;

    fn write(
        &self,
        snapshot: Snapshot<Id>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        self.store(snapshot)
    }
}
