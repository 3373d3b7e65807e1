mod commit;
mod load;

use std::{fmt, future::Future, sync::Arc};

use serde::Deserialize;
use sqlx::PgPool;
use tokio_stream::StreamExt;
use vellum_core::{
    event::UncommittedEvent,
    identity::Identity,
    registry::TypeRegistry,
    store::{
        AggregateBatch, EventReader, EventStream, EventWriter, VersionRange, WriteError,
        plan_write,
    },
};

use crate::{Error, range_bound};

/// Write behaviour of [`Store`].
///
/// ```
/// use vellum_postgres::StoreOptions;
///
/// let options: StoreOptions = serde_json::from_str(r#"{"atomic_batches": false}"#).unwrap();
/// assert!(!options.atomic_batches);
/// assert!(StoreOptions::default().atomic_batches);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Write a batch spanning several aggregates in one transaction.
    ///
    /// When off, each aggregate is committed in its own transaction and a
    /// conflict on a later aggregate leaves the earlier ones written.
    pub atomic_batches: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            atomic_batches: true,
        }
    }
}

/// A PostgreSQL-backed event store.
///
/// Each aggregate has one row in `vellum_streams`, keyed by its kind and id,
/// holding its current version. Writes lock that row `FOR UPDATE`, check the
/// batch continues the stream exactly, append to `vellum_events` and advance
/// the version, all in one transaction. A batch spanning several aggregates
/// locks their rows in `(aggregate_kind, aggregate_id)` order. Dropping a
/// write future before it completes rolls the transaction back.
///
/// # Schema
///
/// Created by [`migrate()`](Self::migrate):
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS vellum_streams (
///     aggregate_kind TEXT NOT NULL,
///     aggregate_id   TEXT NOT NULL,
///     version        BIGINT NOT NULL,
///     PRIMARY KEY (aggregate_kind, aggregate_id)
/// );
/// CREATE TABLE IF NOT EXISTS vellum_events (
///     aggregate_kind    TEXT NOT NULL,
///     aggregate_id      TEXT NOT NULL,
///     aggregate_version BIGINT NOT NULL,
///     event_id          UUID NOT NULL,
///     event_name        TEXT NOT NULL,
///     event_version     BIGINT NOT NULL,
///     idempotency_id    TEXT NOT NULL,
///     correlation_id    TEXT NOT NULL,
///     occurred_at       TIMESTAMPTZ NOT NULL,
///     content           JSONB NOT NULL,
///     PRIMARY KEY (aggregate_kind, aggregate_id, aggregate_version)
/// );
/// ```
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
    registry: Arc<TypeRegistry>,
    options: StoreOptions,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("registered_types", &self.registry.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Construct a `PostgreSQL` event store with default options.
    #[must_use]
    pub fn new(pool: PgPool, registry: Arc<TypeRegistry>) -> Self {
        Self::with_options(pool, registry, StoreOptions::default())
    }

    #[must_use]
    pub fn with_options(pool: PgPool, registry: Arc<TypeRegistry>, options: StoreOptions) -> Self {
        Self {
            pool,
            registry,
            options,
        }
    }

    #[must_use]
    pub const fn options(&self) -> StoreOptions {
        self.options
    }

    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Apply the schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS vellum_streams (
                aggregate_kind TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                version        BIGINT NOT NULL,
                PRIMARY KEY (aggregate_kind, aggregate_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS vellum_events (
                aggregate_kind    TEXT NOT NULL,
                aggregate_id      TEXT NOT NULL,
                aggregate_version BIGINT NOT NULL,
                event_id          UUID NOT NULL,
                event_name        TEXT NOT NULL,
                event_version     BIGINT NOT NULL,
                idempotency_id    TEXT NOT NULL,
                correlation_id    TEXT NOT NULL,
                occurred_at       TIMESTAMPTZ NOT NULL,
                content           JSONB NOT NULL,
                PRIMARY KEY (aggregate_kind, aggregate_id, aggregate_version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS vellum_events_by_correlation
              ON vellum_events(correlation_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Current version of the `aggregate_kind` stream for `aggregate_id`,
    /// `0` if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the query fails.
    pub async fn stream_version(
        &self,
        aggregate_kind: &str,
        aggregate_id: &impl fmt::Display,
    ) -> Result<u64, Error> {
        let version: Option<i64> = sqlx::query_scalar(
            r"SELECT version FROM vellum_streams WHERE aggregate_kind = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_kind)
        .bind(aggregate_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        version.map_or(Ok(0), crate::from_db_version)
    }

    #[tracing::instrument(
        skip(self, events),
        fields(event_count = events.len(), atomic = self.options.atomic_batches)
    )]
    async fn append<Id: Identity>(
        &self,
        events: &[UncommittedEvent<Id>],
    ) -> Result<(), WriteError<Error>> {
        let mut plan = plan_write(events)?;
        if plan.is_empty() {
            return Ok(());
        }
        lock_order(&mut plan);

        let prepared = plan
            .iter()
            .map(|batch| self.prepare_rows(batch))
            .collect::<Result<Vec<_>, Error>>()
            .map_err(WriteError::Store)?;

        if self.options.atomic_batches || plan.len() == 1 {
            let mut tx = self.pool.begin().await.map_err(database)?;
            for (batch, rows) in plan.iter().zip(prepared) {
                Self::append_batch(&mut tx, batch, rows).await?;
            }
            tx.commit().await.map_err(database)?;
        } else {
            tracing::warn!(
                aggregates = plan.len(),
                "atomic batches disabled; committing each aggregate in its own transaction"
            );
            for (batch, rows) in plan.iter().zip(prepared) {
                let mut tx = self.pool.begin().await.map_err(database)?;
                Self::append_batch(&mut tx, batch, rows).await?;
                tx.commit().await.map_err(database)?;
            }
        }

        tracing::debug!(
            events_appended = events.len(),
            aggregates = plan.len(),
            "events written"
        );
        Ok(())
    }
}

/// Sort `plan` by `(aggregate_kind, aggregate_id)`, the order stream rows
/// are locked in. Two writers sharing aggregates then never wait on each
/// other in a cycle.
fn lock_order<Id: Identity>(plan: &mut [AggregateBatch<'_, Id>]) {
    plan.sort_by_cached_key(|batch| {
        (
            batch.aggregate_kind.to_owned(),
            batch.aggregate_id.to_string(),
        )
    });
}

fn database(error: sqlx::Error) -> WriteError<Error> {
    WriteError::Store(Error::Database(error))
}

impl<Id: Identity> EventWriter<Id> for Store {
    type Error = Error;

    fn write<'a>(
        &'a self,
        events: &'a [UncommittedEvent<Id>],
    ) -> impl Future<Output = Result<(), WriteError<Self::Error>>> + Send + 'a {
        self.append(events)
    }
}

impl<Id: Identity> EventReader<Id> for Store {
    type Error = Error;

    fn read<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Id,
        range: VersionRange,
    ) -> EventStream<'a, Id, Self::Error> {
        tracing::trace!(
            aggregate_kind,
            %aggregate_id,
            start = range.start,
            end = range.end,
            "reading events"
        );
        let rows = sqlx::query(
            r"
            SELECT aggregate_version, event_id, aggregate_kind, event_name, event_version,
                   idempotency_id, correlation_id, occurred_at, content
            FROM vellum_events
            WHERE aggregate_kind = $1
              AND aggregate_id = $2
              AND aggregate_version >= $3
              AND ($4 = 0 OR aggregate_version <= $4)
            ORDER BY aggregate_version ASC
            ",
        )
        .bind(aggregate_kind)
        .bind(aggregate_id.to_string())
        .bind(range_bound(range.start))
        .bind(range_bound(range.end))
        .fetch(&self.pool);

        Box::pin(rows.map(move |row| self.decode_row(aggregate_id, &row?)))
    }
}
