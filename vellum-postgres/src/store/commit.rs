use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use vellum_core::{
    identity::Identity,
    store::{AggregateBatch, ConcurrencyConflict, WriteError},
};

use super::Store;
use crate::{Error, from_db_version, to_db_version};

/// One `vellum_events` row, encoded and ready to insert.
pub(in crate::store) struct EventRow {
    aggregate_version: i64,
    event_id: uuid::Uuid,
    event_name: &'static str,
    event_version: i64,
    idempotency_id: String,
    correlation_id: String,
    occurred_at: DateTime<Utc>,
    content: serde_json::Value,
}

impl Store {
    /// Encode every event of `batch` through the registry.
    pub(in crate::store) fn prepare_rows<Id: Identity>(
        &self,
        batch: &AggregateBatch<'_, Id>,
    ) -> Result<Vec<EventRow>, Error> {
        batch
            .events
            .iter()
            .map(|event| {
                let (key, content) = self.registry.encode(event.event.as_ref())?;
                let metadata = &event.metadata;
                Ok(EventRow {
                    aggregate_version: to_db_version(metadata.aggregate_version)?,
                    event_id: *metadata.event_id.as_uuid(),
                    event_name: key.name,
                    event_version: i64::from(key.version),
                    idempotency_id: metadata.idempotency_id.as_str().to_owned(),
                    correlation_id: metadata.correlation_id.as_str().to_owned(),
                    occurred_at: metadata.timestamp,
                    content,
                })
            })
            .collect()
    }

    /// Ensure the stream row exists, then lock it and return its version.
    ///
    /// Must be called inside an open transaction; the lock is held until the
    /// transaction ends.
    async fn lock_stream(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> Result<u64, Error> {
        sqlx::query(
            r"
                INSERT INTO vellum_streams (aggregate_kind, aggregate_id, version)
                VALUES ($1, $2, 0)
                ON CONFLICT (aggregate_kind, aggregate_id) DO NOTHING
                ",
        )
        .bind(aggregate_kind)
        .bind(aggregate_id)
        .execute(&mut **tx)
        .await?;

        let version: i64 = sqlx::query_scalar(
            r"
                SELECT version FROM vellum_streams
                WHERE aggregate_kind = $1 AND aggregate_id = $2
                FOR UPDATE
                ",
        )
        .bind(aggregate_kind)
        .bind(aggregate_id)
        .fetch_one(&mut **tx)
        .await?;

        from_db_version(version)
    }

    /// Check `batch` against the locked stream, bulk-insert its rows and
    /// advance the stream version.
    pub(in crate::store) async fn append_batch<Id: Identity>(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        batch: &AggregateBatch<'_, Id>,
        rows: Vec<EventRow>,
    ) -> Result<(), WriteError<Error>> {
        let aggregate_kind = batch.aggregate_kind;
        let aggregate_id = batch.aggregate_id.to_string();

        let current = Self::lock_stream(tx, aggregate_kind, &aggregate_id)
            .await
            .map_err(WriteError::Store)?;
        batch.check_current(current).inspect_err(|conflict| {
            tracing::debug!(
                aggregate_kind,
                aggregate_id = %batch.aggregate_id,
                expected = conflict.expected,
                actual = conflict.actual,
                "version mismatch, rejecting write"
            );
        })?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO vellum_events (aggregate_kind, aggregate_id, aggregate_version, event_id, \
             event_name, event_version, idempotency_id, correlation_id, occurred_at, content) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(aggregate_kind);
            b.push_bind(aggregate_id.as_str());
            b.push_bind(row.aggregate_version);
            b.push_bind(row.event_id);
            b.push_bind(row.event_name);
            b.push_bind(row.event_version);
            b.push_bind(row.idempotency_id);
            b.push_bind(row.correlation_id);
            b.push_bind(row.occurred_at);
            b.push_bind(sqlx::types::Json(row.content));
        });
        qb.build()
            .execute(&mut **tx)
            .await
            .map_err(|error| insert_error(batch, current, error))?;

        sqlx::query(
            r"
                UPDATE vellum_streams SET version = $1
                WHERE aggregate_kind = $2 AND aggregate_id = $3
                ",
        )
        .bind(to_db_version(batch.last_version()).map_err(WriteError::Store)?)
        .bind(aggregate_kind)
        .bind(aggregate_id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|error| WriteError::Store(Error::Database(error)))?;

        Ok(())
    }
}

/// A duplicate `(aggregate_kind, aggregate_id, aggregate_version)` means the log moved on
/// without the stream row; report it as out of sync.
fn insert_error<Id: Identity>(
    batch: &AggregateBatch<'_, Id>,
    current: u64,
    error: sqlx::Error,
) -> WriteError<Error> {
    let duplicate = matches!(&error, sqlx::Error::Database(db) if db.is_unique_violation());
    if duplicate {
        tracing::debug!(
            aggregate_kind = batch.aggregate_kind,
            aggregate_id = %batch.aggregate_id,
            "duplicate event version"
        );
        WriteError::OutOfSync(ConcurrencyConflict {
            aggregate_kind: batch.aggregate_kind.to_string(),
            aggregate_id: batch.aggregate_id.to_string(),
            expected: batch.first_version().saturating_sub(1),
            actual: current,
        })
    } else {
        WriteError::Store(Error::Database(error))
    }
}
