use std::sync::Arc;

use sqlx::{Row, postgres::PgRow};
use vellum_core::{
    event::{CommittedEvent, CorrelationId, EventData, EventId, EventMetadata, IdempotencyId},
    identity::Identity,
};

use super::Store;
use crate::{Error, from_db_version};

impl Store {
    /// Deserialise one `vellum_events` row of `aggregate_id`'s stream.
    ///
    /// The payload comes back in its stored shape; replay upgrades it.
    pub(in crate::store) fn decode_row<Id: Identity>(
        &self,
        aggregate_id: &Id,
        row: &PgRow,
    ) -> Result<CommittedEvent<Id>, Error> {
        let version: i64 = row.try_get("aggregate_version")?;
        let event_name: String = row.try_get("event_name")?;
        let event_version: i64 = row.try_get("event_version")?;
        let event_version =
            u32::try_from(event_version).map_err(|_| Error::InvalidVersion(event_version))?;
        let content: sqlx::types::Json<serde_json::Value> = row.try_get("content")?;

        let event: EventData =
            Arc::from(self.registry.decode(&event_name, event_version, content.0)?);
        let metadata = EventMetadata {
            event_id: EventId::from_uuid(row.try_get("event_id")?),
            idempotency_id: IdempotencyId::new(row.try_get::<String, _>("idempotency_id")?),
            correlation_id: CorrelationId::new(row.try_get::<String, _>("correlation_id")?),
            event_type: event.type_key(),
            aggregate_id: aggregate_id.clone(),
            aggregate_kind: row.try_get("aggregate_kind")?,
            aggregate_version: from_db_version(version)?,
            timestamp: row.try_get("occurred_at")?,
        };

        Ok(CommittedEvent::accepted(event, metadata))
    }
}
