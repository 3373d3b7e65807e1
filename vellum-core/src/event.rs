//! Events and their metadata envelope.
//!
//! Application events are plain [`Versioned`] structs. Once emitted, each one
//! travels with an [`EventMetadata`] envelope describing where it sits in its
//! aggregate's log. Until a store accepts it the pair is an
//! [`UncommittedEvent`]; stores hand it back as a [`CommittedEvent`].

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::versioned::{TypeKey, Versioned, VersionedValue};

/// Type-erased event payload shared between the pending buffer, stores and
/// readers.
pub type EventData = Arc<dyn VersionedValue>;

const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_4c2e_9a57_4b8e_b3f0_2c1d_8e7a_5f90);

/// Caller-supplied deduplication key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyId(String);

/// Opaque causal key threaded through related events.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// A fresh random value.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $ty {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(IdempotencyId);
string_id!(CorrelationId);

/// Identifier of one event, unique per `(aggregate id, version)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Derive the id for the event occupying `version` in `aggregate_id`'s
    /// log.
    ///
    /// Derivation is deterministic: re-emitting the same position yields the
    /// same id.
    #[must_use]
    pub fn derive(aggregate_id: &impl fmt::Display, version: u64) -> Self {
        let name = format!("{aggregate_id}/{version}");
        Self(Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes()))
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Envelope around an emitted event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventMetadata<Id> {
    pub event_id: EventId,
    pub idempotency_id: IdempotencyId,
    pub correlation_id: CorrelationId,
    /// `(name, version)` of the payload as it was emitted.
    pub event_type: TypeKey,
    pub aggregate_id: Id,
    pub aggregate_kind: String,
    /// 1-based position of the event in its aggregate's log.
    pub aggregate_version: u64,
    pub timestamp: DateTime<Utc>,
}

/// An emitted event that no store has accepted yet.
#[derive(Clone, Debug)]
pub struct UncommittedEvent<Id> {
    pub event: EventData,
    pub metadata: EventMetadata<Id>,
}

impl<Id> UncommittedEvent<Id> {
    #[must_use]
    pub fn downcast_ref<E: Versioned>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.metadata.aggregate_version
    }
}

/// An event that is part of the durable, ordered log.
///
/// Only stores construct these, via [`CommittedEvent::accepted`].
#[derive(Clone, Debug)]
pub struct CommittedEvent<Id> {
    event: EventData,
    metadata: EventMetadata<Id>,
}

impl<Id> CommittedEvent<Id> {
    /// Mark an event as accepted into the log.
    ///
    /// Call this from store implementations only, after the event is
    /// durable (or when reading it back).
    #[must_use]
    pub fn accepted(event: EventData, metadata: EventMetadata<Id>) -> Self {
        Self { event, metadata }
    }

    #[must_use]
    pub fn event(&self) -> &EventData {
        &self.event
    }

    #[must_use]
    pub const fn metadata(&self) -> &EventMetadata<Id> {
        &self.metadata
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.metadata.aggregate_version
    }

    #[must_use]
    pub fn downcast_ref<E: Versioned>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }

    #[must_use]
    pub fn into_parts(self) -> (EventData, EventMetadata<Id>) {
        (self.event, self.metadata)
    }
}

impl<Id> From<UncommittedEvent<Id>> for CommittedEvent<Id> {
    fn from(event: UncommittedEvent<Id>) -> Self {
        Self::accepted(event.event, event.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_are_deterministic_per_position() {
        let a = EventId::derive(&"acct-1", 3);
        let b = EventId::derive(&"acct-1", 3);
        assert_eq!(a, b);
        assert_ne!(a, EventId::derive(&"acct-1", 4));
        assert_ne!(a, EventId::derive(&"acct-2", 3));
    }

    #[test]
    fn generated_string_ids_are_unique_uuids() {
        let a = IdempotencyId::generate();
        let b = IdempotencyId::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
        assert!(Uuid::parse_str(CorrelationId::generate().as_str()).is_ok());
    }

    #[test]
    fn string_ids_convert_from_str() {
        let id: IdempotencyId = "cmd-42".into();
        assert_eq!(id.to_string(), "cmd-42");
        assert_eq!(id, IdempotencyId::new("cmd-42"));
    }
}
