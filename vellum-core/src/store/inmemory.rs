//! In-memory event store for tests and examples.
//!
//! [`Store`] keeps one vector of committed events per aggregate stream,
//! keyed by `(aggregate_kind, aggregate_id)`. Writes spanning several
//! aggregates are validated up front and appended under a single write lock,
//! so they are all-or-nothing.
//!
//! ```
//! use vellum_core::store::inmemory;
//!
//! let store: inmemory::Store<String> = inmemory::Store::new();
//! assert_eq!(store.stream_version("account", &"acct-1".to_string()), 0);
//! ```

use std::{
    collections::HashMap,
    convert::Infallible,
    fmt,
    future::Future,
    sync::{Arc, RwLock},
};

use crate::{
    event::{CommittedEvent, UncommittedEvent},
    identity::Identity,
    store::{EventReader, EventStream, EventWriter, VersionRange, WriteError, plan_write},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StreamKey<Id> {
    aggregate_kind: String,
    aggregate_id: Id,
}

impl<Id> StreamKey<Id> {
    fn new(aggregate_kind: impl Into<String>, aggregate_id: Id) -> Self {
        Self {
            aggregate_kind: aggregate_kind.into(),
            aggregate_id,
        }
    }
}

type Streams<Id> = HashMap<StreamKey<Id>, Vec<CommittedEvent<Id>>>;

/// In-memory event store.
///
/// Cloning is cheap and clones share the same log.
#[derive(Clone)]
pub struct Store<Id> {
    streams: Arc<RwLock<Streams<Id>>>,
}

impl<Id> Store<Id> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<Id> Default for Store<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> fmt::Debug for Store<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let streams = self.streams.read().expect("in-memory store lock poisoned");
        f.debug_struct("Store")
            .field("streams", &streams.len())
            .field("events", &streams.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl<Id: Identity> Store<Id> {
    /// Highest stored version of `aggregate_kind`/`aggregate_id`; `0` if it
    /// has no events.
    #[must_use]
    pub fn stream_version(&self, aggregate_kind: &str, aggregate_id: &Id) -> u64 {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let streams = self.streams.read().expect("in-memory store lock poisoned");
        current_version(&streams, &key)
    }

    /// Number of events across every aggregate.
    #[must_use]
    pub fn len(&self) -> usize {
        let streams = self.streams.read().expect("in-memory store lock poisoned");
        streams.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, events: &[UncommittedEvent<Id>]) -> Result<usize, WriteError<Infallible>> {
        let plan = plan_write(events)?;
        let keys: Vec<StreamKey<Id>> = plan
            .iter()
            .map(|batch| StreamKey::new(batch.aggregate_kind, batch.aggregate_id.clone()))
            .collect();
        let mut streams = self.streams.write().expect("in-memory store lock poisoned");

        for (batch, key) in plan.iter().zip(&keys) {
            batch
                .check_current(current_version(&streams, key))
                .inspect_err(|conflict| {
                    tracing::debug!(
                        aggregate_kind = batch.aggregate_kind,
                        aggregate_id = %batch.aggregate_id,
                        expected = conflict.expected,
                        actual = conflict.actual,
                        "version mismatch, rejecting write"
                    );
                })?;
        }

        for (batch, key) in plan.into_iter().zip(keys) {
            streams
                .entry(key)
                .or_default()
                .extend(batch.events.into_iter().cloned().map(CommittedEvent::from));
        }
        Ok(events.len())
    }
}

fn current_version<Id: Identity>(streams: &Streams<Id>, key: &StreamKey<Id>) -> u64 {
    streams
        .get(key)
        .and_then(|s| s.last())
        .map_or(0, CommittedEvent::version)
}

impl<Id: Identity> EventWriter<Id> for Store<Id> {
    type Error = Infallible;

    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    fn write<'a>(
        &'a self,
        events: &'a [UncommittedEvent<Id>],
    ) -> impl Future<Output = Result<(), WriteError<Self::Error>>> + Send + 'a {
        let result = self.append(events).map(|appended| {
            tracing::debug!(events_appended = appended, "events written");
        });
        std::future::ready(result)
    }
}

impl<Id: Identity> EventReader<Id> for Store<Id> {
    type Error = Infallible;

    fn read<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Id,
        range: VersionRange,
    ) -> EventStream<'a, Id, Self::Error> {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let events: Vec<_> = {
            let streams = self.streams.read().expect("in-memory store lock poisoned");
            streams
                .get(&key)
                .map(|stream| {
                    stream
                        .iter()
                        .filter(|e| range.contains(e.version()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        tracing::trace!(
            aggregate_kind,
            %aggregate_id,
            ?range,
            events_loaded = events.len(),
            "read events"
        );
        Box::pin(tokio_stream::iter(events.into_iter().map(Ok)))
    }
}
