//! The append-only event log contract.
//!
//! Stores implement [`EventWriter`] and [`EventReader`]. The write side is
//! the optimistic concurrency gate: a batch is accepted only if each
//! aggregate's events form a gapless run that starts right after the
//! aggregate's current version. [`plan_write`] and
//! [`AggregateBatch::check_current`] implement those checks so every backend
//! applies them identically.
use std::{fmt, future::Future, pin::Pin};

use futures_core::Stream;
use thiserror::Error;

use crate::{
    event::{CommittedEvent, UncommittedEvent},
    identity::Identity,
};

pub mod inmemory;

/// Ordered stream of committed events returned by [`EventReader::read`].
///
/// Dropping the stream stops the read; events already yielded stay valid.
pub type EventStream<'a, Id, E> =
    Pin<Box<dyn Stream<Item = Result<CommittedEvent<Id>, E>> + Send + 'a>>;

/// Inclusive range of aggregate versions. `0` leaves that side unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionRange {
    pub start: u64,
    pub end: u64,
}

impl VersionRange {
    /// Every version.
    #[must_use]
    pub const fn all() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Versions `start..=end`.
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Versions from `start` onwards.
    #[must_use]
    pub const fn starting_at(start: u64) -> Self {
        Self { start, end: 0 }
    }

    /// Versions up to and including `end`.
    #[must_use]
    pub const fn until(end: u64) -> Self {
        Self { start: 0, end }
    }

    #[must_use]
    pub const fn contains(&self, version: u64) -> bool {
        (self.start == 0 || version >= self.start) && (self.end == 0 || version <= self.end)
    }
}

/// A batch in which some aggregate's versions are not a gapless ascending
/// run starting at 1 or above.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "invalid event sequence for {aggregate_kind} `{aggregate_id}`: versions {versions:?} must be \
     a gapless ascending run starting at 1 or above"
)]
pub struct InvalidEventSequence {
    pub aggregate_kind: String,
    pub aggregate_id: String,
    /// The offending versions, sorted.
    pub versions: Vec<u64>,
}

/// Another writer advanced the aggregate since it was loaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.aggregate_kind, .aggregate_id, .expected, .actual))]
pub struct ConcurrencyConflict {
    pub aggregate_kind: String,
    pub aggregate_id: String,
    /// The current version the writer assumed (its first version minus 1).
    pub expected: u64,
    /// The current version in the store.
    pub actual: u64,
}

fn format_conflict(
    aggregate_kind: &str,
    aggregate_id: &str,
    expected: &u64,
    actual: &u64,
) -> String {
    if *expected == 0 {
        format!(
            "out of sync: expected new {aggregate_kind} `{aggregate_id}`, found version {actual} \
             (hint: another process created this aggregate; reload and retry)"
        )
    } else {
        format!(
            "out of sync: expected {aggregate_kind} `{aggregate_id}` at version {expected}, found \
             {actual} (hint: stream was modified; reload and retry)"
        )
    }
}

/// Rejection from [`EventWriter::write`].
///
/// Nothing from the batch is persisted when this is returned, except when a
/// backend has explicitly been configured for non-atomic multi-aggregate
/// writes (see that backend's documentation).
#[derive(Debug, Error)]
pub enum WriteError<E> {
    #[error(transparent)]
    InvalidEventSequence(#[from] InvalidEventSequence),
    #[error(transparent)]
    OutOfSync(#[from] ConcurrencyConflict),
    #[error("store error: {0}")]
    Store(#[source] E),
}

impl<E> WriteError<E> {
    pub const fn store(err: E) -> Self {
        Self::Store(err)
    }

    #[must_use]
    pub const fn is_out_of_sync(&self) -> bool {
        matches!(self, Self::OutOfSync(_))
    }

    /// Convert the store error type, keeping the contract variants.
    pub fn map_store<F>(self, f: impl FnOnce(E) -> F) -> WriteError<F> {
        match self {
            Self::InvalidEventSequence(e) => WriteError::InvalidEventSequence(e),
            Self::OutOfSync(e) => WriteError::OutOfSync(e),
            Self::Store(e) => WriteError::Store(f(e)),
        }
    }
}

/// Write side of an event store.
pub trait EventWriter<Id: Identity>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append a batch of events, possibly spanning several aggregates.
    ///
    /// Implementations must validate the batch with [`plan_write`] and check
    /// each aggregate with [`AggregateBatch::check_current`] before appending
    /// anything. An empty batch succeeds without effect.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::InvalidEventSequence`] for a malformed batch,
    /// [`WriteError::OutOfSync`] when an aggregate moved on, or
    /// [`WriteError::Store`] for backend failures.
    fn write<'a>(
        &'a self,
        events: &'a [UncommittedEvent<Id>],
    ) -> impl Future<Output = Result<(), WriteError<Self::Error>>> + Send + 'a;
}

/// Read side of an event store.
pub trait EventReader<Id: Identity>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stream the events of `aggregate_kind`/`aggregate_id` within `range`,
    /// ascending by version.
    ///
    /// Identities are scoped by kind: the same id under two kinds names two
    /// unrelated streams.
    fn read<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Id,
        range: VersionRange,
    ) -> EventStream<'a, Id, Self::Error>;
}

/// One aggregate's share of a write batch, sorted by version.
pub struct AggregateBatch<'a, Id> {
    pub aggregate_kind: &'a str,
    pub aggregate_id: &'a Id,
    pub events: Vec<&'a UncommittedEvent<Id>>,
}

impl<Id> AggregateBatch<'_, Id> {
    #[must_use]
    pub fn first_version(&self) -> u64 {
        self.events.first().map_or(0, |e| e.version())
    }

    #[must_use]
    pub fn last_version(&self) -> u64 {
        self.events.last().map_or(0, |e| e.version())
    }

    /// Check the batch continues directly from `current`, the highest
    /// version stored for this aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyConflict`] unless the first version is
    /// `current + 1`.
    pub fn check_current(&self, current: u64) -> Result<(), ConcurrencyConflict>
    where
        Id: fmt::Display,
    {
        let first = self.first_version();
        if first == current + 1 {
            Ok(())
        } else {
            Err(ConcurrencyConflict {
                aggregate_kind: self.aggregate_kind.to_string(),
                aggregate_id: self.aggregate_id.to_string(),
                expected: first.saturating_sub(1),
                actual: current,
            })
        }
    }
}

impl<Id: fmt::Debug> fmt::Debug for AggregateBatch<'_, Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateBatch")
            .field("aggregate_kind", &self.aggregate_kind)
            .field("aggregate_id", self.aggregate_id)
            .field("first_version", &self.first_version())
            .field("last_version", &self.last_version())
            .finish()
    }
}

/// Group a write batch by aggregate and validate each group's versions.
///
/// An aggregate is identified by its `(aggregate_kind, aggregate_id)` pair.
/// Groups come back in the order their aggregates first appear in `events`,
/// each sorted by version.
///
/// # Errors
///
/// Returns [`InvalidEventSequence`] for the first group that is not a gapless
/// ascending run with no version below 1. The whole batch must then be
/// rejected.
pub fn plan_write<Id: Identity>(
    events: &[UncommittedEvent<Id>],
) -> Result<Vec<AggregateBatch<'_, Id>>, InvalidEventSequence> {
    let mut batches: Vec<AggregateBatch<'_, Id>> = Vec::new();
    for event in events {
        let kind = event.metadata.aggregate_kind.as_str();
        let id = &event.metadata.aggregate_id;
        match batches
            .iter_mut()
            .find(|b| b.aggregate_kind == kind && b.aggregate_id == id)
        {
            Some(batch) => batch.events.push(event),
            None => batches.push(AggregateBatch {
                aggregate_kind: kind,
                aggregate_id: id,
                events: vec![event],
            }),
        }
    }

    for batch in &mut batches {
        batch.events.sort_by_key(|e| e.version());
        let gapless = batch
            .events
            .windows(2)
            .all(|pair| pair[1].version() == pair[0].version() + 1);
        if batch.first_version() < 1 || !gapless {
            let versions = batch.events.iter().map(|e| e.version()).collect();
            tracing::debug!(
                aggregate_kind = batch.aggregate_kind,
                aggregate_id = %batch.aggregate_id,
                ?versions,
                "rejecting invalid event sequence"
            );
            return Err(InvalidEventSequence {
                aggregate_kind: batch.aggregate_kind.to_string(),
                aggregate_id: batch.aggregate_id.to_string(),
                versions,
            });
        }
    }

    Ok(batches)
}
