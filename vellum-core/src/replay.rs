//! Rebuilding aggregates from their event log.
//!
//! Every stored event is upgraded to its latest shape before it is applied,
//! so state types only ever see current event types. Replay checks that
//! versions continue without gaps and treats an empty log as "no such
//! aggregate" rather than as a fresh one.

use std::convert::Infallible;

use thiserror::Error;
use tokio_stream::StreamExt;

use crate::{
    aggregate::{AggregateRoot, AggregateState},
    event::CommittedEvent,
    store::{EventReader, VersionRange},
    versioned::{UpgradeError, upgrade_to_latest},
};

/// Error returned when loading an aggregate.
///
/// `R` is the event reader's error type, `S` the snapshot reader's.
#[derive(Debug, Error)]
pub enum LoadError<R, S = Infallible> {
    #[error("failed to read events: {0}")]
    Read(#[source] R),
    #[error("failed to read snapshot: {0}")]
    Snapshot(#[source] S),
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
    #[error(
        "event log for `{aggregate_id}` is out of order: expected version {expected}, found \
         {found}"
    )]
    OutOfOrder {
        aggregate_id: String,
        expected: u64,
        found: u64,
    },
}

/// State and version accumulated while folding a log.
pub(crate) struct Replay<S> {
    pub(crate) state: S,
    pub(crate) version: u64,
    pub(crate) applied: usize,
}

impl<S: AggregateState> Replay<S> {
    pub(crate) fn new(state: S, version: u64) -> Self {
        Self {
            state,
            version,
            applied: 0,
        }
    }

    /// Upgrade `event` and fold it into the state.
    pub(crate) fn apply<R, SE>(
        &mut self,
        aggregate_id: &S::Id,
        event: &CommittedEvent<S::Id>,
    ) -> Result<(), LoadError<R, SE>> {
        let expected = self.version + 1;
        if event.version() != expected {
            return Err(LoadError::OutOfOrder {
                aggregate_id: aggregate_id.to_string(),
                expected,
                found: event.version(),
            });
        }
        let latest = upgrade_to_latest(std::sync::Arc::clone(event.event()))?;
        S::dispatch_table().apply(&mut self.state, &*latest);
        self.version = expected;
        self.applied += 1;
        Ok(())
    }

    /// Fold every event `reader` yields for `aggregate_id` within `range`.
    pub(crate) async fn read<R, SE>(
        mut self,
        reader: &R,
        aggregate_id: &S::Id,
        range: VersionRange,
    ) -> Result<Self, LoadError<R::Error, SE>>
    where
        R: EventReader<S::Id>,
    {
        let mut stream = reader.read(S::KIND, aggregate_id, range);
        while let Some(event) = stream.next().await {
            let event = event.map_err(LoadError::Read)?;
            self.apply::<R::Error, SE>(aggregate_id, &event)?;
        }
        Ok(self)
    }

    pub(crate) fn into_root(self, aggregate_id: S::Id) -> AggregateRoot<S> {
        AggregateRoot::from_parts(aggregate_id, self.version, self.state)
    }
}

impl<S: AggregateState> AggregateRoot<S> {
    /// Rebuild an aggregate from its full event log.
    ///
    /// Returns `Ok(None)` if the log is empty.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Read`] if the reader fails,
    /// [`LoadError::Upgrade`] if an event's upgrade chain is broken, or
    /// [`LoadError::OutOfOrder`] if versions do not continue without gaps.
    pub async fn load<R>(reader: &R, id: S::Id) -> Result<Option<Self>, LoadError<R::Error>>
    where
        R: EventReader<S::Id>,
    {
        Self::load_until(reader, id, 0).await
    }

    /// Rebuild an aggregate as of `version` (`0` for the latest).
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    #[tracing::instrument(skip(reader), fields(aggregate_kind = S::KIND))]
    pub async fn load_until<R>(
        reader: &R,
        id: S::Id,
        version: u64,
    ) -> Result<Option<Self>, LoadError<R::Error>>
    where
        R: EventReader<S::Id>,
    {
        let replay = Replay::new(S::default(), 0)
            .read::<_, Infallible>(reader, &id, VersionRange::until(version))
            .await?;
        tracing::trace!(
            events_applied = replay.applied,
            version = replay.version,
            "aggregate replayed"
        );
        if replay.applied == 0 {
            return Ok(None);
        }
        Ok(Some(replay.into_root(id)))
    }

    /// Rebuild an aggregate from events already in memory.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Upgrade`] or [`LoadError::OutOfOrder`].
    pub fn from_events<I>(id: S::Id, events: I) -> Result<Option<Self>, LoadError<Infallible>>
    where
        I: IntoIterator<Item = CommittedEvent<S::Id>>,
    {
        let mut replay = Replay::new(S::default(), 0);
        for event in events {
            replay.apply::<Infallible, Infallible>(&id, &event)?;
        }
        if replay.applied == 0 {
            return Ok(None);
        }
        Ok(Some(replay.into_root(id)))
    }
}
