//! Snapshots: cached state at a known version.
//!
//! Loading from a snapshot restores the cached state and replays only the
//! events recorded after it, which bounds replay cost for long-lived
//! aggregates. Snapshot payloads are [`Versioned`] like events and go through
//! the same upgrade chain before they are restored.
//!
//! - [`SnapshotState`] - how a state type produces and consumes snapshots
//! - [`SnapshotReader`] / [`SnapshotWriter`] - persistence contract
//! - [`SnapshotPolicy`] - when the repository takes snapshots
//! - [`NoSnapshots`] - no-op store
//! - [`inmemory`] - in-memory reference store

use std::{convert::Infallible, future::Future, sync::Arc};

use serde::Deserialize;

use crate::{
    aggregate::{AggregateRoot, AggregateState},
    identity::Identity,
    replay::{LoadError, Replay},
    store::{EventReader, VersionRange},
    versioned::{Versioned, VersionedValue, upgrade_into},
};

pub mod inmemory;

/// Aggregate state captured at `version`.
#[derive(Clone, Debug)]
pub struct Snapshot<Id> {
    pub aggregate_id: Id,
    pub aggregate_kind: String,
    pub version: u64,
    pub state: Arc<dyn VersionedValue>,
}

/// State types that can be snapshotted.
///
/// The snapshot payload is usually a plain serialisable copy of the state;
/// using the state type itself (`type Snapshot = Self`) is fine when it is
/// `Versioned`.
pub trait SnapshotState: AggregateState {
    type Snapshot: Versioned;

    fn to_snapshot(&self) -> Self::Snapshot;

    /// Load `snapshot` into a freshly defaulted state.
    fn restore(&mut self, snapshot: &Self::Snapshot);
}

/// Read side of a snapshot store.
pub trait SnapshotReader<Id: Identity>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The newest snapshot of `aggregate_kind`/`aggregate_id` at or below
    /// `max_version` (`0` for the newest overall).
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the lookup fails.
    fn read<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Id,
        max_version: u64,
    ) -> impl Future<Output = Result<Option<Snapshot<Id>>, Self::Error>> + Send + 'a;
}

/// Write side of a snapshot store.
pub trait SnapshotWriter<Id: Identity>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist `snapshot`, replacing any snapshot at the same version.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when persistence fails.
    fn write(
        &self,
        snapshot: Snapshot<Id>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// When to take a snapshot after a commit.
///
/// ```
/// use vellum_core::snapshot::SnapshotPolicy;
///
/// let policy: SnapshotPolicy = serde_json::from_str(r#"{"every_n_events": 50}"#).unwrap();
/// assert!(policy.should_snapshot(48, 51));
/// assert!(!policy.should_snapshot(51, 60));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// After every commit that wrote events.
    Always,
    /// Whenever a commit crosses a multiple of `n` versions.
    EveryNEvents(u64),
    #[default]
    Never,
}

impl SnapshotPolicy {
    /// Whether a commit moving the aggregate from `previous` to `current`
    /// should produce a snapshot.
    #[must_use]
    pub const fn should_snapshot(&self, previous: u64, current: u64) -> bool {
        if current <= previous {
            return false;
        }
        match self {
            Self::Always => true,
            Self::EveryNEvents(0) | Self::Never => false,
            Self::EveryNEvents(n) => current / *n > previous / *n,
        }
    }
}

/// Snapshot store that stores nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSnapshots;

impl<Id: Identity> SnapshotReader<Id> for NoSnapshots {
    type Error = Infallible;

    fn read<'a>(
        &'a self,
        _aggregate_kind: &'a str,
        _aggregate_id: &'a Id,
        _max_version: u64,
    ) -> impl Future<Output = Result<Option<Snapshot<Id>>, Self::Error>> + Send + 'a {
        std::future::ready(Ok(None))
    }
}

impl<Id: Identity> SnapshotWriter<Id> for NoSnapshots {
    type Error = Infallible;

    fn write(
        &self,
        _snapshot: Snapshot<Id>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        std::future::ready(Ok(()))
    }
}

impl<S: SnapshotState> AggregateRoot<S> {
    /// Capture the current state and version.
    pub fn snapshot(&self) -> Snapshot<S::Id> {
        self.read_versioned(|version, state| Snapshot {
            aggregate_id: self.id().clone(),
            aggregate_kind: S::KIND.to_string(),
            version,
            state: Arc::new(state.to_snapshot()),
        })
    }

    /// Load the latest state, starting from the newest snapshot if any.
    ///
    /// # Errors
    ///
    /// See [`load_from_snapshot_until`](Self::load_from_snapshot_until).
    pub async fn load_from_snapshot<R, SR>(
        reader: &R,
        snapshots: &SR,
        id: S::Id,
    ) -> Result<Option<Self>, LoadError<R::Error, SR::Error>>
    where
        R: EventReader<S::Id>,
        SR: SnapshotReader<S::Id>,
    {
        Self::load_from_snapshot_until(reader, snapshots, id, 0).await
    }

    /// Load the state as of `version` (`0` for the latest).
    ///
    /// The newest snapshot at or below `version` is upgraded, restored into a
    /// fresh state, and followed by the events after it. Without a snapshot
    /// this is a full replay.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Snapshot`] if the snapshot lookup fails,
    /// [`LoadError::Upgrade`] if the snapshot does not upgrade to
    /// `S::Snapshot`, and otherwise the errors of
    /// [`load`](AggregateRoot::load).
    #[tracing::instrument(skip(reader, snapshots), fields(aggregate_kind = S::KIND))]
    pub async fn load_from_snapshot_until<R, SR>(
        reader: &R,
        snapshots: &SR,
        id: S::Id,
        version: u64,
    ) -> Result<Option<Self>, LoadError<R::Error, SR::Error>>
    where
        R: EventReader<S::Id>,
        SR: SnapshotReader<S::Id>,
    {
        let snapshot = snapshots
            .read(S::KIND, &id, version)
            .await
            .map_err(LoadError::Snapshot)?;

        let (replay, restored) = match snapshot {
            Some(snapshot) => {
                let payload = upgrade_into::<S::Snapshot>(snapshot.state)?;
                let mut state = S::default();
                state.restore(&payload);
                tracing::trace!(snapshot_version = snapshot.version, "snapshot restored");
                (Replay::new(state, snapshot.version), true)
            }
            None => (Replay::new(S::default(), 0), false),
        };

        let range = VersionRange::new(replay.version + 1, version);
        let replay = replay
            .read::<_, SR::Error>(reader, &id, range)
            .await?;
        tracing::trace!(
            events_applied = replay.applied,
            version = replay.version,
            "aggregate replayed from snapshot"
        );
        if !restored && replay.applied == 0 {
            return Ok(None);
        }
        Ok(Some(replay.into_root(id)))
    }
}
