//! Load/commit orchestration over an event store.
//!
//! `Repository` loads aggregate roots, commits them, and runs operations under
//! an optimistic-concurrency retry loop.
//!
//! Snapshot support is opt-in via `Repository<_, Snapshots<_>>`. The default
//! repository never touches a snapshot store and places no
//! [`SnapshotState`] bound on aggregate state.

use std::{convert::Infallible, future::Future, sync::Arc};

use thiserror::Error;

use crate::{
    aggregate::{AggregateRoot, AggregateState, CommitError},
    replay::LoadError,
    snapshot::{
        NoSnapshots, Snapshot, SnapshotPolicy, SnapshotReader, SnapshotState, SnapshotWriter,
    },
    store::{EventReader, EventWriter},
};

type StoreReadError<St, S> = <St as EventReader<<S as AggregateState>::Id>>::Error;
type StoreWriteError<St, S> = <St as EventWriter<<S as AggregateState>::Id>>::Error;

/// Error type for [`Repository::load`].
pub type RepositoryLoadError<St, S, M> =
    LoadError<StoreReadError<St, S>, <M as SnapshotMode<S>>::Error>;

/// Error type for [`Repository::execute_with_retry`].
pub type RetryError<St, S, M, OE> =
    ExecuteError<OE, StoreReadError<St, S>, StoreWriteError<St, S>, <M as SnapshotMode<S>>::Error>;

/// Error returned by [`Repository::execute_with_retry`].
#[derive(Debug, Error)]
pub enum ExecuteError<OperationError, ReadError, WriteError, SnapshotError = Infallible>
where
    ReadError: std::error::Error + 'static,
    WriteError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    #[error("operation rejected: {0}")]
    Operation(OperationError),
    #[error("failed to rebuild aggregate state: {0}")]
    Load(#[source] LoadError<ReadError, SnapshotError>),
    #[error("failed to persist events: {0}")]
    Commit(#[source] CommitError<WriteError>),
}

/// How a repository loads roots and what it does after a commit.
///
/// Implemented by [`NoSnapshots`] (plain replay) and [`Snapshots`].
pub trait SnapshotMode<S: AggregateState>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn load<'a, R>(
        &'a self,
        reader: &'a R,
        id: S::Id,
    ) -> impl Future<Output = Result<Option<AggregateRoot<S>>, LoadError<R::Error, Self::Error>>>
    + Send
    + 'a
    where
        R: EventReader<S::Id>;

    /// Called after `root` committed `committed` events.
    fn after_commit<'a>(
        &'a self,
        root: &'a AggregateRoot<S>,
        committed: usize,
    ) -> impl Future<Output = ()> + Send + 'a;
}

impl<S: AggregateState> SnapshotMode<S> for NoSnapshots {
    type Error = Infallible;

    fn load<'a, R>(
        &'a self,
        reader: &'a R,
        id: S::Id,
    ) -> impl Future<Output = Result<Option<AggregateRoot<S>>, LoadError<R::Error, Self::Error>>>
    + Send
    + 'a
    where
        R: EventReader<S::Id>,
    {
        AggregateRoot::load(reader, id)
    }

    fn after_commit<'a>(
        &'a self,
        _root: &'a AggregateRoot<S>,
        _committed: usize,
    ) -> impl Future<Output = ()> + Send + 'a {
        std::future::ready(())
    }
}

/// Snapshot-enabled repository mode: a snapshot store plus the policy that
/// decides when to write to it.
#[derive(Debug)]
pub struct Snapshots<SS> {
    store: SS,
    policy: SnapshotPolicy,
}

impl<SS> Snapshots<SS> {
    #[must_use]
    pub const fn store(&self) -> &SS {
        &self.store
    }

    #[must_use]
    pub const fn policy(&self) -> SnapshotPolicy {
        self.policy
    }
}

impl<S, SS> SnapshotMode<S> for Snapshots<SS>
where
    S: SnapshotState,
    SS: SnapshotReader<S::Id> + SnapshotWriter<S::Id>,
{
    type Error = <SS as SnapshotReader<S::Id>>::Error;

    fn load<'a, R>(
        &'a self,
        reader: &'a R,
        id: S::Id,
    ) -> impl Future<Output = Result<Option<AggregateRoot<S>>, LoadError<R::Error, Self::Error>>>
    + Send
    + 'a
    where
        R: EventReader<S::Id>,
    {
        AggregateRoot::load_from_snapshot(reader, &self.store, id)
    }

    fn after_commit<'a>(
        &'a self,
        root: &'a AggregateRoot<S>,
        committed: usize,
    ) -> impl Future<Output = ()> + Send + 'a {
        let policy = self.policy;
        // Skipped when more events were emitted while the commit was in flight.
        let snapshot = root
            .read_committed(|version, state| {
                let previous = version.saturating_sub(committed as u64);
                policy.should_snapshot(previous, version).then(|| Snapshot {
                    aggregate_id: root.id().clone(),
                    aggregate_kind: S::KIND.to_string(),
                    version,
                    state: Arc::new(state.to_snapshot()),
                })
            })
            .flatten();

        async move {
            let Some(snapshot) = snapshot else {
                return;
            };
            let version = snapshot.version;
            if let Err(error) = self.store.write(snapshot).await {
                tracing::warn!(
                    aggregate_kind = S::KIND,
                    aggregate_id = %root.id(),
                    version,
                    %error,
                    "failed to store snapshot after commit"
                );
            }
        }
    }
}

/// Loads, commits and retries aggregate operations against one event store.
///
/// `St` must implement both [`EventReader`] and [`EventWriter`] for the
/// aggregate's id type; the in-memory and PostgreSQL stores do.
///
/// ```
/// use vellum_core::{repository::Repository, snapshot::{SnapshotPolicy, inmemory as snapshots}, store::inmemory};
///
/// let plain = Repository::new(inmemory::Store::<String>::new());
/// let cached = Repository::new(inmemory::Store::<String>::new())
///     .with_snapshots(snapshots::Store::<String>::new(), SnapshotPolicy::EveryNEvents(100));
/// assert_eq!(cached.snapshots().policy(), SnapshotPolicy::EveryNEvents(100));
/// # let _ = plain;
/// ```
#[derive(Debug)]
pub struct Repository<St, M = NoSnapshots> {
    store: St,
    snapshots: M,
}

impl<St> Repository<St> {
    #[must_use]
    pub const fn new(store: St) -> Self {
        Self {
            store,
            snapshots: NoSnapshots,
        }
    }
}

impl<St, M> Repository<St, M> {
    #[must_use]
    pub const fn event_store(&self) -> &St {
        &self.store
    }

    #[must_use]
    pub const fn snapshots(&self) -> &M {
        &self.snapshots
    }

    /// Load through `snapshots` and write to it according to `policy`.
    #[must_use]
    pub fn with_snapshots<SS>(
        self,
        snapshots: SS,
        policy: SnapshotPolicy,
    ) -> Repository<St, Snapshots<SS>> {
        Repository {
            store: self.store,
            snapshots: Snapshots {
                store: snapshots,
                policy,
            },
        }
    }

    /// A fresh root at version 0. Nothing is written until it is committed.
    #[must_use]
    pub fn create<S: AggregateState>(&self, id: S::Id) -> AggregateRoot<S> {
        AggregateRoot::new(id)
    }

    /// Load the latest state of `id`, or `None` if it has no events.
    ///
    /// # Errors
    ///
    /// Returns the [`LoadError`] of the underlying replay.
    pub async fn load<S>(
        &self,
        id: S::Id,
    ) -> Result<Option<AggregateRoot<S>>, RepositoryLoadError<St, S, M>>
    where
        S: AggregateState,
        St: EventReader<S::Id>,
        M: SnapshotMode<S>,
    {
        SnapshotMode::<S>::load(&self.snapshots, &self.store, id).await
    }

    /// Commit `root`'s pending events, then offer a snapshot.
    ///
    /// A failed snapshot write is logged and otherwise ignored; the events are
    /// already durable at that point.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] if the store rejects the write. The events are
    /// back in `root` when it does.
    #[tracing::instrument(
        skip(self, root),
        fields(aggregate_kind = S::KIND, aggregate_id = %root.id())
    )]
    pub async fn commit<S>(
        &self,
        root: &AggregateRoot<S>,
    ) -> Result<usize, CommitError<StoreWriteError<St, S>>>
    where
        S: AggregateState,
        St: EventWriter<S::Id>,
        M: SnapshotMode<S>,
    {
        let committed = root.commit(&self.store).await?;
        if committed > 0 {
            SnapshotMode::<S>::after_commit(&self.snapshots, root, committed).await;
        }
        Ok(committed)
    }

    /// Load (or create) `id`, run `operation` against it and commit, retrying
    /// from a fresh load whenever the commit is out of sync.
    ///
    /// At most `max_retries + 1` attempts are made. Returns the number of
    /// attempts used.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::Operation`] as soon as `operation` fails,
    /// [`ExecuteError::Load`] if a load fails, and [`ExecuteError::Commit`]
    /// for a non-conflict commit failure or when the retries are exhausted.
    pub async fn execute_with_retry<S, OE, F>(
        &self,
        id: S::Id,
        max_retries: usize,
        mut operation: F,
    ) -> Result<usize, RetryError<St, S, M, OE>>
    where
        S: AggregateState,
        St: EventReader<S::Id> + EventWriter<S::Id>,
        M: SnapshotMode<S>,
        F: FnMut(&AggregateRoot<S>) -> Result<(), OE>,
    {
        for attempt in 1..=max_retries {
            match self.attempt(id.clone(), &mut operation).await {
                Ok(()) => return Ok(attempt),
                Err(ExecuteError::Commit(err)) if err.is_out_of_sync() => {
                    tracing::debug!(
                        aggregate_kind = S::KIND,
                        aggregate_id = %id,
                        attempt,
                        "commit out of sync, reloading"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.attempt(id, &mut operation)
            .await
            .map(|()| max_retries + 1)
    }

    async fn attempt<S, OE, F>(
        &self,
        id: S::Id,
        operation: &mut F,
    ) -> Result<(), RetryError<St, S, M, OE>>
    where
        S: AggregateState,
        St: EventReader<S::Id> + EventWriter<S::Id>,
        M: SnapshotMode<S>,
        F: FnMut(&AggregateRoot<S>) -> Result<(), OE>,
    {
        let root = match self.load::<S>(id.clone()).await.map_err(ExecuteError::Load)? {
            Some(root) => root,
            None => self.create::<S>(id),
        };
        operation(&root).map_err(ExecuteError::Operation)?;
        self.commit(&root).await.map_err(ExecuteError::Commit)?;
        Ok(())
    }
}
