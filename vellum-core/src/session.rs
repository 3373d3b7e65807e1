//! Sessions: a unit of work spanning several aggregates of one type.
//!
//! A [`Session`] tracks the roots it has loaded or created and commits all of
//! their pending events as a single multi-aggregate write. Every operation
//! goes through one async lock, so a session is used by one logical caller at
//! a time even when it is shared between tasks.

use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    aggregate::{AggregateRoot, AggregateState, EmitError, EmitOptions, Emitted, PendingBatch},
    dispatch::Apply,
    event::UncommittedEvent,
    replay::LoadError,
    store::{EventReader, EventWriter, WriteError},
    versioned::Versioned,
};

/// Error returned by [`Session::emit`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("aggregate `{0}` is not tracked by this session (hint: load or create it first)")]
    NotTracked(String),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

type Tracked<S> = HashMap<<S as AggregateState>::Id, Arc<AggregateRoot<S>>>;

/// Tracks aggregate roots of type `S` over the store `St`.
pub struct Session<S: AggregateState, St> {
    store: St,
    tracked: Mutex<Tracked<S>>,
}

impl<S: AggregateState, St> Session<S, St> {
    #[must_use]
    pub fn new(store: St) -> Self {
        Self {
            store,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn store(&self) -> &St {
        &self.store
    }

    /// Start tracking a fresh root for `id`.
    ///
    /// Replaces any root already tracked under `id`, discarding its pending
    /// events.
    pub async fn create(&self, id: S::Id) -> Arc<AggregateRoot<S>> {
        let root = Arc::new(AggregateRoot::new(id.clone()));
        self.tracked.lock().await.insert(id, Arc::clone(&root));
        root
    }

    /// The root tracked under `id`, if any.
    pub async fn get(&self, id: &S::Id) -> Option<Arc<AggregateRoot<S>>> {
        self.tracked.lock().await.get(id).cloned()
    }

    /// Number of tracked roots.
    pub async fn len(&self) -> usize {
        self.tracked.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tracked.lock().await.is_empty()
    }

    /// Pending events across every tracked root.
    pub async fn pending_count(&self) -> usize {
        let tracked = self.tracked.lock().await;
        tracked
            .values()
            .map(|root| root.pending_events().len())
            .sum()
    }

    /// Stop tracking `id`, returning its root.
    pub async fn forget(&self, id: &S::Id) -> Option<Arc<AggregateRoot<S>>> {
        self.tracked.lock().await.remove(id)
    }

    /// Emit `event` on the root tracked under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotTracked`] if `id` was never loaded or
    /// created in this session, or the root's [`EmitError`].
    pub async fn emit<E>(
        &self,
        id: &S::Id,
        event: E,
        options: EmitOptions,
    ) -> Result<Emitted, SessionError>
    where
        S: Apply<E>,
        E: Versioned,
    {
        let tracked = self.tracked.lock().await;
        let root = tracked
            .get(id)
            .ok_or_else(|| SessionError::NotTracked(id.to_string()))?;
        Ok(root.emit_with(event, options)?)
    }
}

impl<S, St> Session<S, St>
where
    S: AggregateState,
    St: EventReader<S::Id> + EventWriter<S::Id>,
{
    /// Load `id` from the store and track it.
    ///
    /// A root already tracked under `id` is replaced and its uncommitted
    /// events are discarded. Other tracked roots are untouched. Returns
    /// `None`, and stops tracking `id`, if the aggregate has no events.
    ///
    /// # Errors
    ///
    /// Returns the [`LoadError`] of the replay.
    #[tracing::instrument(skip(self), fields(aggregate_kind = S::KIND))]
    pub async fn load(
        &self,
        id: S::Id,
    ) -> Result<Option<Arc<AggregateRoot<S>>>, LoadError<<St as EventReader<S::Id>>::Error>> {
        let mut tracked = self.tracked.lock().await;
        let loaded = AggregateRoot::load(&self.store, id.clone()).await?.map(Arc::new);

        let replaced = match &loaded {
            Some(root) => tracked.insert(id, Arc::clone(root)),
            None => tracked.remove(&id),
        };
        if let Some(previous) = replaced {
            if previous.has_pending_changes() {
                tracing::debug!(
                    aggregate_id = %previous.id(),
                    discarded = previous.pending_events().len(),
                    "reload discarded uncommitted events"
                );
            }
        }
        Ok(loaded)
    }

    /// Write the pending events of every tracked root in one batch.
    ///
    /// Returns the number of events written. If the write fails, or this
    /// future is dropped before it completes, every root gets its events back
    /// in their original order.
    ///
    /// # Errors
    ///
    /// Returns the store's [`WriteError`]. A store that writes batches
    /// atomically leaves every aggregate unchanged on error.
    #[tracing::instrument(skip(self), fields(aggregate_kind = S::KIND))]
    pub async fn commit(&self) -> Result<usize, WriteError<<St as EventWriter<S::Id>>::Error>> {
        let tracked = self.tracked.lock().await;
        let batches: Vec<PendingBatch<'_, S>> = tracked
            .values()
            .filter_map(|root| root.take_pending())
            .collect();
        if batches.is_empty() {
            return Ok(0);
        }

        let events: Vec<UncommittedEvent<S::Id>> = batches
            .iter()
            .flat_map(|batch| batch.events().iter().cloned())
            .collect();
        tracing::debug!(
            aggregates = batches.len(),
            count = events.len(),
            "committing session"
        );

        match self.store.write(&events).await {
            Ok(()) => {
                batches.into_iter().for_each(PendingBatch::disarm);
                Ok(events.len())
            }
            Err(error) => {
                tracing::debug!(%error, "session commit rejected, pending events restored");
                drop(batches);
                Err(error)
            }
        }
    }
}

impl<S: AggregateState, St> fmt::Debug for Session<S, St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &S::KIND)
            .finish_non_exhaustive()
    }
}
