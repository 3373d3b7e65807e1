//! Aggregate roots and the emit/commit protocol.
//!
//! An [`AggregateRoot`] owns an identity, a version counter, the current
//! [`AggregateState`], and a buffer of events emitted since the last commit.
//! State only changes by emitting events: each emit assigns the next version,
//! folds the event into the state through the [`DispatchTable`], and queues
//! it for the next [`commit`](AggregateRoot::commit).
//!
//! ```
//! use vellum_core::{
//!     aggregate::{AggregateRoot, AggregateState, EmitOptions, Emitted},
//!     dispatch::{Apply, DispatchTable, DispatchTableBuilder},
//!     store::inmemory,
//!     versioned::Versioned,
//! };
//! # use std::sync::OnceLock;
//! # #[derive(Debug)]
//! # struct Deposited { amount: i64 }
//! # impl Versioned for Deposited { const NAME: &'static str = "deposited"; }
//! # #[derive(Default)]
//! # struct Account { balance: i64 }
//! # impl Apply<Deposited> for Account {
//! #     fn apply(&mut self, event: &Deposited) { self.balance += event.amount; }
//! # }
//! # impl AggregateState for Account {
//! #     const KIND: &'static str = "account";
//! #     type Id = String;
//! #     fn register_handlers(handlers: &mut DispatchTableBuilder<Self>) { handlers.on::<Deposited>(); }
//! #     fn dispatch_table() -> &'static DispatchTable<Self> {
//! #         static TABLE: OnceLock<DispatchTable<Account>> = OnceLock::new();
//! #         TABLE.get_or_init(DispatchTable::build)
//! #     }
//! # }
//! # tokio_test();
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn tokio_test() {
//! let store = inmemory::Store::<String>::new();
//! let account = AggregateRoot::<Account>::new("acct-1".to_string());
//!
//! account.emit(Deposited { amount: 100 }).unwrap();
//! let retry = EmitOptions::new().idempotency_id("cmd-7").ignore_duplicates();
//! account.emit_with(Deposited { amount: 5 }, retry.clone()).unwrap();
//! assert_eq!(account.emit_with(Deposited { amount: 5 }, retry).unwrap(), Emitted::Duplicate);
//!
//! assert_eq!(account.commit(&store).await.unwrap(), 2);
//! assert_eq!(account.version(), 2);
//! assert_eq!(account.read_state(|s| s.balance), 105);
//! # }
//! ```

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    dispatch::{Apply, DispatchTable, DispatchTableBuilder},
    event::{
        CorrelationId, EventData, EventId, EventMetadata, IdempotencyId, UncommittedEvent,
    },
    identity::Identity,
    store::{EventWriter, WriteError},
    versioned::{TypeKey, Versioned},
};

/// The reduced state of an aggregate.
///
/// State owns no identity and no version; those live on the
/// [`AggregateRoot`]. `#[derive(AggregateState)]` implements this trait from
/// an `#[aggregate(kind = "...", id = Type, events(...))]` attribute.
pub trait AggregateState: Default + Send + Sized + 'static {
    /// Stable aggregate type name, recorded on every event.
    ///
    /// Use lowercase kebab-case: `"account"`, `"user-profile"`.
    const KIND: &'static str;

    type Id: Identity;

    /// Declare the event types this state handles.
    fn register_handlers(handlers: &mut DispatchTableBuilder<Self>);

    /// The process-wide dispatch table for this state type.
    ///
    /// Implementations keep the table in a `static OnceLock` so it is built on
    /// first use and shared afterwards.
    fn dispatch_table() -> &'static DispatchTable<Self>;
}

/// Source of event timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Per-call options for [`AggregateRoot::emit_with`].
#[derive(Clone, Debug)]
pub struct EmitOptions {
    idempotency_id: Option<IdempotencyId>,
    correlation_id: Option<CorrelationId>,
    timestamp: Option<DateTime<Utc>>,
    fail_on_duplicate: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            idempotency_id: None,
            correlation_id: None,
            timestamp: None,
            fail_on_duplicate: true,
        }
    }
}

impl EmitOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deduplicate this emit against pending events with the same key.
    #[must_use]
    pub fn idempotency_id(mut self, id: impl Into<IdempotencyId>) -> Self {
        self.idempotency_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Override the root's clock for this event.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Treat a duplicate idempotency id as a successful no-op instead of an
    /// error.
    #[must_use]
    pub const fn ignore_duplicates(mut self) -> Self {
        self.fail_on_duplicate = false;
        self
    }
}

/// Outcome of a successful emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Emitted {
    /// The event was applied and buffered at `version`.
    Applied { version: u64, event_id: EventId },
    /// The idempotency id was already pending; nothing changed.
    Duplicate,
}

impl Emitted {
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Error returned by [`AggregateRoot::emit_with`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error(
        "duplicate event: idempotency id `{idempotency_id}` is already pending on {aggregate_kind} \
         `{aggregate_id}`"
    )]
    Duplicate {
        aggregate_kind: &'static str,
        aggregate_id: String,
        idempotency_id: IdempotencyId,
    },
    #[error(
        "{aggregate_kind} cannot handle `{event_type}` (hint: declare the event in \
         `register_handlers`)"
    )]
    Unhandled {
        aggregate_kind: &'static str,
        event_type: TypeKey,
    },
}

/// Error returned by [`AggregateRoot::commit`].
///
/// The pending events are back in the root, in their original order, when
/// this is returned.
#[derive(Debug, Error)]
pub enum CommitError<E> {
    #[error("failed to persist {count} event(s) for {aggregate_kind} `{aggregate_id}`: {source}")]
    Persistence {
        aggregate_kind: &'static str,
        aggregate_id: String,
        count: usize,
        #[source]
        source: WriteError<E>,
    },
}

impl<E> CommitError<E> {
    #[must_use]
    pub const fn write_error(&self) -> &WriteError<E> {
        match self {
            Self::Persistence { source, .. } => source,
        }
    }

    #[must_use]
    pub fn into_write_error(self) -> WriteError<E> {
        match self {
            Self::Persistence { source, .. } => source,
        }
    }

    /// Whether another writer advanced the aggregate first.
    #[must_use]
    pub const fn is_out_of_sync(&self) -> bool {
        matches!(self.write_error(), WriteError::OutOfSync(_))
    }
}

struct Inner<S: AggregateState> {
    version: u64,
    state: S,
    pending: Vec<UncommittedEvent<S::Id>>,
    idempotency_ids: HashSet<IdempotencyId>,
}

/// An aggregate instance: identity, version, state and pending events.
///
/// All mutable parts sit behind one mutex, so an `Arc<AggregateRoot<S>>` can
/// be shared between tasks and emitted to concurrently. The lock is never held
/// across an `.await`.
pub struct AggregateRoot<S: AggregateState> {
    id: S::Id,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<S>>,
}

impl<S: AggregateState> AggregateRoot<S> {
    /// A new aggregate at version 0 with default state.
    #[must_use]
    pub fn new(id: S::Id) -> Self {
        Self::from_parts(id, 0, S::default())
    }

    pub(crate) fn from_parts(id: S::Id, version: u64, state: S) -> Self {
        Self {
            id,
            clock: Arc::new(SystemClock),
            inner: Mutex::new(Inner {
                version,
                state,
                pending: Vec::new(),
                idempotency_ids: HashSet::new(),
            }),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub const fn id(&self) -> &S::Id {
        &self.id
    }

    /// Version of the last applied event; `0` if none.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Snapshot of the pending buffer, in emission order.
    pub fn pending_events(&self) -> Vec<UncommittedEvent<S::Id>> {
        self.lock().pending.clone()
    }

    /// Run `f` against the current state under the root's lock.
    pub fn read_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.lock().state)
    }

    /// Like [`read_state`](Self::read_state), also passing the version the
    /// state corresponds to.
    pub fn read_versioned<R>(&self, f: impl FnOnce(u64, &S) -> R) -> R {
        let inner = self.lock();
        f(inner.version, &inner.state)
    }

    /// Like [`read_versioned`](Self::read_versioned), but only when nothing is
    /// pending, so the state matches what the store holds.
    pub(crate) fn read_committed<R>(&self, f: impl FnOnce(u64, &S) -> R) -> Option<R> {
        let inner = self.lock();
        inner
            .pending
            .is_empty()
            .then(|| f(inner.version, &inner.state))
    }

    /// Emit `event` with default options.
    ///
    /// # Errors
    ///
    /// See [`emit_with`](Self::emit_with).
    pub fn emit<E>(&self, event: E) -> Result<Emitted, EmitError>
    where
        S: Apply<E>,
        E: Versioned,
    {
        self.emit_with(event, EmitOptions::default())
    }

    /// Apply `event` to the state and buffer it for the next commit.
    ///
    /// Version assignment, the state change, and buffering happen in one
    /// critical section.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::Duplicate`] if the idempotency id is already
    /// pending and duplicates are not ignored, or [`EmitError::Unhandled`] if
    /// the dispatch table has no handler for `E`. Neither changes the root.
    pub fn emit_with<E>(&self, event: E, options: EmitOptions) -> Result<Emitted, EmitError>
    where
        S: Apply<E>,
        E: Versioned,
    {
        let table = S::dispatch_table();
        if !table.handles::<E>() {
            return Err(EmitError::Unhandled {
                aggregate_kind: S::KIND,
                event_type: TypeKey::of::<E>(),
            });
        }

        let mut inner = self.lock();

        if let Some(idempotency_id) = &options.idempotency_id {
            if inner.idempotency_ids.contains(idempotency_id) {
                if options.fail_on_duplicate {
                    return Err(EmitError::Duplicate {
                        aggregate_kind: S::KIND,
                        aggregate_id: self.id.to_string(),
                        idempotency_id: idempotency_id.clone(),
                    });
                }
                tracing::trace!(
                    aggregate_kind = S::KIND,
                    aggregate_id = %self.id,
                    %idempotency_id,
                    "duplicate emit ignored"
                );
                return Ok(Emitted::Duplicate);
            }
        }

        let version = inner.version + 1;
        let event_id = EventId::derive(&self.id, version);
        let metadata = EventMetadata {
            event_id,
            idempotency_id: options
                .idempotency_id
                .unwrap_or_else(IdempotencyId::generate),
            correlation_id: options
                .correlation_id
                .unwrap_or_else(CorrelationId::generate),
            event_type: TypeKey::of::<E>(),
            aggregate_id: self.id.clone(),
            aggregate_kind: S::KIND.to_string(),
            aggregate_version: version,
            timestamp: options.timestamp.unwrap_or_else(|| self.clock.now()),
        };
        let event: EventData = Arc::new(event);

        table.apply(&mut inner.state, &*event);
        inner
            .idempotency_ids
            .insert(metadata.idempotency_id.clone());
        inner.pending.push(UncommittedEvent { event, metadata });
        inner.version = version;

        tracing::trace!(
            aggregate_kind = S::KIND,
            aggregate_id = %self.id,
            version,
            event_type = %TypeKey::of::<E>(),
            "event emitted"
        );
        Ok(Emitted::Applied { version, event_id })
    }

    /// Write every pending event through `writer`.
    ///
    /// Returns the number of events written. An empty buffer is a no-op and
    /// does not call the writer.
    ///
    /// The buffer is swapped out before the write starts, so emits may
    /// continue while it is in flight. If the write fails, or this future is
    /// dropped before it completes, the batch goes back to the front of the
    /// buffer ahead of anything emitted in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::Persistence`] wrapping the store's
    /// [`WriteError`].
    pub async fn commit<W>(&self, writer: &W) -> Result<usize, CommitError<W::Error>>
    where
        W: EventWriter<S::Id>,
    {
        let Some(batch) = self.take_pending() else {
            return Ok(0);
        };
        let count = batch.events().len();
        tracing::debug!(
            aggregate_kind = S::KIND,
            aggregate_id = %self.id,
            count,
            "committing pending events"
        );

        match writer.write(batch.events()).await {
            Ok(()) => {
                batch.disarm();
                Ok(count)
            }
            Err(source) => {
                tracing::debug!(
                    aggregate_kind = S::KIND,
                    aggregate_id = %self.id,
                    error = %source,
                    "commit rejected, pending events restored"
                );
                drop(batch);
                Err(CommitError::Persistence {
                    aggregate_kind: S::KIND,
                    aggregate_id: self.id.to_string(),
                    count,
                    source,
                })
            }
        }
    }

    /// Swap the pending buffer and dedup set out of the root.
    ///
    /// The returned guard puts them back on drop unless disarmed.
    pub(crate) fn take_pending(&self) -> Option<PendingBatch<'_, S>> {
        let mut inner = self.lock();
        if inner.pending.is_empty() {
            return None;
        }
        Some(PendingBatch {
            root: self,
            events: std::mem::take(&mut inner.pending),
            idempotency_ids: std::mem::take(&mut inner.idempotency_ids),
            armed: true,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().expect("aggregate root lock poisoned")
    }
}

impl<S: AggregateState> fmt::Debug for AggregateRoot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("AggregateRoot")
            .field("kind", &S::KIND)
            .field("id", &self.id)
            .field("version", &inner.version)
            .field("pending", &inner.pending.len())
            .finish_non_exhaustive()
    }
}

/// Events taken out of a root for an in-flight write.
pub(crate) struct PendingBatch<'a, S: AggregateState> {
    root: &'a AggregateRoot<S>,
    events: Vec<UncommittedEvent<S::Id>>,
    idempotency_ids: HashSet<IdempotencyId>,
    armed: bool,
}

impl<S: AggregateState> PendingBatch<'_, S> {
    pub(crate) fn events(&self) -> &[UncommittedEvent<S::Id>] {
        &self.events
    }

    /// The write succeeded; drop the batch instead of restoring it.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S: AggregateState> Drop for PendingBatch<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self
            .root
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut restored = std::mem::take(&mut self.events);
        restored.append(&mut inner.pending);
        inner.pending = restored;
        inner
            .idempotency_ids
            .extend(std::mem::take(&mut self.idempotency_ids));
        tracing::trace!(
            aggregate_kind = S::KIND,
            aggregate_id = %self.root.id,
            pending = inner.pending.len(),
            "pending batch restored"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        sync::{
            OnceLock,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use chrono::TimeZone;

    use super::*;
    use crate::store::{EventReader, VersionRange, inmemory};

    #[derive(Debug, Clone, PartialEq)]
    struct Added(i64);

    impl Versioned for Added {
        const NAME: &'static str = "added";
    }

    #[derive(Debug)]
    struct Reset;

    impl Versioned for Reset {
        const NAME: &'static str = "reset";
    }

    #[derive(Debug, Default)]
    struct Tally {
        total: i64,
        applied: usize,
    }

    impl Apply<Added> for Tally {
        fn apply(&mut self, event: &Added) {
            self.total += event.0;
            self.applied += 1;
        }
    }

    // Implemented but deliberately not registered.
    impl Apply<Reset> for Tally {
        fn apply(&mut self, _: &Reset) {
            self.total = 0;
        }
    }

    impl AggregateState for Tally {
        const KIND: &'static str = "tally";
        type Id = String;

        fn register_handlers(handlers: &mut DispatchTableBuilder<Self>) {
            handlers.on::<Added>();
        }

        fn dispatch_table() -> &'static DispatchTable<Self> {
            static TABLE: OnceLock<DispatchTable<Tally>> = OnceLock::new();
            TABLE.get_or_init(DispatchTable::build)
        }
    }

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[derive(Default)]
    struct FailingWriter {
        calls: AtomicUsize,
    }

    impl EventWriter<String> for FailingWriter {
        type Error = DiskFull;

        fn write<'a>(
            &'a self,
            _events: &'a [UncommittedEvent<String>],
        ) -> impl Future<Output = Result<(), WriteError<Self::Error>>> + Send + 'a {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WriteError::Store(DiskFull)) }
        }
    }

    struct HangingWriter;

    impl EventWriter<String> for HangingWriter {
        type Error = DiskFull;

        fn write<'a>(
            &'a self,
            _events: &'a [UncommittedEvent<String>],
        ) -> impl Future<Output = Result<(), WriteError<Self::Error>>> + Send + 'a {
            std::future::pending()
        }
    }

    fn versions(events: &[UncommittedEvent<String>]) -> Vec<u64> {
        events.iter().map(UncommittedEvent::version).collect()
    }

    fn amounts(events: &[UncommittedEvent<String>]) -> Vec<i64> {
        events
            .iter()
            .map(|e| e.downcast_ref::<Added>().unwrap().0)
            .collect()
    }

    #[test]
    fn n_emits_yield_version_n_and_ordered_buffer() {
        let root = AggregateRoot::<Tally>::new("t-1".into());
        assert_eq!(root.version(), 0);
        assert!(!root.has_pending_changes());

        for amount in 1..=5 {
            let emitted = root.emit(Added(amount)).unwrap();
            assert!(matches!(emitted, Emitted::Applied { version, .. } if version == amount as u64));
        }

        assert_eq!(root.version(), 5);
        let pending = root.pending_events();
        assert_eq!(versions(&pending), vec![1, 2, 3, 4, 5]);
        assert_eq!(amounts(&pending), vec![1, 2, 3, 4, 5]);
        assert_eq!(root.read_state(|s| s.total), 15);
    }

    #[test]
    fn metadata_envelope_is_filled_in() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let root = AggregateRoot::<Tally>::new("t-1".into()).with_clock(FixedClock(at));

        root.emit_with(
            Added(1),
            EmitOptions::new()
                .idempotency_id("cmd-1")
                .correlation_id("corr-1"),
        )
        .unwrap();
        root.emit(Added(2)).unwrap();

        let pending = root.pending_events();
        let first = &pending[0].metadata;
        assert_eq!(first.idempotency_id.as_str(), "cmd-1");
        assert_eq!(first.correlation_id.as_str(), "corr-1");
        assert_eq!(first.event_type, TypeKey::new("added", 0));
        assert_eq!(first.aggregate_id, "t-1");
        assert_eq!(first.aggregate_kind, "tally");
        assert_eq!(first.aggregate_version, 1);
        assert_eq!(first.timestamp, at);
        assert_eq!(first.event_id, EventId::derive(&"t-1", 1));

        let second = &pending[1].metadata;
        assert_ne!(second.idempotency_id, first.idempotency_id);
        assert_eq!(second.event_id, EventId::derive(&"t-1", 2));
    }

    #[test]
    fn explicit_timestamp_overrides_clock() {
        let clock = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let explicit = Utc.with_ymd_and_hms(2020, 6, 1, 12, 0, 0).unwrap();
        let root = AggregateRoot::<Tally>::new("t-1".into()).with_clock(FixedClock(clock));

        root.emit_with(Added(1), EmitOptions::new().timestamp(explicit))
            .unwrap();

        assert_eq!(root.pending_events()[0].metadata.timestamp, explicit);
    }

    #[test]
    fn duplicate_idempotency_id_fails_without_changes() {
        let root = AggregateRoot::<Tally>::new("t-1".into());
        let options = EmitOptions::new().idempotency_id("cmd-1");
        root.emit_with(Added(10), options.clone()).unwrap();

        let err = root.emit_with(Added(10), options).unwrap_err();
        assert!(matches!(err, EmitError::Duplicate { ref idempotency_id, .. } if idempotency_id.as_str() == "cmd-1"));
        assert!(err.to_string().contains("already pending"));
        assert_eq!(root.version(), 1);
        assert_eq!(root.pending_events().len(), 1);
        assert_eq!(root.read_state(|s| s.total), 10);
    }

    #[test]
    fn ignored_duplicate_is_a_silent_no_op() {
        let root = AggregateRoot::<Tally>::new("t-1".into());
        let options = EmitOptions::new().idempotency_id("cmd-1").ignore_duplicates();
        root.emit_with(Added(10), options.clone()).unwrap();

        assert_eq!(root.emit_with(Added(10), options).unwrap(), Emitted::Duplicate);
        assert_eq!(root.version(), 1);
        assert_eq!(root.pending_events().len(), 1);
        assert_eq!(root.read_state(|s| s.applied), 1);
    }

    #[test]
    fn unregistered_event_is_rejected_before_any_change() {
        let root = AggregateRoot::<Tally>::new("t-1".into());
        root.emit(Added(3)).unwrap();

        let err = root.emit(Reset).unwrap_err();
        assert!(matches!(err, EmitError::Unhandled { event_type, .. } if event_type.name == "reset"));
        assert_eq!(root.version(), 1);
        assert_eq!(root.read_state(|s| s.total), 3);
    }

    #[tokio::test]
    async fn commit_empties_the_buffer_and_persists_in_order() {
        let store = inmemory::Store::new();
        let root = AggregateRoot::<Tally>::new("t-1".into());
        root.emit(Added(1)).unwrap();
        root.emit(Added(2)).unwrap();

        assert_eq!(root.commit(&store).await.unwrap(), 2);
        assert!(!root.has_pending_changes());
        assert_eq!(root.version(), 2);

        let stored = inmemory_versions(&store, "t-1").await;
        assert_eq!(stored, vec![1, 2]);
    }

    #[tokio::test]
    async fn committed_idempotency_ids_can_be_reused() {
        let store = inmemory::Store::<String>::new();
        let root = AggregateRoot::<Tally>::new("t-1".into());
        let options = EmitOptions::new().idempotency_id("cmd-1");
        root.emit_with(Added(1), options.clone()).unwrap();
        root.commit(&store).await.unwrap();

        assert!(matches!(
            root.emit_with(Added(1), options).unwrap(),
            Emitted::Applied { version: 2, .. }
        ));
    }

    #[tokio::test]
    async fn empty_commit_does_not_call_the_writer() {
        let writer = FailingWriter::default();
        let root = AggregateRoot::<Tally>::new("t-1".into());

        assert_eq!(root.commit(&writer).await.unwrap(), 0);
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_commit_restores_buffer_and_dedup_set() {
        let writer = FailingWriter::default();
        let root = AggregateRoot::<Tally>::new("t-1".into());
        root.emit_with(Added(1), EmitOptions::new().idempotency_id("cmd-1"))
            .unwrap();
        root.emit(Added(2)).unwrap();
        let before = root.pending_events();

        let err = root.commit(&writer).await.unwrap_err();

        assert!(matches!(
            err,
            CommitError::Persistence { count: 2, source: WriteError::Store(DiskFull), .. }
        ));
        assert!(!err.is_out_of_sync());
        let after = root.pending_events();
        assert_eq!(versions(&after), versions(&before));
        assert_eq!(amounts(&after), amounts(&before));
        assert!(matches!(
            root.emit_with(Added(1), EmitOptions::new().idempotency_id("cmd-1")),
            Err(EmitError::Duplicate { .. })
        ));
    }

    #[test]
    fn restored_batch_goes_ahead_of_concurrent_emits() {
        let root = AggregateRoot::<Tally>::new("t-1".into());
        root.emit(Added(1)).unwrap();
        root.emit(Added(2)).unwrap();

        let batch = root.take_pending().unwrap();
        assert!(!root.has_pending_changes());
        root.emit(Added(3)).unwrap();
        drop(batch);

        let pending = root.pending_events();
        assert_eq!(versions(&pending), vec![1, 2, 3]);
        assert_eq!(amounts(&pending), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cancelled_commit_restores_the_batch() {
        let root = AggregateRoot::<Tally>::new("t-1".into());
        root.emit(Added(1)).unwrap();

        let result =
            tokio::time::timeout(Duration::from_millis(10), root.commit(&HangingWriter)).await;

        assert!(result.is_err());
        assert_eq!(versions(&root.pending_events()), vec![1]);
    }

    #[tokio::test]
    async fn concurrent_emits_never_lose_updates() {
        let root = Arc::new(AggregateRoot::<Tally>::new("t-1".into()));

        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let root = Arc::clone(&root);
                tokio::spawn(async move { root.emit(Added(1)).unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(root.version(), 1000);
        assert_eq!(root.read_state(|s| s.total), 1000);
        let pending = root.pending_events();
        assert_eq!(versions(&pending), (1..=1000).collect::<Vec<_>>());
    }

    async fn inmemory_versions(store: &inmemory::Store<String>, id: &str) -> Vec<u64> {
        use tokio_stream::StreamExt;

        let id = id.to_string();
        let mut stream = store.read(Tally::KIND, &id, VersionRange::all());
        let mut versions = Vec::new();
        while let Some(event) = stream.next().await {
            versions.push(event.unwrap().version());
        }
        versions
    }
}
