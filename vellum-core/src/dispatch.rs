//! Event dispatch.
//!
//! A state type declares what it can handle by implementing [`Apply<E>`] once
//! per event type. [`DispatchTable`] turns those declarations into a map from
//! runtime event type to a monomorphised handler, built once per state type
//! and then only read.
//!
//! Events the table has no handler for are ignored. Logs outlive handlers, so
//! replay must tolerate events a state no longer (or never) cares about.
//!
//! Hand-written state types expose their table like this; the
//! `AggregateState` derive generates the same code:
//!
//! ```
//! use std::sync::OnceLock;
//!
//! use vellum_core::{
//!     aggregate::AggregateState,
//!     dispatch::{Apply, DispatchTable, DispatchTableBuilder},
//!     versioned::Versioned,
//! };
//!
//! #[derive(Debug)]
//! struct Incremented;
//!
//! impl Versioned for Incremented {
//!     const NAME: &'static str = "incremented";
//! }
//!
//! #[derive(Default)]
//! struct Counter { value: u64 }
//!
//! impl Apply<Incremented> for Counter {
//!     fn apply(&mut self, _: &Incremented) {
//!         self.value += 1;
//!     }
//! }
//!
//! impl AggregateState for Counter {
//!     const KIND: &'static str = "counter";
//!     type Id = String;
//!
//!     fn register_handlers(handlers: &mut DispatchTableBuilder<Self>) {
//!         handlers.on::<Incremented>();
//!     }
//!
//!     fn dispatch_table() -> &'static DispatchTable<Self> {
//!         static TABLE: OnceLock<DispatchTable<Counter>> = OnceLock::new();
//!         TABLE.get_or_init(DispatchTable::build)
//!     }
//! }
//!
//! let mut counter = Counter::default();
//! assert!(Counter::dispatch_table().apply(&mut counter, &Incremented));
//! assert_eq!(counter.value, 1);
//! ```

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

use crate::{
    aggregate::AggregateState,
    versioned::{TypeKey, Versioned, VersionedValue},
};

/// Mutate state with one event type.
///
/// Implementations should be pure folds: no I/O, no failure. They run both
/// while emitting and while replaying history.
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}

type Handler<S> = fn(&mut S, &dyn Any);

fn invoke<S, E>(state: &mut S, event: &dyn Any)
where
    S: Apply<E>,
    E: 'static,
{
    if let Some(event) = event.downcast_ref::<E>() {
        state.apply(event);
    }
}

/// Collects the handlers a state type declares.
pub struct DispatchTableBuilder<S> {
    handlers: HashMap<TypeId, (TypeKey, Handler<S>)>,
}

impl<S> DispatchTableBuilder<S> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Route events of type `E` to `<S as Apply<E>>::apply`.
    ///
    /// Declaring the same event twice keeps a single handler.
    pub fn on<E>(&mut self) -> &mut Self
    where
        S: Apply<E>,
        E: Versioned,
    {
        self.handlers
            .insert(TypeId::of::<E>(), (TypeKey::of::<E>(), invoke::<S, E>));
        self
    }
}

impl<S> fmt::Debug for DispatchTableBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.handlers.values().map(|(key, _)| *key).collect();
        keys.sort();
        f.debug_struct("DispatchTableBuilder")
            .field("event_types", &keys)
            .finish()
    }
}

/// Immutable event-type to handler routing for a state type.
pub struct DispatchTable<S> {
    handlers: HashMap<TypeId, (TypeKey, Handler<S>)>,
}

impl<S: AggregateState> DispatchTable<S> {
    /// Ask `S` for its handlers and freeze them.
    ///
    /// Usually called once, from inside a `OnceLock` in
    /// [`AggregateState::dispatch_table`].
    #[must_use]
    pub fn build() -> Self {
        let mut builder = DispatchTableBuilder::new();
        S::register_handlers(&mut builder);
        tracing::debug!(
            aggregate_kind = S::KIND,
            handlers = builder.handlers.len(),
            "dispatch table built"
        );
        Self {
            handlers: builder.handlers,
        }
    }
}

impl<S> DispatchTable<S> {
    /// Apply `event` to `state` through its bound handler.
    ///
    /// Returns `false`, leaving `state` untouched, when no handler is bound
    /// for the event's runtime type.
    pub fn apply(&self, state: &mut S, event: &dyn VersionedValue) -> bool {
        let any = event.as_any();
        match self.handlers.get(&any.type_id()) {
            Some((_, handler)) => {
                handler(state, any);
                true
            }
            None => {
                tracing::trace!(event_type = %event.type_key(), "no handler bound, event ignored");
                false
            }
        }
    }

    #[must_use]
    pub fn handles<E: Versioned>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<E>())
    }

    #[must_use]
    pub fn handles_value(&self, event: &dyn VersionedValue) -> bool {
        self.handlers.contains_key(&event.as_any().type_id())
    }

    /// Keys of every event type with a bound handler.
    pub fn event_types(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.handlers.values().map(|(key, _)| *key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<S> fmt::Debug for DispatchTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.event_types().collect();
        keys.sort();
        f.debug_struct("DispatchTable")
            .field("event_types", &keys)
            .finish()
    }
}
