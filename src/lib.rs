#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use vellum_core::test;
pub use vellum_core::{
    aggregate,
    aggregate::{AggregateRoot, AggregateState, Clock, EmitOptions, Emitted, FixedClock, SystemClock},
    dispatch,
    dispatch::Apply,
    event,
    event::{CommittedEvent, EventMetadata, UncommittedEvent},
    identity,
    identity::{AggregateId, Identity},
    registry,
    registry::TypeRegistry,
    replay,
    repository,
    repository::Repository,
    session,
    session::Session,
    versioned,
    versioned::{TypeKey, Versioned, VersionedValue},
};
// Re-export proc macro derives so consumers only depend on `vellum`.
pub use vellum_macros::{AggregateState, Versioned};

pub mod store {

    pub use vellum_core::store::{
        AggregateBatch, ConcurrencyConflict, EventReader, EventStream, EventWriter,
        InvalidEventSequence, VersionRange, WriteError, plan_write,
    };

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use vellum_postgres::{Error, Store, StoreOptions};
    }

    pub use vellum_core::store::inmemory;
}

pub mod snapshot {

    pub use vellum_core::snapshot::{
        NoSnapshots, Snapshot, SnapshotPolicy, SnapshotReader, SnapshotState, SnapshotWriter,
    };

    pub use vellum_core::snapshot::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use vellum_postgres::snapshot::Store;
    }
}
