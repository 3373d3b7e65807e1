//! Core traits and types for the vellum event-sourcing library.
//!
//! This crate provides the aggregate consistency core:
//!
//! - [`versioned`] - Versioned types and the upgrade protocol (`Versioned`, `TypeKey`)
//! - [`registry`] - Process-wide catalog of versioned types (`TypeRegistry`)
//! - [`dispatch`] - Per-state event dispatch tables (`Apply`, `DispatchTable`)
//! - [`aggregate`] - Aggregate roots and the emit/commit protocol (`AggregateRoot`)
//! - [`event`] - Event envelopes and metadata (`UncommittedEvent`, `CommittedEvent`)
//! - [`store`] - Append-only event store contract (`EventWriter`, `EventReader`)
//! - [`replay`] - Rebuilding roots from their log (`LoadError`)
//! - [`snapshot`] - Snapshot contract and policy (`SnapshotState`, `SnapshotPolicy`)
//! - [`repository`] - Load/commit orchestration and retries (`Repository`)
//! - [`session`] - Multi-aggregate units of work (`Session`)
//!
//! # Example
//!
//! ```
//! use vellum_core::{repository::Repository, store::inmemory};
//!
//! // Create an in-memory store and repository
//! let store: inmemory::Store<String> = inmemory::Store::new();
//! let repo = Repository::new(store);
//! # let _ = repo;
//! ```
//!
//! Most users should depend on the `vellum` crate, which re-exports these
//! types together with the derive macros.

pub mod aggregate;
pub mod dispatch;
pub mod event;
pub mod identity;
pub mod registry;
pub mod replay;
pub mod repository;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod versioned;
