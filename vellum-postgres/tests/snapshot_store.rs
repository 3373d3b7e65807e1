//! Integration tests for the `PostgreSQL` snapshot store.
//!
//! These tests require Docker to be running and will spin up a `PostgreSQL`
//! container using testcontainers.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use vellum_core::{
    aggregate::AggregateState,
    dispatch::{Apply, DispatchTable, DispatchTableBuilder},
    registry::TypeRegistry,
    repository::Repository,
    snapshot::{Snapshot, SnapshotPolicy, SnapshotReader, SnapshotState, SnapshotWriter},
    versioned::{Versioned, VersionedValue},
};
use vellum_postgres::snapshot::Store;

/// Test helper to set up a `PostgreSQL` container and connection pool.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }

    async fn snapshots(&self) -> Store {
        let store = Store::new(self.pool.clone(), registry());
        store.migrate().await.unwrap();
        store
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Incremented;

impl Versioned for Incremented {
    const NAME: &'static str = "incremented";
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterSnapshotV1 {
    count: u32,
}

impl Versioned for CounterSnapshotV1 {
    const NAME: &'static str = "counter-snapshot";
    const VERSION: u32 = 1;

    fn upgrade(&self) -> Option<Box<dyn VersionedValue>> {
        Some(Box::new(CounterSnapshot {
            count: u64::from(self.count),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CounterSnapshot {
    count: u64,
}

impl Versioned for CounterSnapshot {
    const NAME: &'static str = "counter-snapshot";
    const VERSION: u32 = 2;
}

#[derive(Debug, Default)]
struct Counter {
    count: u64,
}

impl Apply<Incremented> for Counter {
    fn apply(&mut self, _event: &Incremented) {
        self.count += 1;
    }
}

impl AggregateState for Counter {
    const KIND: &'static str = "counter";
    type Id = String;

    fn register_handlers(handlers: &mut DispatchTableBuilder<Self>) {
        handlers.on::<Incremented>();
    }

    fn dispatch_table() -> &'static DispatchTable<Self> {
        static TABLE: OnceLock<DispatchTable<Counter>> = OnceLock::new();
        TABLE.get_or_init(DispatchTable::build)
    }
}

impl SnapshotState for Counter {
    type Snapshot = CounterSnapshot;

    fn to_snapshot(&self) -> CounterSnapshot {
        CounterSnapshot { count: self.count }
    }

    fn restore(&mut self, snapshot: &CounterSnapshot) {
        self.count = snapshot.count;
    }
}

fn registry() -> Arc<TypeRegistry> {
    Arc::new(
        TypeRegistry::builder()
            .register::<Incremented>()
            .register::<CounterSnapshotV1>()
            .register::<CounterSnapshot>()
            .build()
            .unwrap(),
    )
}

fn snapshot(id: &str, version: u64, count: u64) -> Snapshot<String> {
    Snapshot {
        aggregate_id: id.to_string(),
        aggregate_kind: "counter".to_string(),
        version,
        state: Arc::new(CounterSnapshot { count }),
    }
}

async fn read_count(store: &Store, id: &str, max_version: u64) -> Option<(u64, u64)> {
    let id = id.to_string();
    store.read(Counter::KIND, &id, max_version).await.unwrap().map(|snapshot| {
        let state = snapshot
            .state
            .downcast_ref::<CounterSnapshot>()
            .expect("current shape")
            .count;
        (snapshot.version, state)
    })
}

#[tokio::test]
async fn migrate_creates_snapshot_table() {
    let db = TestDb::new().await;
    let store = Store::new(db.pool.clone(), registry());

    store.migrate().await.unwrap();

    let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vellum_snapshots")
        .fetch_one(&db.pool)
        .await
        .unwrap();

    assert_eq!(result.0, 0);
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let db = TestDb::new().await;
    let store = Store::new(db.pool.clone(), registry());

    store.migrate().await.unwrap();
    store.migrate().await.unwrap();
    store.migrate().await.unwrap();
}

#[tokio::test]
async fn read_returns_none_without_snapshots() {
    let db = TestDb::new().await;
    let store = db.snapshots().await;

    assert_eq!(read_count(&store, "counter-1", 0).await, None);
}

#[tokio::test]
async fn read_returns_the_newest_at_or_below_the_bound() {
    let db = TestDb::new().await;
    let store = db.snapshots().await;

    for version in [5, 10, 15] {
        store.write(snapshot("counter-1", version, version * 2)).await.unwrap();
    }

    assert_eq!(read_count(&store, "counter-1", 0).await, Some((15, 30)));
    assert_eq!(read_count(&store, "counter-1", 14).await, Some((10, 20)));
    assert_eq!(read_count(&store, "counter-1", 10).await, Some((10, 20)));
    assert_eq!(read_count(&store, "counter-1", 4).await, None);
    assert_eq!(read_count(&store, "counter-2", 0).await, None);
}

#[tokio::test]
async fn write_replaces_a_snapshot_at_the_same_version() {
    let db = TestDb::new().await;
    let store = db.snapshots().await;

    store.write(snapshot("counter-1", 5, 1)).await.unwrap();
    store.write(snapshot("counter-1", 5, 2)).await.unwrap();

    assert_eq!(read_count(&store, "counter-1", 0).await, Some((5, 2)));
    let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vellum_snapshots")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(rows.0, 1);
}

#[tokio::test]
async fn snapshots_of_another_kind_are_not_returned() {
    let db = TestDb::new().await;
    let store = db.snapshots().await;

    let mut other = snapshot("counter-1", 8, 80);
    other.aggregate_kind = "gauge".to_string();
    store.write(other).await.unwrap();
    assert_eq!(read_count(&store, "counter-1", 0).await, None);

    store.write(snapshot("counter-1", 4, 40)).await.unwrap();
    assert_eq!(read_count(&store, "counter-1", 0).await, Some((4, 40)));
}

#[tokio::test]
async fn stored_shape_is_returned_for_the_caller_to_upgrade() {
    let db = TestDb::new().await;
    let store = db.snapshots().await;

    store
        .write(Snapshot {
            aggregate_id: "counter-1".to_string(),
            aggregate_kind: "counter".to_string(),
            version: 3,
            state: Arc::new(CounterSnapshotV1 { count: 3 }),
        })
        .await
        .unwrap();

    let id = "counter-1".to_string();
    let loaded = store.read(Counter::KIND, &id, 0).await.unwrap().unwrap();
    assert!(loaded.state.downcast_ref::<CounterSnapshotV1>().is_some());
    assert_eq!(loaded.aggregate_kind, "counter");
}

#[tokio::test]
async fn repository_snapshots_and_loads_through_postgres() {
    let db = TestDb::new().await;
    let events = vellum_postgres::Store::new(db.pool.clone(), registry());
    events.migrate().await.unwrap();
    let snapshots = db.snapshots().await;

    let repo =
        Repository::new(events).with_snapshots(snapshots.clone(), SnapshotPolicy::EveryNEvents(3));

    let counter = repo.create::<Counter>("counter-1".to_string());
    for _ in 0..4 {
        counter.emit(Incremented).unwrap();
    }
    repo.commit(&counter).await.unwrap();
    counter.emit(Incremented).unwrap();
    repo.commit(&counter).await.unwrap();

    assert_eq!(read_count(&snapshots, "counter-1", 0).await, Some((4, 4)));

    let loaded = repo
        .load::<Counter>("counter-1".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.version(), 5);
    assert_eq!(loaded.read_state(|s| s.count), 5);
}
