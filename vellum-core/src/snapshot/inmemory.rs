//! In-memory snapshot store.

use std::{
    collections::{BTreeMap, HashMap},
    convert::Infallible,
    fmt,
    future::Future,
    sync::{Arc, RwLock},
};

use super::{Snapshot, SnapshotReader, SnapshotWriter};
use crate::identity::Identity;

/// Snapshots by `(aggregate_kind, aggregate_id)`, then by version.
type SnapshotMap<Id> = HashMap<(String, Id), BTreeMap<u64, Snapshot<Id>>>;

/// In-memory snapshot store keeping every snapshot by version.
///
/// Suitable for tests and development. Clones share the same snapshots.
///
/// ```
/// use vellum_core::snapshot::inmemory;
///
/// let snapshots: inmemory::Store<String> = inmemory::Store::new();
/// assert!(snapshots.is_empty());
/// ```
#[derive(Clone)]
pub struct Store<Id> {
    snapshots: Arc<RwLock<SnapshotMap<Id>>>,
}

impl<Id> Store<Id> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<Id> Default for Store<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> fmt::Debug for Store<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
        f.debug_struct("SnapshotStore")
            .field("aggregates", &snapshots.len())
            .finish_non_exhaustive()
    }
}

impl<Id: Identity> Store<Id> {
    /// Versions of every snapshot held for `aggregate_kind`/`aggregate_id`,
    /// ascending.
    #[must_use]
    pub fn versions(&self, aggregate_kind: &str, aggregate_id: &Id) -> Vec<u64> {
        let key = (aggregate_kind.to_string(), aggregate_id.clone());
        let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
        snapshots
            .get(&key)
            .map(|by_version| by_version.keys().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
        snapshots.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Id: Identity> SnapshotReader<Id> for Store<Id> {
    type Error = Infallible;

    #[tracing::instrument(skip(self))]
    fn read<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Id,
        max_version: u64,
    ) -> impl Future<Output = Result<Option<Snapshot<Id>>, Self::Error>> + Send + 'a {
        let key = (aggregate_kind.to_string(), aggregate_id.clone());
        let found = {
            let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
            snapshots.get(&key).and_then(|by_version| {
                let bound = if max_version == 0 { u64::MAX } else { max_version };
                by_version
                    .range(..=bound)
                    .next_back()
                    .map(|(_, snapshot)| snapshot.clone())
            })
        };
        tracing::trace!(
            found = found.as_ref().map(|s| s.version),
            "snapshot lookup"
        );
        std::future::ready(Ok(found))
    }
}

impl<Id: Identity> SnapshotWriter<Id> for Store<Id> {
    type Error = Infallible;

    #[tracing::instrument(
        skip(self, snapshot),
        fields(
            aggregate_kind = %snapshot.aggregate_kind,
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
        )
    )]
    fn write(
        &self,
        snapshot: Snapshot<Id>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        {
            let mut snapshots = self
                .snapshots
                .write()
                .expect("snapshot store lock poisoned");
            snapshots
                .entry((snapshot.aggregate_kind.clone(), snapshot.aggregate_id.clone()))
                .or_default()
                .insert(snapshot.version, snapshot);
        }
        tracing::debug!("snapshot stored");
        std::future::ready(Ok(()))
    }
}
