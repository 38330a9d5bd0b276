//! Hydration boundary for a rendered subtree.

use cadence_core::QueryKey;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

use crate::entry::QueryState;
use crate::snapshot::{hydrate, HydrationReport, Snapshot, SnapshotId};
use crate::store::QueryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Application {
    Running(ThreadId),
    Done,
}

/// Applies server snapshots to a store at most once each.
///
/// Enter the boundary on every render; only the first entry with a given
/// snapshot hydrates. Entries from other threads wait until hydration has
/// finished, so descendants never observe a half-applied snapshot. The lock
/// is not held while store listeners run, and a listener that enters the
/// boundary again during hydration returns at once.
#[derive(Debug)]
pub struct HydrationBoundary {
    store: Arc<QueryStore>,
    applied: Mutex<HashMap<SnapshotId, Application>>,
    merged: Condvar,
}

impl HydrationBoundary {
    pub fn new(store: Arc<QueryStore>) -> Self {
        Self {
            store,
            applied: Mutex::new(HashMap::new()),
            merged: Condvar::new(),
        }
    }

    fn applied(&self) -> MutexGuard<'_, HashMap<SnapshotId, Application>> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `id` for this thread, waiting out another thread's hydration.
    ///
    /// Returns true if the caller must hydrate.
    fn claim(&self, id: &SnapshotId) -> bool {
        let me = thread::current().id();
        let mut applied = self.applied();
        loop {
            match applied.get(id) {
                None => {
                    applied.insert(id.clone(), Application::Running(me));
                    return true;
                }
                Some(Application::Done) => return false,
                Some(Application::Running(owner)) if *owner == me => return false,
                Some(Application::Running(_)) => {
                    applied = self
                        .merged
                        .wait(applied)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    pub fn enter(&self, snapshot: Option<&Snapshot>) -> BoundaryScope {
        let Some(snapshot) = snapshot else {
            return BoundaryScope {
                store: Arc::clone(&self.store),
                snapshot: None,
                report: None,
            };
        };

        let report = if self.claim(snapshot.id()) {
            let report = hydrate(snapshot, &self.store);
            self.applied().insert(snapshot.id().clone(), Application::Done);
            self.merged.notify_all();
            debug!(snapshot = %snapshot.id(), ?report, "boundary hydrated");
            Some(report)
        } else {
            trace!(snapshot = %snapshot.id(), "snapshot already applied");
            None
        };

        BoundaryScope {
            store: Arc::clone(&self.store),
            snapshot: Some(snapshot.id().clone()),
            report,
        }
    }

    /// True once hydration of `id` has started.
    pub fn has_applied(&self, id: &SnapshotId) -> bool {
        self.applied().contains_key(id)
    }
}

/// Read access for the subtree under a boundary.
#[derive(Debug, Clone)]
pub struct BoundaryScope {
    store: Arc<QueryStore>,
    snapshot: Option<SnapshotId>,
    report: Option<HydrationReport>,
}

impl BoundaryScope {
    /// Current state of `key`, including loading and error-with-stale-data.
    pub fn read<T>(&self, key: &QueryKey) -> QueryState<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        QueryState::from_entry(self.store.get(key).as_ref())
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    pub fn snapshot_id(&self) -> Option<&SnapshotId> {
        self.snapshot.as_ref()
    }

    /// Hydration result, present only on the entry that applied the snapshot.
    pub fn hydration(&self) -> Option<HydrationReport> {
        self.report
    }
}
