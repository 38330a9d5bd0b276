//! Mutation outcomes to cache invalidation.
//!
//! The router trusts what callers declare. It does no dependency tracking:
//! a mutation invalidates exactly the targets registered for its id plus the
//! targets carried by the [`MutationRecord`] of that invocation.

use cadence_core::{FetchError, QueryKey};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::descriptor::MutationId;
use crate::entry::{CacheEntry, QueryData};
use crate::filter::KeyFilter;
use crate::store::QueryStore;

/// Per-invocation declaration of what a mutation touches.
#[derive(Debug, Clone, Default)]
pub struct MutationRecord {
    targets: Vec<KeyFilter>,
    optimistic: Vec<(QueryKey, QueryData)>,
}

impl MutationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate exactly `key` on success.
    pub fn affects(mut self, key: QueryKey) -> Self {
        self.targets.push(KeyFilter::Exact(key));
        self
    }

    /// Invalidate every key starting with `prefix` on success.
    pub fn affects_prefix(mut self, prefix: QueryKey) -> Self {
        self.targets.push(KeyFilter::Prefix(prefix));
        self
    }

    pub fn affects_where<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&QueryKey) -> bool + Send + Sync + 'static,
    {
        self.targets.push(KeyFilter::predicate(predicate));
        self
    }

    /// Show `value` under `key` until the mutation settles.
    ///
    /// The key is also invalidated on success so the server's version
    /// replaces the tentative one.
    pub fn optimistic<T>(mut self, key: QueryKey, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.optimistic.push((key, QueryData::new(value)));
        self
    }

    pub fn targets(&self) -> &[KeyFilter] {
        &self.targets
    }

    pub fn is_optimistic(&self) -> bool {
        !self.optimistic.is_empty()
    }
}

/// A mutation that has begun but not completed.
///
/// Holds the exact entries that optimistic writes replaced.
#[must_use = "a pending mutation must be completed, or optimistic writes stay forever"]
#[derive(Debug)]
pub struct PendingMutation {
    invocation: Uuid,
    mutation: MutationId,
    targets: Vec<KeyFilter>,
    optimistic_keys: Vec<QueryKey>,
    previous: Vec<(QueryKey, Option<CacheEntry>)>,
}

impl PendingMutation {
    /// Unique id of this invocation, for log correlation.
    pub fn invocation(&self) -> Uuid {
        self.invocation
    }

    pub fn mutation(&self) -> &MutationId {
        &self.mutation
    }
}

/// What completing a mutation did to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    pub invalidated: usize,
    pub rolled_back: usize,
}

/// Maps mutation ids to the cache entries they make stale.
pub struct InvalidationRouter {
    store: Arc<QueryStore>,
    registry: RwLock<HashMap<MutationId, Vec<KeyFilter>>>,
}

impl InvalidationRouter {
    pub fn new(store: Arc<QueryStore>) -> Self {
        Self {
            store,
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    /// Declare targets invalidated by every successful `mutation`.
    ///
    /// Repeated registration accumulates targets.
    pub fn register(&self, mutation: impl Into<MutationId>, target: impl Into<KeyFilter>) {
        let mutation = mutation.into();
        let target = target.into();
        debug!(mutation = %mutation, ?target, "registered invalidation target");
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(mutation)
            .or_default()
            .push(target);
    }

    pub fn registered(&self, mutation: &MutationId) -> Vec<KeyFilter> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(mutation)
            .cloned()
            .unwrap_or_default()
    }

    /// Start a mutation: apply optimistic writes, remembering what they replaced.
    pub fn begin(&self, mutation: MutationId, record: MutationRecord) -> PendingMutation {
        let invocation = Uuid::now_v7();
        let mut previous = Vec::with_capacity(record.optimistic.len());
        let mut optimistic_keys = Vec::with_capacity(record.optimistic.len());
        for (key, data) in record.optimistic {
            // Only the first capture of a key is the true pre-mutation state.
            if !optimistic_keys.contains(&key) {
                previous.push((key.clone(), self.store.peek(&key)));
                optimistic_keys.push(key.clone());
            }
            self.store.write_optimistic(&key, data);
        }
        debug!(
            mutation = %mutation,
            %invocation,
            optimistic = optimistic_keys.len(),
            "mutation started"
        );
        PendingMutation {
            invocation,
            mutation,
            targets: record.targets,
            optimistic_keys,
            previous,
        }
    }

    /// Apply a mutation's outcome to the cache.
    ///
    /// Success invalidates the registered targets, the record's targets and
    /// every optimistic key. Failure restores the captured entries exactly,
    /// in reverse order of capture, and invalidates nothing.
    pub fn complete(
        &self,
        pending: PendingMutation,
        result: Result<(), &FetchError>,
    ) -> MutationOutcome {
        let PendingMutation {
            invocation,
            mutation,
            targets,
            optimistic_keys,
            previous,
        } = pending;

        match result {
            Ok(()) => {
                let mut filters = self.registered(&mutation);
                filters.extend(targets);
                filters.extend(optimistic_keys.into_iter().map(KeyFilter::Exact));
                let invalidated = filters
                    .iter()
                    .map(|filter| self.store.invalidate(filter))
                    .sum();
                info!(mutation = %mutation, %invocation, invalidated, "mutation succeeded");
                MutationOutcome {
                    invalidated,
                    rolled_back: 0,
                }
            }
            Err(error) => {
                let rolled_back = previous.len();
                for (key, entry) in previous.into_iter().rev() {
                    self.store.restore(&key, entry);
                }
                warn!(
                    mutation = %mutation,
                    %invocation,
                    error = %error,
                    rolled_back,
                    "mutation failed, cache left as before"
                );
                MutationOutcome {
                    invalidated: 0,
                    rolled_back,
                }
            }
        }
    }
}

impl fmt::Debug for InvalidationRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self
            .registry
            .read()
            .map(|registry| registry.len())
            .unwrap_or_default();
        f.debug_struct("InvalidationRouter")
            .field("registered", &registered)
            .finish_non_exhaustive()
    }
}
