//! Deduplicating fetch executor.
//!
//! The executor sits between call sites and the [`QueryStore`]. A read goes
//! through these steps:
//!
//! 1. **Fresh hit**: the entry is within its staleness window, return it.
//! 2. **Stale hit**: serve the stale value and revalidate in the background,
//!    unless the descriptor is blocking or the entry was explicitly
//!    invalidated.
//! 3. **Miss**: start a fetch, or attach to the one already in flight for
//!    the same key, and wait for it.
//!
//! Each fetch runs as its own tokio task, so it finishes (and writes the
//! store) even when every caller has gone away. Only scoped callers can
//! abort a fetch, and only when nobody else depends on its result.
//!
//! A fetch belongs to the entry generation it started in. If the entry is
//! invalidated, written optimistically or rolled back while the fetch runs,
//! its result still reaches the callers already waiting on it, but it is
//! not cached and later readers start a new fetch instead of attaching.

use cadence_core::{FetchError, QueryKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::descriptor::{MutationDescriptor, QueryDescriptor, RefreshMode};
use crate::entry::QueryData;
use crate::invalidation::{InvalidationRouter, MutationRecord};
use crate::read::QueryRead;
use crate::retry::attempt_with_retry;
use crate::signal::{AbortController, AbortSignal};
use crate::stats::Counters;
use crate::store::QueryStore;

type SharedOutcome = Shared<BoxFuture<'static, Result<QueryData, FetchError>>>;

/// Who is still waiting on an in-flight fetch.
#[derive(Debug, Default)]
struct Interest {
    scoped: AtomicUsize,
    pinned: AtomicBool,
    abort: AbortController,
}

impl Interest {
    fn pin(&self) {
        self.pinned.store(true, Ordering::SeqCst);
    }

    fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    fn attach(&self) {
        self.scoped.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of scoped callers left.
    fn detach(&self) -> usize {
        self.scoped.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }
}

/// Generation of a job that has not been registered with the store yet.
const UNREGISTERED: u64 = u64::MAX;

#[derive(Clone)]
struct InFlight {
    id: u64,
    outcome: SharedOutcome,
    interest: Arc<Interest>,
    generation: Arc<AtomicU64>,
}

impl InFlight {
    /// True if the entry moved on since this fetch started.
    fn is_outdated(&self, current: u64) -> bool {
        let generation = self.generation.load(Ordering::SeqCst);
        generation != UNREGISTERED && generation != current
    }
}

/// Runs descriptors against a store, one fetch per key at a time.
///
/// Cloning is cheap; clones share the in-flight table.
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<QueryStore>,
    in_flight: Arc<DashMap<QueryKey, InFlight>>,
    next_job_id: Arc<AtomicU64>,
}

impl QueryExecutor {
    pub fn new(store: Arc<QueryStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
            next_job_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    /// True if a fetch for `key` is running.
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Read through the cache. The fetch is never aborted on this caller's
    /// behalf.
    pub async fn run<T>(&self, descriptor: &QueryDescriptor<T>) -> Result<QueryRead<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.read(descriptor, None).await
    }

    /// Read through the cache on behalf of a caller that may go away.
    ///
    /// If `scope` fires first the caller gets [`FetchError::Cancelled`]. The
    /// shared fetch itself is aborted only when this was the last scoped
    /// caller, no unscoped caller joined, and the key has no subscribers.
    pub async fn run_scoped<T>(
        &self,
        descriptor: &QueryDescriptor<T>,
        scope: &AbortSignal,
    ) -> Result<QueryRead<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if scope.is_aborted() {
            return Err(FetchError::Cancelled);
        }
        self.read(descriptor, Some(scope)).await
    }

    /// Populate the cache for `descriptor`, waiting for any refresh.
    ///
    /// Fresh entries are left alone. Used by render entry points, which must
    /// not hand out stale data in a snapshot.
    pub async fn prefetch<T>(&self, descriptor: &QueryDescriptor<T>) -> Result<(), FetchError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let now = self.store.now();
        if let Some(entry) = self.store.get(descriptor.key()) {
            if entry.data().is_some() && !entry.is_stale(now) {
                Counters::bump(&self.store.counters().hits);
                trace!(key = %descriptor.key(), "prefetch skipped, entry fresh");
                return Ok(());
            }
        }
        Counters::bump(&self.store.counters().misses);
        let job = self.start_or_attach(descriptor, true);
        job.outcome.await.map(|_| ())
    }

    /// Wait for the fetch in flight for `key`, if any, to finish.
    pub async fn settle(&self, key: &QueryKey) {
        let job = self.in_flight.get(key).map(|job| job.value().clone());
        if let Some(job) = job {
            let _ = job.outcome.await;
        }
    }

    /// Run a mutation and report its outcome to `router`.
    ///
    /// Optimistic values in `record` are visible before the mutate function
    /// starts. On success the declared targets are invalidated; on failure
    /// the pre-mutation entries are restored and nothing is invalidated.
    pub async fn mutate<V, O>(
        &self,
        router: &InvalidationRouter,
        descriptor: &MutationDescriptor<V, O>,
        variables: V,
        record: MutationRecord,
    ) -> Result<O, FetchError>
    where
        V: Clone + Send + 'static,
        O: Send + 'static,
    {
        let pending = router.begin(descriptor.id().clone(), record);
        let mutate = descriptor.mutate_fn();
        let result = attempt_with_retry(
            descriptor.id().as_str(),
            descriptor.retry(),
            descriptor.timeout(),
            &AbortSignal::never(),
            move |signal| mutate(variables.clone(), signal),
        )
        .await;
        router.complete(pending, result.as_ref().map(|_| ()));
        result
    }

    async fn read<T>(
        &self,
        descriptor: &QueryDescriptor<T>,
        scope: Option<&AbortSignal>,
    ) -> Result<QueryRead<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let key = descriptor.key();
        let now = self.store.now();
        let counters = self.store.counters();

        if let Some(entry) = self.store.get(key) {
            if let Some(data) = entry.data() {
                match data.decode::<T>() {
                    Ok(value) => {
                        let updated_at = entry.updated_at().unwrap_or(now);
                        if !entry.is_stale(now) {
                            Counters::bump(&counters.hits);
                            trace!(key = %key, "cache hit");
                            return Ok(QueryRead::from_cache(value, updated_at));
                        }
                        let serve_stale = descriptor.policy().refresh
                            == RefreshMode::StaleWhileRevalidate
                            && !entry.is_invalidated();
                        if serve_stale {
                            Counters::bump(&counters.stale_hits);
                            debug!(key = %key, "serving stale value, revalidating");
                            self.start_or_attach(descriptor, true);
                            return Ok(QueryRead::stale(value, updated_at));
                        }
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "cached value has unexpected shape, refetching");
                    }
                }
            }
        }

        Counters::bump(&counters.misses);
        let job = self.start_or_attach(descriptor, scope.is_none());
        let data = self.wait(key, job, scope).await?;
        let value = data.decode::<T>().map_err(|err| FetchError::Decode {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        Ok(QueryRead::from_network(value, self.store.now()))
    }

    async fn wait(
        &self,
        key: &QueryKey,
        job: InFlight,
        scope: Option<&AbortSignal>,
    ) -> Result<QueryData, FetchError> {
        let Some(scope) = scope else {
            return job.outcome.await;
        };

        job.interest.attach();
        tokio::select! {
            biased;
            outcome = job.outcome.clone() => {
                job.interest.detach();
                outcome
            }
            _ = scope.aborted() => {
                let remaining = job.interest.detach();
                if remaining == 0
                    && !job.interest.is_pinned()
                    && self.store.subscriber_count(key) == 0
                {
                    debug!(key = %key, "last interested caller left, aborting fetch");
                    job.interest.abort.abort();
                }
                Err(FetchError::Cancelled)
            }
        }
    }

    /// Attach to the fetch in flight for the descriptor's key, or start one.
    ///
    /// A fetch outdated by an invalidation is replaced rather than joined.
    /// The store is never called while the in-flight table is locked.
    fn start_or_attach<T>(&self, descriptor: &QueryDescriptor<T>, pinned: bool) -> InFlight
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let key = descriptor.key();
        let current = self.store.generation(key);
        let job = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().is_outdated(current) => {
                let job = self.build_job(descriptor);
                let outdated = occupied.insert(job.clone());
                drop(occupied);
                debug!(key = %key, job = job.id, outdated = outdated.id, "replacing outdated fetch");
                job
            }
            Entry::Occupied(occupied) => {
                let job = occupied.get().clone();
                drop(occupied);
                if pinned {
                    job.interest.pin();
                }
                Counters::bump(&self.store.counters().deduplicated);
                trace!(key = %key, job = job.id, "attached to in-flight fetch");
                return job;
            }
            Entry::Vacant(vacant) => {
                let job = self.build_job(descriptor);
                vacant.insert(job.clone());
                job
            }
        };

        if pinned {
            job.interest.pin();
        }
        Counters::bump(&self.store.counters().fetches);
        debug!(key = %key, job = job.id, "fetch started");
        let generation = self.store.mark_loading(key);
        job.generation.store(generation, Ordering::SeqCst);
        tokio::spawn(job.outcome.clone());
        job
    }

    fn build_job<T>(&self, descriptor: &QueryDescriptor<T>) -> InFlight
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let interest = Arc::new(Interest::default());
        let signal = interest.abort.signal();
        let generation = Arc::new(AtomicU64::new(UNREGISTERED));
        let started_in = Arc::clone(&generation);

        let key = descriptor.key().clone();
        let fetch = descriptor.fetch_fn();
        let policy = descriptor.policy();
        let config = self.store.config();
        let retry = policy.retry.clone().unwrap_or_else(|| config.retry.clone());
        let stale_time = policy.stale_time.unwrap_or(config.default_stale_time);
        let timeout = policy.timeout;
        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);

        let job = async move {
            let label = key.to_string();
            let outcome = attempt_with_retry(&label, &retry, timeout, &signal, |signal| {
                fetch(signal)
            })
            .await
            .map(QueryData::new);

            if signal.is_aborted() {
                debug!(key = %key, job = id, "fetch aborted, cache untouched");
                if in_flight.remove_if(&key, |_, job| job.id == id).is_some() {
                    store.revert_loading(&key);
                }
                return Err(FetchError::Cancelled);
            }

            let started = started_in.load(Ordering::SeqCst);
            let recorded = store.finish_fetch(&key, started, &outcome, stale_time);
            match (&outcome, recorded) {
                (_, false) => {
                    debug!(key = %key, job = id, "entry changed during fetch, result not cached");
                }
                (Ok(_), true) => debug!(key = %key, job = id, "fetch completed"),
                (Err(err), true) => {
                    warn!(key = %key, job = id, error = %err, "fetch failed");
                }
            }
            let owned = in_flight.remove_if(&key, |_, job| job.id == id).is_some();
            if owned && !recorded {
                store.revert_loading(&key);
            }
            outcome
        };

        InFlight {
            id,
            outcome: job.boxed().shared(),
            interest,
            generation,
        }
    }
}

impl fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("store", &self.store)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueryConfig, RetryPolicy};
    use crate::entry::QueryStatus;
    use cadence_core::ManualClock;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn setup(stale_time: Duration) -> (QueryExecutor, ManualClock) {
        let clock = ManualClock::at_epoch();
        let config = QueryConfig::default()
            .with_stale_time(stale_time)
            .with_retry(
                RetryPolicy::default()
                    .with_base_delay(Duration::from_millis(1))
                    .with_max_delay(Duration::from_millis(2)),
            );
        let store = QueryStore::new(Arc::new(clock.clone()), config);
        (QueryExecutor::new(store), clock)
    }

    fn key(id: &str) -> QueryKey {
        QueryKey::new("track").unwrap().arg(id)
    }

    fn counting(key: QueryKey, calls: &Arc<AtomicU32>) -> QueryDescriptor<u32> {
        let calls = Arc::clone(calls);
        QueryDescriptor::new(key, move |_signal| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n) }
        })
    }

    #[tokio::test]
    async fn test_miss_fetches_then_hits() {
        let (executor, _) = setup(Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = counting(key("1"), &calls);

        let first = executor.run(&descriptor).await.unwrap();
        assert!(!first.was_cache_hit());
        let second = executor.run(&descriptor).await.unwrap();
        assert!(second.was_cache_hit());
        assert_eq!(*second.value(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = executor.store().stats();
        assert_eq!((stats.hits, stats.misses, stats.fetches), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let (executor, _) = setup(Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Notify::new());
        let descriptor = {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            QueryDescriptor::new(key("1"), move |_signal| {
                calls.fetch_add(1, Ordering::SeqCst);
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(5u32)
                }
            })
        };

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let executor = executor.clone();
                let descriptor = descriptor.clone();
                tokio::spawn(async move { executor.run(&descriptor).await })
            })
            .collect();
        while executor.store().stats().misses < 4 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for waiter in waiters {
            assert_eq!(*waiter.await.unwrap().unwrap().value(), 5);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.store().stats().deduplicated, 3);
        assert_eq!(executor.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_served_while_revalidating() {
        let (executor, clock) = setup(Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = counting(key("1"), &calls);
        executor.run(&descriptor).await.unwrap();

        clock.advance(Duration::from_secs(61));
        let read = executor.run(&descriptor).await.unwrap();
        assert!(read.is_stale());
        assert_eq!(*read.value(), 1);

        executor.settle(descriptor.key()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let fresh = executor.run(&descriptor).await.unwrap();
        assert_eq!(*fresh.value(), 2);
        assert!(!fresh.is_stale());
    }

    #[tokio::test]
    async fn test_blocking_descriptor_waits_for_refresh() {
        let (executor, clock) = setup(Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = counting(key("1"), &calls).blocking();
        executor.run(&descriptor).await.unwrap();

        clock.advance(Duration::from_secs(61));
        let read = executor.run(&descriptor).await.unwrap();
        assert!(!read.was_cache_hit());
        assert_eq!(*read.value(), 2);
    }

    #[tokio::test]
    async fn test_invalidated_entry_is_refetched_before_returning() {
        let (executor, _) = setup(Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = counting(key("1"), &calls);
        executor.run(&descriptor).await.unwrap();

        executor
            .store()
            .invalidate(&crate::filter::KeyFilter::exact(key("1")));
        let read = executor.run(&descriptor).await.unwrap();
        assert_eq!(*read.value(), 2);
        assert!(!read.was_cache_hit());
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_is_not_lost() {
        let (executor, clock) = setup(Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Notify::new());
        let descriptor = {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            QueryDescriptor::new(key("1"), move |_signal| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let gate = Arc::clone(&gate);
                async move {
                    if n == 1 {
                        gate.notified().await;
                    }
                    Ok(n)
                }
            })
        };

        let early = {
            let executor = executor.clone();
            let descriptor = descriptor.clone();
            tokio::spawn(async move { executor.run(&descriptor).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        executor
            .store()
            .invalidate(&crate::filter::KeyFilter::exact(key("1")));

        let late = executor.run(&descriptor).await.unwrap();
        assert_eq!(*late.value(), 2);
        gate.notify_one();
        assert_eq!(*early.await.unwrap().unwrap().value(), 1);
        executor.settle(descriptor.key()).await;

        clock.advance(Duration::from_secs(1));
        let cached = executor.run(&descriptor).await.unwrap();
        assert!(cached.was_cache_hit());
        assert_eq!(*cached.value(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.store().stats().deduplicated, 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_keeps_value() {
        let (executor, clock) = setup(Duration::from_secs(1));
        let fail = Arc::new(AtomicBool::new(false));
        let descriptor = {
            let fail = Arc::clone(&fail);
            QueryDescriptor::new(key("1"), move |_signal| {
                let fail = fail.load(Ordering::SeqCst);
                async move {
                    if fail {
                        Err(FetchError::remote("not found"))
                    } else {
                        Ok(1u32)
                    }
                }
            })
            .blocking()
        };
        executor.run(&descriptor).await.unwrap();

        fail.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(2));
        let err = executor.run(&descriptor).await.unwrap_err();
        assert!(matches!(err, FetchError::Remote { .. }));

        let entry = executor.store().peek(descriptor.key()).unwrap();
        assert_eq!(entry.status(), QueryStatus::Error);
        assert_eq!(*entry.data().unwrap().decode::<u32>().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scoped_abort_cancels_unshared_fetch() {
        let (executor, _) = setup(Duration::from_secs(60));
        let saw_abort = Arc::new(AtomicBool::new(false));
        let descriptor = {
            let saw_abort = Arc::clone(&saw_abort);
            QueryDescriptor::new(key("1"), move |signal: AbortSignal| {
                let saw_abort = Arc::clone(&saw_abort);
                async move {
                    signal.aborted().await;
                    saw_abort.store(true, Ordering::SeqCst);
                    Err::<u32, _>(FetchError::Cancelled)
                }
            })
        };

        let scope = AbortController::new();
        let task = {
            let executor = executor.clone();
            let descriptor = descriptor.clone();
            let signal = scope.signal();
            tokio::spawn(async move { executor.run_scoped(&descriptor, &signal).await })
        };
        while !executor.is_fetching(descriptor.key()) {
            tokio::task::yield_now().await;
        }
        scope.abort();

        assert_eq!(task.await.unwrap().unwrap_err(), FetchError::Cancelled);
        executor.settle(descriptor.key()).await;
        let entry = executor.store().peek(descriptor.key()).unwrap();
        assert_eq!(entry.status(), QueryStatus::Idle);
        assert!(entry.error().is_none());
    }

    #[tokio::test]
    async fn test_subscriber_keeps_fetch_alive_after_scope_abort() {
        let (executor, _) = setup(Duration::from_secs(60));
        let gate = Arc::new(Notify::new());
        let descriptor = {
            let gate = Arc::clone(&gate);
            QueryDescriptor::new(key("1"), move |_signal| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(9u32)
                }
            })
        };
        let _sub = executor.store().subscribe(descriptor.key(), |_| {});

        let scope = AbortController::new();
        let task = {
            let executor = executor.clone();
            let descriptor = descriptor.clone();
            let signal = scope.signal();
            tokio::spawn(async move { executor.run_scoped(&descriptor, &signal).await })
        };
        while !executor.is_fetching(descriptor.key()) {
            tokio::task::yield_now().await;
        }
        scope.abort();
        assert_eq!(task.await.unwrap().unwrap_err(), FetchError::Cancelled);

        gate.notify_one();
        executor.settle(descriptor.key()).await;
        let entry = executor.store().peek(descriptor.key()).unwrap();
        assert_eq!(*entry.data().unwrap().decode::<u32>().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_prefetch_skips_fresh_entries() {
        let (executor, _) = setup(Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = counting(key("1"), &calls);
        executor.prefetch(&descriptor).await.unwrap();
        executor.prefetch(&descriptor).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(executor.store().peek(descriptor.key()).is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_exhausted() {
        let (executor, _) = setup(Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let descriptor = {
            let calls = Arc::clone(&calls);
            QueryDescriptor::new(key("1"), move |_signal| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>(FetchError::transient("connection reset")) }
            })
        };
        let err = executor.run(&descriptor).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            executor.store().peek(descriptor.key()).unwrap().error_count(),
            1
        );
    }
}
