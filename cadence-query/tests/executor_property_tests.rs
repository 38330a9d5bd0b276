//! Property-Based Tests for Fetch Deduplication and Mutation Routing
//!
//! **Property 4: Single Flight**
//!
//! Any number of concurrent reads of one identity cause exactly one fetch,
//! and every reader observes that fetch's value.
//!
//! **Property 5: Targeted Invalidation**
//!
//! A successful mutation makes exactly its targets stale; the next read of
//! each target refetches once and untouched identities keep serving cache.
//!
//! **Property 6: Optimistic Rollback**
//!
//! A failed mutation leaves every entry it wrote optimistically exactly as
//! it was before the mutation began.

use cadence_core::{FetchError, QueryKey};
use cadence_query::{
    InvalidationRouter, KeyFilter, MutationDescriptor, MutationRecord, QueryExecutor, QueryStatus,
    ReadSource,
};
use cadence_test_utils::assertions::{assert_cached, assert_fresh, assert_source, assert_stale};
use cadence_test_utils::fixtures::{artist_key, catalog_key, manual_store, track_key};
use cadence_test_utils::CountingFetch;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Track {
    id: String,
    likes: i64,
}

fn track(id: &str, likes: i64) -> Track {
    Track {
        id: id.to_string(),
        likes,
    }
}

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

const MINUTE: Duration = Duration::from_secs(60);

/// Yield until `done` holds, failing after a generous bound.
async fn wait_until(mut done: impl FnMut() -> bool) -> Result<(), TestCaseError> {
    for _ in 0..10_000 {
        if done() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Err(TestCaseError::fail("condition never held"))
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// **Property 4: Single Flight**
    #[test]
    fn prop_concurrent_reads_share_one_fetch(readers in 2usize..16, likes in any::<i64>()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (store, _clock) = manual_store(MINUTE);
            let executor = QueryExecutor::new(Arc::clone(&store));
            let fetch = CountingFetch::gated(track("42", likes));
            let descriptor = fetch.descriptor(track_key("42"));

            let handles: Vec<_> = (0..readers)
                .map(|_| {
                    let executor = executor.clone();
                    let descriptor = descriptor.clone();
                    tokio::spawn(async move { executor.run(&descriptor).await })
                })
                .collect();

            let waiting = Arc::clone(&store);
            wait_until(move || {
                let stats = waiting.stats();
                stats.fetches + stats.deduplicated == readers as u64
            })
            .await?;
            fetch.open();

            for handle in handles {
                let read = handle
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(read.value(), &track("42", likes));
            }
            prop_assert_eq!(fetch.calls(), 1);
            prop_assert_eq!(store.stats().fetches, 1);
            prop_assert_eq!(executor.in_flight_count(), 0);
            Ok(())
        })?;
    }

    /// **Property 6: Optimistic Rollback**
    #[test]
    fn prop_failed_mutation_restores_entries(guesses in prop::collection::vec(any::<i64>(), 1..5)) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (store, clock) = manual_store(MINUTE);
            let executor = QueryExecutor::new(Arc::clone(&store));
            let router = InvalidationRouter::new(Arc::clone(&store));
            let key = track_key("42");
            let fetch = CountingFetch::new(track("42", 10));
            executor
                .run(&fetch.descriptor(key.clone()))
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let before = store.peek(&key).expect("seeded");
            clock.advance(Duration::from_secs(1));

            let record = guesses.iter().fold(MutationRecord::new(), |record, likes| {
                record.optimistic(key.clone(), track("42", *likes))
            });
            let last_guess = track("42", *guesses.last().expect("non-empty"));
            let saw_guess = Arc::new(AtomicBool::new(false));
            let observer = Arc::clone(&saw_guess);
            let observed_store = Arc::clone(&store);
            let observed_key = key.clone();
            let descriptor = MutationDescriptor::<(), Track>::new("likeTrack", move |_vars, _signal| {
                let current = observed_store
                    .peek(&observed_key)
                    .and_then(|entry| entry.data().and_then(|data| data.decode::<Track>().ok()));
                observer.store(
                    current.as_deref() == Some(&last_guess),
                    Ordering::SeqCst,
                );
                async { Err(FetchError::remote("like rejected")) }
            });

            let result = executor.mutate(&router, &descriptor, (), record).await;
            prop_assert!(matches!(result, Err(FetchError::Remote { .. })), "expected remote error");
            prop_assert!(saw_guess.load(Ordering::SeqCst), "optimistic value visible in flight");

            let after = store.peek(&key).expect("still present");
            prop_assert_eq!(after.updated_at(), before.updated_at());
            prop_assert_eq!(after.stale_at(), before.stale_at());
            prop_assert_eq!(after.status(), QueryStatus::Success);
            assert_cached(&store, &key, &track("42", 10));
            Ok(())
        })?;
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// **Property 5: Targeted Invalidation**
#[tokio::test]
async fn test_mutation_fans_out_to_exact_targets() {
    let (store, _clock) = manual_store(MINUTE);
    let executor = QueryExecutor::new(Arc::clone(&store));
    let router = InvalidationRouter::new(Arc::clone(&store));

    let a = track_key("1");
    let b = artist_key("7");
    let c = catalog_key("ambient", 1);
    let fetch_a = CountingFetch::new(track("1", 1));
    let fetch_b = CountingFetch::new(track("7", 7));
    let fetch_c = CountingFetch::new(track("c", 0));
    for (fetch, key) in [(&fetch_a, &a), (&fetch_b, &b), (&fetch_c, &c)] {
        executor.run(&fetch.descriptor(key.clone())).await.unwrap();
    }

    let descriptor = MutationDescriptor::<(), ()>::new("followArtist", |_vars, _signal| async { Ok(()) });
    let record = MutationRecord::new().affects(a.clone()).affects(b.clone());
    executor.mutate(&router, &descriptor, (), record).await.unwrap();

    assert_stale(&store, &a);
    assert_stale(&store, &b);
    assert_fresh(&store, &c);

    for (fetch, key) in [(&fetch_a, &a), (&fetch_b, &b)] {
        let read = executor.run(&fetch.descriptor(key.clone())).await.unwrap();
        assert_source(&read, ReadSource::Network);
        assert_eq!(fetch.calls(), 2, "{} refetched once", key);
    }
    let read = executor.run(&fetch_c.descriptor(c.clone())).await.unwrap();
    assert_source(&read, ReadSource::Cache);
    assert_eq!(fetch_c.calls(), 1);
}

/// Liking a track makes the next read of that track fetch the new count
/// instead of serving the pre-like value.
#[tokio::test]
async fn test_like_is_visible_on_next_read() {
    let (store, clock) = manual_store(MINUTE);
    let executor = QueryExecutor::new(Arc::clone(&store));
    let router = InvalidationRouter::new(Arc::clone(&store));
    router.register("likeTrack", KeyFilter::prefix(QueryKey::new("track").unwrap()));

    let key = track_key("42");
    let fetch = CountingFetch::new(track("42", 10));
    let descriptor = fetch.descriptor(key.clone()).with_stale_time(MINUTE);
    let first = executor.run(&descriptor).await.unwrap();
    assert_eq!(first.value().likes, 10);

    clock.advance(Duration::from_secs(5));
    fetch.set_value(track("42", 11));
    let like = MutationDescriptor::<String, ()>::new("likeTrack", |_track_id, _signal| async { Ok(()) });
    executor
        .mutate(&router, &like, "42".to_string(), MutationRecord::new())
        .await
        .unwrap();

    let second = executor.run(&descriptor).await.unwrap();
    assert_source(&second, ReadSource::Network);
    assert_eq!(second.value().likes, 11);
    assert_eq!(fetch.calls(), 2);

    let third = executor.run(&descriptor).await.unwrap();
    assert_source(&third, ReadSource::Cache);
    assert_eq!(fetch.calls(), 2);
}

/// A mutation that lands while a fetch for its target is still running must
/// not let that fetch's pre-mutation result be cached as fresh.
#[tokio::test]
async fn test_invalidation_during_fetch_forces_refetch() {
    let (store, clock) = manual_store(MINUTE);
    let executor = QueryExecutor::new(Arc::clone(&store));
    let router = InvalidationRouter::new(Arc::clone(&store));
    let key = track_key("42");
    let fetch = CountingFetch::gated("pre-mutation".to_string());
    let descriptor = fetch.descriptor(key.clone());

    let early = {
        let executor = executor.clone();
        let descriptor = descriptor.clone();
        tokio::spawn(async move { executor.run(&descriptor).await })
    };
    while fetch.calls() == 0 {
        tokio::task::yield_now().await;
    }

    let like = MutationDescriptor::<(), ()>::new("likeTrack", |_vars, _signal| async { Ok(()) });
    executor
        .mutate(&router, &like, (), MutationRecord::new().affects(key.clone()))
        .await
        .unwrap();

    fetch.open();
    let early = early.await.unwrap().unwrap();
    assert_eq!(early.value(), "pre-mutation");
    executor.settle(&key).await;
    assert_stale(&store, &key);
    let entry = store.peek(&key).unwrap();
    assert_eq!(entry.status(), QueryStatus::Idle);
    assert!(entry.data().is_none());

    fetch.set_value("post-mutation".to_string());
    clock.advance(Duration::from_secs(1));
    let read = executor.run(&descriptor).await.unwrap();
    assert_source(&read, ReadSource::Network);
    assert_eq!(read.value(), "post-mutation");
    assert_eq!(fetch.calls(), 2);

    let again = executor.run(&descriptor).await.unwrap();
    assert_source(&again, ReadSource::Cache);
    assert_eq!(fetch.calls(), 2);
}

/// An optimistic write is not clobbered by a fetch that started before it.
#[tokio::test]
async fn test_optimistic_write_outdates_running_fetch() {
    let (store, _clock) = manual_store(MINUTE);
    let executor = QueryExecutor::new(Arc::clone(&store));
    let router = InvalidationRouter::new(Arc::clone(&store));
    let key = track_key("42");
    let fetch = CountingFetch::gated(track("42", 10));
    let descriptor = fetch.descriptor(key.clone());

    let early = {
        let executor = executor.clone();
        let descriptor = descriptor.clone();
        tokio::spawn(async move { executor.run(&descriptor).await })
    };
    while fetch.calls() == 0 {
        tokio::task::yield_now().await;
    }

    let racing = executor.clone();
    let raced_key = key.clone();
    let opened = fetch.clone();
    let like = MutationDescriptor::<(), ()>::new("likeTrack", move |_vars, _signal| {
        opened.open();
        let executor = racing.clone();
        let key = raced_key.clone();
        async move {
            // Let the earlier fetch finish before the server answers.
            while executor.is_fetching(&key) {
                tokio::task::yield_now().await;
            }
            Ok(())
        }
    });
    let record = MutationRecord::new().optimistic(key.clone(), track("42", 11));
    executor.mutate(&router, &like, (), record).await.unwrap();

    assert_eq!(early.await.unwrap().unwrap().value(), &track("42", 10));
    executor.settle(&key).await;
    assert_cached(&store, &key, &track("42", 11));
    assert_stale(&store, &key);

    fetch.set_value(track("42", 11));
    let read = executor.run(&descriptor).await.unwrap();
    assert_source(&read, ReadSource::Network);
    assert_eq!(read.value(), &track("42", 11));
    assert_eq!(fetch.calls(), 2);
}

/// Cancelling the only interested caller stops the fetch and leaves the
/// cache untouched.
#[tokio::test]
async fn test_abandoned_fetch_leaves_cache_untouched() {
    let (store, _clock) = manual_store(MINUTE);
    let executor = QueryExecutor::new(Arc::clone(&store));
    let fetch = CountingFetch::gated(track("9", 9));
    let descriptor = fetch.descriptor(track_key("9"));
    let controller = cadence_query::AbortController::new();

    let scoped = {
        let executor = executor.clone();
        let descriptor = descriptor.clone();
        let signal = controller.signal();
        tokio::spawn(async move { executor.run_scoped(&descriptor, &signal).await })
    };
    while fetch.calls() == 0 {
        tokio::task::yield_now().await;
    }
    controller.abort();

    let result = scoped.await.unwrap();
    assert!(matches!(result, Err(FetchError::Cancelled)));
    executor.settle(&track_key("9")).await;
    let entry = store.peek(&track_key("9")).expect("entry created on start");
    assert_eq!(entry.status(), QueryStatus::Idle);
    assert!(entry.data().is_none());
}
