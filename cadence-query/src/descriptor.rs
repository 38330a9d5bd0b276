//! Request and mutation descriptors.
//!
//! A descriptor is a pure value: an identity, the function that produces the
//! data, and the policy governing staleness and retries. Call sites build
//! descriptors and hand them to the [`crate::QueryExecutor`]; they never
//! touch the store.

use cadence_core::{FetchError, QueryKey};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::signal::AbortSignal;

/// Boxed future returned by fetch and mutate functions.
pub type FetchFuture<T> = BoxFuture<'static, Result<T, FetchError>>;

/// A fetch function: `(signal) -> Future<Result<T, FetchError>>`.
pub type FetchFn<T> = Arc<dyn Fn(AbortSignal) -> FetchFuture<T> + Send + Sync>;

/// A mutate function: `(variables, signal) -> Future<Result<O, FetchError>>`.
pub type MutateFn<V, O> = Arc<dyn Fn(V, AbortSignal) -> FetchFuture<O> + Send + Sync>;

/// How a read of a stale entry that still has data behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMode {
    /// Return the stale value at once and refresh in the background.
    #[default]
    StaleWhileRevalidate,
    /// Wait for the refresh before returning.
    Blocking,
}

/// Staleness, retry, and timeout policy of one descriptor.
///
/// `None` fields fall back to the store's [`crate::QueryConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPolicy {
    pub stale_time: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout; expiry counts as a transient failure.
    pub timeout: Option<Duration>,
    pub refresh: RefreshMode,
}

/// Describes one fetchable unit of data.
pub struct QueryDescriptor<T> {
    key: QueryKey,
    fetch: FetchFn<T>,
    policy: QueryPolicy,
}

impl<T> QueryDescriptor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<F, Fut>(key: QueryKey, fetch: F) -> Self
    where
        F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Self {
            key,
            fetch: Arc::new(move |signal: AbortSignal| fetch(signal).boxed()),
            policy: QueryPolicy::default(),
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.policy.stale_time = Some(stale_time);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.policy.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }

    /// Wait for refreshes of stale data instead of serving the stale value.
    pub fn blocking(mut self) -> Self {
        self.policy.refresh = RefreshMode::Blocking;
        self
    }

    pub fn with_policy(mut self, policy: QueryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<T> QueryDescriptor<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    pub(crate) fn fetch_fn(&self) -> FetchFn<T> {
        Arc::clone(&self.fetch)
    }
}

impl<T> Clone for QueryDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetch: Arc::clone(&self.fetch),
            policy: self.policy.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Name of a remote write operation, e.g. `"updateTrack"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(String);

impl MutationId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MutationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Describes one remote write.
///
/// Mutations are not retried unless a retry policy is set explicitly, since
/// most writes are not idempotent.
pub struct MutationDescriptor<V, O> {
    id: MutationId,
    mutate: MutateFn<V, O>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl<V, O> MutationDescriptor<V, O>
where
    V: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(id: impl Into<MutationId>, mutate: F) -> Self
    where
        F: Fn(V, AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FetchError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            mutate: Arc::new(move |variables: V, signal: AbortSignal| {
                mutate(variables, signal).boxed()
            }),
            retry: RetryPolicy::none(),
            timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<V, O> MutationDescriptor<V, O> {
    pub fn id(&self) -> &MutationId {
        &self.id
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn mutate_fn(&self) -> MutateFn<V, O> {
        Arc::clone(&self.mutate)
    }
}

impl<V, O> Clone for MutationDescriptor<V, O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            mutate: Arc::clone(&self.mutate),
            retry: self.retry.clone(),
            timeout: self.timeout,
        }
    }
}

impl<V, O> fmt::Debug for MutationDescriptor<V, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDescriptor")
            .field("id", &self.id)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
