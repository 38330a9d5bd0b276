//! Results of executor reads, carrying freshness metadata.

use cadence_core::Timestamp;
use std::sync::Arc;
use std::time::Duration;

/// Where a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Fresh cache entry, no fetch.
    Cache,
    /// Stale cache entry, refresh running in the background.
    Stale,
    /// Waited for a fetch (started by this caller or shared with others).
    Network,
}

/// Result of [`crate::QueryExecutor::run`].
///
/// The wrapper keeps callers aware of how old the value is.
#[derive(Debug, Clone)]
pub struct QueryRead<T> {
    value: Arc<T>,
    updated_at: Timestamp,
    source: ReadSource,
}

impl<T> QueryRead<T> {
    pub fn from_cache(value: Arc<T>, updated_at: Timestamp) -> Self {
        Self {
            value,
            updated_at,
            source: ReadSource::Cache,
        }
    }

    pub fn stale(value: Arc<T>, updated_at: Timestamp) -> Self {
        Self {
            value,
            updated_at,
            source: ReadSource::Stale,
        }
    }

    pub fn from_network(value: Arc<T>, updated_at: Timestamp) -> Self {
        Self {
            value,
            updated_at,
            source: ReadSource::Network,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// True unless the caller waited for a fetch.
    pub fn was_cache_hit(&self) -> bool {
        self.source != ReadSource::Network
    }

    /// True if the value was past its staleness deadline when read.
    pub fn is_stale(&self) -> bool {
        self.source == ReadSource::Stale
    }

    /// Age of the value at `now`.
    pub fn staleness(&self, now: Timestamp) -> Duration {
        (now - self.updated_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn map<U, F>(self, f: F) -> QueryRead<U>
    where
        F: FnOnce(Arc<T>) -> Arc<U>,
    {
        QueryRead {
            value: f(self.value),
            updated_at: self.updated_at,
            source: self.source,
        }
    }
}

impl<T> AsRef<T> for QueryRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
