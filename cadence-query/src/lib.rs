//! Cadence query layer.
//!
//! A [`QueryStore`] caches results by [`QueryKey`]. The [`QueryExecutor`]
//! fills it, one fetch per key at a time. Snapshots carry a server-side
//! subset of the store to the client ([`dehydrate`], [`hydrate`],
//! [`HydrationBoundary`]), and the [`InvalidationRouter`] turns mutation
//! outcomes into stale entries.

pub mod boundary;
pub mod config;
pub mod descriptor;
pub mod entry;
pub mod executor;
pub mod filter;
pub mod gc;
pub mod invalidation;
pub mod read;
mod retry;
pub mod signal;
pub mod snapshot;
pub mod stats;
pub mod store;

pub use boundary::{BoundaryScope, HydrationBoundary};
pub use config::{QueryConfig, RetryPolicy};
pub use descriptor::{
    FetchFn, FetchFuture, MutateFn, MutationDescriptor, MutationId, QueryDescriptor, QueryPolicy,
    RefreshMode,
};
pub use entry::{CacheEntry, QueryData, QueryState, QueryStatus};
pub use executor::QueryExecutor;
pub use filter::KeyFilter;
pub use gc::{spawn_default_gc, spawn_gc};
pub use invalidation::{InvalidationRouter, MutationOutcome, MutationRecord, PendingMutation};
pub use read::{QueryRead, ReadSource};
pub use signal::{AbortController, AbortSignal};
pub use snapshot::{
    dehydrate, dehydrate_report, hydrate, Dehydration, HydrationReport, Snapshot, SnapshotEntry,
    SnapshotId,
};
pub use stats::CacheStats;
pub use store::{Listener, QueryStore, Subscription};

pub use cadence_core::{FetchError, QueryKey};
