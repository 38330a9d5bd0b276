//! Server-render entry point and client bootstrap.
//!
//! On the server a page asks for its queries to be prefetched, captures the
//! results as a snapshot and embeds the payload in the page. On the client
//! the payload is parsed and handed to a [`HydrationBoundary`] before any
//! view reads the store.

use cadence_core::{FetchError, QueryKey, SnapshotError};
use cadence_query::{
    dehydrate_report, BoundaryScope, Dehydration, HydrationBoundary, KeyFilter, QueryDescriptor,
    QueryExecutor, Snapshot,
};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::error::{ClientError, ClientResult};
use crate::guard::{Role, RoleGuard};

type PrefetchFn = Box<dyn FnOnce(QueryExecutor) -> BoxFuture<'static, Result<(), FetchError>> + Send>;

/// One query a page needs before it renders, with its result type erased.
pub struct PageQuery {
    key: QueryKey,
    prefetch: PrefetchFn,
}

impl PageQuery {
    pub fn new<T>(descriptor: QueryDescriptor<T>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self {
            key: descriptor.key().clone(),
            prefetch: Box::new(move |executor: QueryExecutor| {
                async move { executor.prefetch(&descriptor).await }.boxed()
            }),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl<T> From<QueryDescriptor<T>> for PageQuery
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn from(descriptor: QueryDescriptor<T>) -> Self {
        Self::new(descriptor)
    }
}

impl fmt::Debug for PageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageQuery")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// What the server embeds in a rendered page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub snapshot: Snapshot,
    /// Snapshot encoded for a `<script>` element.
    pub payload: String,
    /// Queries that failed; the client fetches them itself.
    pub failed: Vec<(QueryKey, FetchError)>,
    /// Entries left out because they could not be serialized.
    pub excluded: Vec<SnapshotError>,
}

/// Prefetch every query of a page and capture them in one snapshot.
///
/// The guard is consulted for every query before any request is issued; a
/// single refusal fails the page. Individual fetch failures do not: those
/// entries are simply missing from the snapshot.
pub async fn prefetch_page(
    executor: &QueryExecutor,
    guard: &dyn RoleGuard,
    role: Role,
    queries: Vec<PageQuery>,
) -> ClientResult<RenderedPage> {
    if let Some(refused) = queries.iter().find(|q| !guard.permits(role, &q.key)) {
        return Err(ClientError::Forbidden {
            role,
            operation: refused.key.entity().to_string(),
        });
    }

    let keys: Vec<QueryKey> = queries.iter().map(|q| q.key.clone()).collect();
    let results = join_all(queries.into_iter().map(|query| {
        let PageQuery { key, prefetch } = query;
        let run = prefetch(executor.clone());
        async move { (key, run.await) }
    }))
    .await;

    let failed: Vec<(QueryKey, FetchError)> = results
        .into_iter()
        .filter_map(|(key, result)| result.err().map(|err| (key, err)))
        .collect();
    for (key, err) in &failed {
        warn!(key = %key, error = %err, "prefetch failed, left for the client");
    }

    let filter = KeyFilter::predicate(move |key| keys.contains(key));
    let Dehydration { snapshot, excluded } = dehydrate_report(executor.store(), &filter)?;
    let payload = snapshot.to_payload()?;
    info!(
        role = %role,
        snapshot = %snapshot.id(),
        entries = snapshot.len(),
        failed = failed.len(),
        bytes = payload.len(),
        "page prefetched"
    );
    Ok(RenderedPage {
        snapshot,
        payload,
        failed,
        excluded,
    })
}

/// Apply an embedded payload and open the page's boundary.
///
/// A missing or unreadable payload is not fatal: the scope then reads the
/// store as it is and views fetch what they need.
pub fn bootstrap(boundary: &HydrationBoundary, payload: Option<&str>) -> BoundaryScope {
    let snapshot = payload.and_then(|payload| match Snapshot::from_payload(payload) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(error = %err, "discarding unreadable snapshot payload");
            None
        }
    });
    boundary.enter(snapshot.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::AllowAll;
    use cadence_query::{QueryState, QueryStore};
    use std::sync::Arc;

    fn track_descriptor(id: &str, name: &'static str) -> QueryDescriptor<String> {
        let key = QueryKey::new("track").unwrap().arg(id);
        QueryDescriptor::new(key, move |_signal| async move { Ok(name.to_string()) })
    }

    struct DenyAll;

    impl RoleGuard for DenyAll {
        fn permits(&self, _role: Role, _key: &QueryKey) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_prefetch_then_bootstrap_reads_without_fetching() {
        let server = QueryExecutor::new(QueryStore::with_defaults());
        let page = prefetch_page(
            &server,
            &AllowAll,
            Role::Listener,
            vec![track_descriptor("1", "One").into(), track_descriptor("2", "Two").into()],
        )
        .await
        .unwrap();
        assert_eq!(page.snapshot.len(), 2);
        assert!(page.failed.is_empty());

        let client = QueryStore::with_defaults();
        let boundary = HydrationBoundary::new(Arc::clone(&client));
        let scope = bootstrap(&boundary, Some(&page.payload));
        let key = QueryKey::new("track").unwrap().arg("2");
        match scope.read::<String>(&key) {
            QueryState::Success { data, .. } => assert_eq!(*data, "Two"),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(client.stats().fetches, 0);
    }

    #[tokio::test]
    async fn test_refused_query_issues_no_requests() {
        let server = QueryExecutor::new(QueryStore::with_defaults());
        let result = prefetch_page(
            &server,
            &DenyAll,
            Role::Listener,
            vec![track_descriptor("1", "One").into()],
        )
        .await;
        assert!(matches!(result, Err(ClientError::Forbidden { .. })));
        assert_eq!(server.store().stats().fetches, 0);
    }

    #[tokio::test]
    async fn test_failed_query_is_left_out_of_snapshot() {
        let server = QueryExecutor::new(QueryStore::with_defaults());
        let broken = QueryDescriptor::<String>::new(
            QueryKey::new("track").unwrap().arg("bad"),
            |_signal| async { Err(FetchError::remote("gone")) },
        );
        let page = prefetch_page(
            &server,
            &AllowAll,
            Role::Admin,
            vec![track_descriptor("1", "One").into(), broken.into()],
        )
        .await
        .unwrap();
        assert_eq!(page.snapshot.len(), 1);
        assert_eq!(page.failed.len(), 1);
    }

    #[test]
    fn test_bootstrap_survives_garbage_payload() {
        let boundary = HydrationBoundary::new(QueryStore::with_defaults());
        let scope = bootstrap(&boundary, Some("{not json"));
        assert!(scope.snapshot_id().is_none());
    }
}
