//! A store, its executor and router, wired to the graph API.
//!
//! Construct one session per process on the client and one per request on
//! the server. Views and pages talk to the session by operation name.

use cadence_core::{Clock, SystemClock};
use cadence_query::{
    spawn_default_gc, BoundaryScope, HydrationBoundary, InvalidationRouter, MutationRecord,
    QueryExecutor, QueryRead, QueryStore,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::graph::{GraphClient, GraphTransport};
use crate::operations::OperationCatalog;
use crate::render::{bootstrap, PageQuery};

#[derive(Debug)]
pub struct Session {
    executor: QueryExecutor,
    router: InvalidationRouter,
    boundary: HydrationBoundary,
    graph: GraphClient,
}

impl Session {
    pub fn new(config: &ClientConfig, transport: Arc<dyn GraphTransport>) -> ClientResult<Self> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &ClientConfig,
        transport: Arc<dyn GraphTransport>,
        clock: Arc<dyn Clock>,
    ) -> ClientResult<Self> {
        let catalog = config
            .stale_time_overrides()
            .try_fold(OperationCatalog::platform(), |catalog, (name, stale_time)| {
                catalog.with_stale_time(name, stale_time)
            })?;
        Self::from_parts(config, catalog, transport, clock)
    }

    pub fn from_parts(
        config: &ClientConfig,
        catalog: OperationCatalog,
        transport: Arc<dyn GraphTransport>,
        clock: Arc<dyn Clock>,
    ) -> ClientResult<Self> {
        catalog.validate()?;
        let store = QueryStore::new(clock, config.query_config());
        let router = InvalidationRouter::new(Arc::clone(&store));
        let targets = catalog.register_invalidations(&router);
        debug!(targets, "session invalidation targets registered");

        Ok(Self {
            executor: QueryExecutor::new(Arc::clone(&store)),
            router,
            boundary: HydrationBoundary::new(store),
            graph: GraphClient::new(transport, Arc::new(catalog)),
        })
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        self.executor.store()
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn router(&self) -> &InvalidationRouter {
        &self.router
    }

    pub fn graph(&self) -> &GraphClient {
        &self.graph
    }

    pub fn catalog(&self) -> &Arc<OperationCatalog> {
        self.graph.catalog()
    }

    /// Read a catalogue query through the cache.
    pub async fn query<T>(&self, operation: &str, variables: Value) -> ClientResult<QueryRead<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let descriptor = self.graph.query::<T>(operation, variables)?;
        Ok(self.executor.run(&descriptor).await?)
    }

    /// A page query for [`crate::render::prefetch_page`].
    pub fn page_query<T>(&self, operation: &str, variables: Value) -> ClientResult<PageQuery>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Ok(PageQuery::new(self.graph.query::<T>(operation, variables)?))
    }

    /// Run a catalogue mutation, invalidating its declared targets on success.
    pub async fn mutate<V, O>(
        &self,
        operation: &str,
        variables: V,
        record: MutationRecord,
    ) -> ClientResult<O>
    where
        V: Serialize + Clone + Send + 'static,
        O: DeserializeOwned + Send + 'static,
    {
        let descriptor = self.graph.mutation::<V, O>(operation)?;
        Ok(self
            .executor
            .mutate(&self.router, &descriptor, variables, record)
            .await?)
    }

    /// Apply the page payload (if any) and open the page's boundary.
    pub fn hydrate(&self, payload: Option<&str>) -> BoundaryScope {
        bootstrap(&self.boundary, payload)
    }

    /// Start periodic eviction with the configured interval and retention.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        spawn_default_gc(self.store())
    }
}
