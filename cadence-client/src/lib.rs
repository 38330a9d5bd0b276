//! CADENCE Client - Graph API Binding
//!
//! Connects the query layer to the platform's remote graph API:
//! - [`OperationCatalog`]: every named query and mutation, with its staleness
//!   window, permitted roles and invalidation targets
//! - [`GraphClient`]: turns catalogue operations into query and mutation
//!   descriptors over a [`GraphTransport`]
//! - [`Session`]: one store with its executor, router and boundary
//! - [`prefetch_page`] and [`bootstrap`]: the server-render and client-boot
//!   halves of hydration

pub mod config;
pub mod error;
pub mod graph;
pub mod guard;
pub mod operations;
pub mod render;
pub mod session;
pub mod telemetry;

pub use config::{CacheSettings, ClientConfig, ConfigLoadError, LoggingConfig, RetrySettings};
pub use error::{ClientError, ClientResult};
pub use graph::{
    classify_status, operation_key, GraphClient, GraphRequest, GraphResponse, GraphTransport,
    HttpTransport, WireError,
};
pub use guard::{AllowAll, CatalogGuard, Role, RoleGuard};
pub use operations::{
    MutationOperation, OperationCatalog, QueryOperation, PLATFORM_MUTATIONS, PLATFORM_QUERIES,
};
pub use render::{bootstrap, prefetch_page, PageQuery, RenderedPage};
pub use session::Session;
pub use telemetry::init_tracing;
