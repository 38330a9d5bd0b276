//! Error types for the client layer.

use cadence_core::{FetchError, KeyError, SnapshotError};

use crate::config::ConfigLoadError;
use crate::guard::Role;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Config(#[from] ConfigLoadError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
    #[error("Role {role} is not permitted to request {operation}")]
    Forbidden { role: Role, operation: String },
    #[error("Invalid arguments: {0}")]
    Usage(String),
    #[error("Failed to initialize tracing: {0}")]
    Telemetry(String),
}

impl From<cadence_core::ConfigError> for ClientError {
    fn from(err: cadence_core::ConfigError) -> Self {
        Self::Config(ConfigLoadError::Invalid(err))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
