//! Error types for CADENCE operations

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Rejections raised while building a [`crate::QueryKey`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Query key must contain at least one segment")]
    Empty,

    #[error("Query key must be a JSON array, got {found}")]
    NotAnArray { found: String },

    #[error("Invalid entity segment: {reason}")]
    InvalidEntity { reason: String },

    #[error("Unsupported key segment at {path}: {reason}")]
    UnsupportedSegment { path: String, reason: String },
}

/// One entry of a remote API's structured error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RemoteErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn join_messages(errors: &[RemoteErrorDetail]) -> String {
    if errors.is_empty() {
        return "no detail".to_string();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures of a fetch or mutate function.
///
/// Errors are cloned into every waiter of a shared execution and stored on
/// the cache entry, so the type is `Clone`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transient fetch failure: {reason}")]
    Transient { reason: String },

    #[error("Fetch timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Remote error: {}", join_messages(.errors))]
    Remote { errors: Vec<RemoteErrorDetail> },

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Failed to decode result for {key}: {reason}")]
    Decode { key: String, reason: String },
}

impl FetchError {
    /// Network-level failure eligible for automatic retry.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// A single structured remote failure.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            errors: vec![RemoteErrorDetail::new(message)],
        }
    }

    /// Whether the retry policy applies to this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Snapshot capture and transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Entry {key} could not be serialized: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Invalid snapshot payload: {reason}")]
    Payload { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all CADENCE errors.
#[derive(Debug, Clone, Error)]
pub enum CadenceError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for CADENCE operations.
pub type CadenceResult<T> = Result<T, CadenceError>;

// =============================================================================
// TESTS
// =============================================================================
