//! Configuration loading for Cadence clients.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use cadence_core::ConfigError;
use cadence_query::{QueryConfig, RetryPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Graph API endpoint every operation is POSTed to.
    pub endpoint: String,
    pub request_timeout_ms: u64,
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub logging: LoggingConfig,
    /// Optional per-operation staleness overrides, in milliseconds.
    #[serde(default)]
    pub stale_times: BTreeMap<String, u64>,
    /// Optional static headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    pub default_stale_time_ms: u64,
    pub hydration_stale_time_ms: u64,
    pub gc_retention_ms: u64,
    pub gc_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Missing configuration file path (use --config or CADENCE_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigLoadError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigLoadError> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "endpoint".to_string(),
            });
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(invalid("endpoint", endpoint, "must be an http(s) URL"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", 0, "must be > 0"));
        }
        if self.cache.gc_interval_ms == 0 {
            return Err(invalid("cache.gc_interval_ms", 0, "must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", 0, "must be >= 1"));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(invalid("retry.base_delay_ms", 0, "must be > 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid(
                "retry.max_delay_ms",
                self.retry.max_delay_ms,
                "must be >= base_delay_ms",
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid(
                "retry.multiplier",
                self.retry.multiplier,
                "must be >= 1.0",
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "logging.level".to_string(),
            });
        }
        for name in self.headers.keys() {
            if name.trim().is_empty() {
                return Err(invalid("headers", name, "header names must not be empty"));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Store configuration derived from the `[cache]` and `[retry]` tables.
    pub fn query_config(&self) -> QueryConfig {
        QueryConfig::new()
            .with_stale_time(Duration::from_millis(self.cache.default_stale_time_ms))
            .with_hydration_stale_time(Duration::from_millis(self.cache.hydration_stale_time_ms))
            .with_gc_retention(Duration::from_millis(self.cache.gc_retention_ms))
            .with_gc_interval(Duration::from_millis(self.cache.gc_interval_ms))
            .with_retry(self.retry_policy())
    }

    pub fn stale_time_overrides(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.stale_times
            .iter()
            .map(|(name, ms)| (name.as_str(), Duration::from_millis(*ms)))
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("CADENCE_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
