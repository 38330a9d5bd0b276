//! Store-wide defaults.

use std::time::Duration;

/// Bounded exponential backoff for transient fetch failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per further attempt.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(scaled).unwrap_or(self.max_delay)
    }
}

/// Configuration for a [`crate::QueryStore`] and the executor driving it.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Staleness window for descriptors that do not set one.
    pub default_stale_time: Duration,
    /// Staleness window given to entries installed from a snapshot.
    pub hydration_stale_time: Duration,
    /// Retry policy for descriptors that do not set one.
    pub retry: RetryPolicy,
    /// Entries unread for longer than this are eligible for eviction.
    pub gc_retention: Duration,
    /// How often the background collector runs.
    pub gc_interval: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_stale_time: Duration::ZERO,
            hydration_stale_time: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            gc_retention: Duration::from_secs(300), // 5 minutes
            gc_interval: Duration::from_secs(60),
        }
    }
}

impl QueryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_time(mut self, duration: Duration) -> Self {
        self.default_stale_time = duration;
        self
    }

    pub fn with_hydration_stale_time(mut self, duration: Duration) -> Self {
        self.hydration_stale_time = duration;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_gc_retention(mut self, retention: Duration) -> Self {
        self.gc_retention = retention;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}
