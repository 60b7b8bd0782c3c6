use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Endpoint-level configuration for the dispatch pipeline.
///
/// Controls concurrency, timeouts, retry of transient failures and the saga
/// bookkeeping windows. Loadable from JSON; missing fields take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Address of the receive endpoint this pipeline serves.
    pub endpoint: String,
    /// Maximum number of dispatches in flight before load shedding.
    pub max_concurrent_dispatches: u32,
    /// Per-attempt dispatch timeout in milliseconds. 0 disables the timeout.
    pub dispatch_timeout_ms: u64,
    /// How long a pessimistic repository waits for a row lock.
    pub lock_timeout_ms: u64,
    /// Number of applied message ids remembered per saga instance.
    pub idempotency_window: usize,
    /// Capacity of the cache of message ids whose redelivery limit was reached.
    pub exhausted_redelivery_capacity: usize,
    /// Bounded queue capacity per in-memory endpoint.
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: "input".to_string(),
            max_concurrent_dispatches: 64,
            dispatch_timeout_ms: 30_000,
            lock_timeout_ms: 5_000,
            idempotency_window: 32,
            exhausted_redelivery_capacity: 10_000,
            queue_capacity: 256,
            retry: RetryConfig::default(),
        }
    }
}

impl BusConfig {
    /// Parses a configuration from JSON, filling unspecified fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not a valid configuration document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        (self.dispatch_timeout_ms > 0).then(|| Duration::from_millis(self.dispatch_timeout_ms))
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Retry of transient dispatch failures (conflicts, lock timeouts, overload).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. 0 disables retry.
    pub limit: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Randomize each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: 3,
            initial_interval_ms: 10,
            max_interval_ms: 1_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            limit: 0,
            ..Self::default()
        }
    }

    /// Immediate retries without delay.
    #[must_use]
    pub fn immediate(limit: u32) -> Self {
        Self {
            limit,
            initial_interval_ms: 0,
            max_interval_ms: 0,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based): exponential from
    /// `initial_interval_ms`, capped at `max_interval_ms`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let millis = self
            .initial_interval_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_interval_ms);
        if self.jitter && millis > 1 {
            Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
        } else {
            Duration::from_millis(millis)
        }
    }
}
