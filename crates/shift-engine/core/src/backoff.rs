//! Exponential backoff with jitter.
//!
//! Retry state is an explicit attempt counter plus a computed delay; there
//! is no hidden global retry machinery. The delay follows
//! `min(base * 2^attempt, max) ± jitter`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::MigrationError;

/// Default base delay in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Default max delay in milliseconds (10 seconds).
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Default jitter factor (10%).
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Default max retries before giving up.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Reusable exponential backoff policy for transient store errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the delay (0.1 = ±10%).
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,

    /// Maximum retry attempts after the initial try.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_delay() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER_FACTOR
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl BackoffPolicy {
    /// Standard policy: 100ms base, 10s cap, ±10% jitter, 5 retries.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Aggressive policy for request-path retries: 20ms base, 500ms cap,
    /// ±20% jitter, 2 retries.
    pub fn aggressive() -> Self {
        Self {
            base_delay_ms: 20,
            max_delay_ms: 500,
            jitter_factor: 0.2,
            max_retries: 2,
        }
    }

    /// Zero-delay policy for tests.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn new(base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor,
            max_retries,
        }
    }

    /// Override the retry budget, keeping the delay curve.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the attempt following `retry_count` failures.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let raw = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        let delay = raw.min(self.max_delay_ms);

        let jitter_range = (delay as f64 * self.jitter_factor) as i64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        Duration::from_millis((delay as i64 + jitter).max(0) as u64)
    }

    /// Whether another retry is allowed after `retry_count` failures.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// All delays up to `max_retries`, for logging and tests.
    pub fn delay_schedule(&self) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|i| self.calculate_delay(i))
            .collect()
    }

    /// Run `op`, retrying retryable errors under this policy.
    ///
    /// Non-retryable errors pass through unchanged. Exhausting the retry
    /// budget yields [`MigrationError::RetriesExhausted`] carrying the last
    /// error's message.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, MigrationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MigrationError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if !self.can_retry(attempt) {
                        return Err(MigrationError::RetriesExhausted {
                            attempts: attempt + 1,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = self.calculate_delay(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
