//! Orchestrator configuration.

use crate::backoff::BackoffPolicy;
use crate::router::RouterConfig;
use crate::verifier::VerifierConfig;
use std::time::Duration;

/// Configuration for the migration orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Re-reads after a lost CAS before giving up with a conflict error.
    pub cas_retry_limit: u32,
    /// Backoff used before a run's own policy is known (initial loads,
    /// pause/resume bookkeeping).
    pub retry: BackoffPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cas_retry_limit: 5,
            retry: BackoffPolicy::standard(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cas_retry_limit(mut self, limit: u32) -> Self {
        self.cas_retry_limit = limit;
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Environment-based configuration loader.
#[derive(Debug, Clone)]
pub struct EnvConfig;

impl EnvConfig {
    /// Load [`OrchestratorConfig`] from `SHIFT_*` environment variables.
    pub fn load_orchestrator_config() -> OrchestratorConfig {
        OrchestratorConfig::new().with_cas_retry_limit(
            std::env::var("SHIFT_CAS_RETRY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        )
    }

    /// Load [`RouterConfig`] from `SHIFT_*` environment variables.
    pub fn load_router_config() -> RouterConfig {
        RouterConfig::new()
            .with_request_timeout(Duration::from_millis(
                std::env::var("SHIFT_ROUTER_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5_000),
            ))
            .with_max_retries(
                std::env::var("SHIFT_ROUTER_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2),
            )
    }

    /// Load [`VerifierConfig`] from `SHIFT_*` environment variables.
    pub fn load_verifier_config() -> VerifierConfig {
        VerifierConfig::new()
            .with_sample_rate(
                std::env::var("SHIFT_VERIFY_SAMPLE_RATE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.1),
            )
            .with_tolerance(
                std::env::var("SHIFT_VERIFY_TOLERANCE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            )
    }
}

// ============================================================================
// Tests
// ============================================================================
