//! # Telemetry
//!
//! Tracing integration for the migration engine, plus the
//! [`MigrationTelemetry`] seam that metrics adapters implement.

use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::migration::{MigrationPhase, RunId, SpecId};
use crate::verifier::Verdict;

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for tracing.
    pub service_name: String,
    /// Service version.
    pub service_version: String,
    /// Log level filter.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "shift-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Telemetry guard, kept alive for the lifetime of the process.
pub struct TelemetryGuard;

impl TelemetryGuard {
    pub fn shutdown(self) {}
}

/// Initialize tracing for the engine.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::new(&config.log_level);

    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "telemetry initialized"
    );

    TelemetryGuard
}

/// Instrumentation hooks emitted by the engine components.
///
/// The default implementation logs through `tracing`;
/// `shift-engine-metrics` provides a Prometheus-backed one.
pub trait MigrationTelemetry: Send + Sync {
    /// A run was created.
    fn on_run_started(&self, run_id: &RunId, spec_id: &SpecId);

    /// A phase transition committed.
    fn on_phase_changed(&self, run_id: &RunId, from: MigrationPhase, to: MigrationPhase);

    /// A backfill batch committed durably.
    fn on_batch_committed(
        &self,
        run_id: &RunId,
        processed: u64,
        skipped: u64,
        errored: u64,
        duration: Duration,
    );

    /// The verifier produced a report.
    fn on_verification_completed(&self, run_id: &RunId, verdict: Verdict, mismatches: u64);

    /// The run was rolled back.
    fn on_rollback(&self, run_id: &RunId, phase: MigrationPhase, reason: &str);

    /// The run was marked failed.
    fn on_run_failed(&self, run_id: &RunId, error: &str);
}

/// Telemetry that only emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl MigrationTelemetry for TracingTelemetry {
    fn on_run_started(&self, run_id: &RunId, spec_id: &SpecId) {
        tracing::info!(%run_id, %spec_id, "migration run started");
    }

    fn on_phase_changed(&self, run_id: &RunId, from: MigrationPhase, to: MigrationPhase) {
        tracing::info!(%run_id, %from, %to, "migration phase changed");
    }

    fn on_batch_committed(
        &self,
        run_id: &RunId,
        processed: u64,
        skipped: u64,
        errored: u64,
        duration: Duration,
    ) {
        tracing::debug!(
            %run_id,
            processed,
            skipped,
            errored,
            duration_ms = duration.as_millis() as u64,
            "backfill batch committed"
        );
    }

    fn on_verification_completed(&self, run_id: &RunId, verdict: Verdict, mismatches: u64) {
        tracing::info!(%run_id, ?verdict, mismatches, "verification completed");
    }

    fn on_rollback(&self, run_id: &RunId, phase: MigrationPhase, reason: &str) {
        tracing::warn!(%run_id, %phase, reason, "migration rolled back");
    }

    fn on_run_failed(&self, run_id: &RunId, error: &str) {
        tracing::error!(%run_id, error, "migration run failed");
    }
}
