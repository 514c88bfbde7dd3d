//! # shift-engine-metrics
//!
//! Prometheus metrics for migration runs, batches, verification, and
//! rollbacks. Plugs into the engine through the
//! [`MigrationTelemetry`] seam.

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use shift_engine_core::migration::{MigrationPhase, RunId, SpecId};
use shift_engine_core::telemetry::MigrationTelemetry;
use shift_engine_core::verifier::Verdict;

/// Prometheus metrics implementation for the migration engine.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: prometheus::Registry,

    // Run lifecycle
    runs_started: prometheus::IntCounter,
    runs_failed: prometheus::IntCounter,
    rollbacks: prometheus::IntCounterVec,
    phase_transitions: prometheus::IntCounterVec,

    // Backfill
    batches_committed: prometheus::IntCounter,
    documents_processed: prometheus::IntCounter,
    documents_skipped: prometheus::IntCounter,
    documents_errored: prometheus::IntCounter,
    batch_duration: prometheus::Histogram,

    // Verification
    verifications: prometheus::IntCounterVec,
    verification_mismatches: prometheus::IntCounter,
}

impl PrometheusMetrics {
    /// Create metrics with default batch-duration buckets.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0])
    }

    /// Create metrics with custom batch-duration buckets.
    pub fn with_buckets(batch_buckets: Vec<f64>) -> Result<Self, prometheus::Error> {
        let registry = prometheus::Registry::new();

        let runs_started = prometheus::IntCounter::new(
            "shift_runs_started_total",
            "Total migration runs created",
        )?;
        registry.register(Box::new(runs_started.clone()))?;

        let runs_failed = prometheus::IntCounter::new(
            "shift_runs_failed_total",
            "Total migration runs marked failed",
        )?;
        registry.register(Box::new(runs_failed.clone()))?;

        let rollbacks = prometheus::IntCounterVec::new(
            prometheus::opts!("shift_rollbacks_total", "Total rollbacks by phase"),
            &["phase"],
        )?;
        registry.register(Box::new(rollbacks.clone()))?;

        let phase_transitions = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "shift_phase_transitions_total",
                "Phase transitions by entered phase"
            ),
            &["to"],
        )?;
        registry.register(Box::new(phase_transitions.clone()))?;

        let batches_committed = prometheus::IntCounter::new(
            "shift_batches_committed_total",
            "Backfill batches durably committed",
        )?;
        registry.register(Box::new(batches_committed.clone()))?;

        let documents_processed = prometheus::IntCounter::new(
            "shift_documents_processed_total",
            "Documents transformed and committed",
        )?;
        registry.register(Box::new(documents_processed.clone()))?;

        let documents_skipped = prometheus::IntCounter::new(
            "shift_documents_skipped_total",
            "Documents needing no backfill work",
        )?;
        registry.register(Box::new(documents_skipped.clone()))?;

        let documents_errored = prometheus::IntCounter::new(
            "shift_documents_errored_total",
            "Documents skipped because their transform failed",
        )?;
        registry.register(Box::new(documents_errored.clone()))?;

        let batch_duration = prometheus::Histogram::with_opts(prometheus::histogram_opts!(
            "shift_batch_duration_seconds",
            "Backfill batch duration in seconds",
            batch_buckets
        ))?;
        registry.register(Box::new(batch_duration.clone()))?;

        let verifications = prometheus::IntCounterVec::new(
            prometheus::opts!("shift_verifications_total", "Verification runs by verdict"),
            &["verdict"],
        )?;
        registry.register(Box::new(verifications.clone()))?;

        let verification_mismatches = prometheus::IntCounter::new(
            "shift_verification_mismatches_total",
            "Sampled documents failing verification",
        )?;
        registry.register(Box::new(verification_mismatches.clone()))?;

        Ok(Self {
            registry,
            runs_started,
            runs_failed,
            rollbacks,
            phase_transitions,
            batches_committed,
            documents_processed,
            documents_skipped,
            documents_errored,
            batch_duration,
            verifications,
            verification_mismatches,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn registry(&self) -> &prometheus::Registry {
        &self.registry
    }
}

impl MigrationTelemetry for PrometheusMetrics {
    fn on_run_started(&self, _run_id: &RunId, _spec_id: &SpecId) {
        self.runs_started.inc();
    }

    fn on_phase_changed(&self, _run_id: &RunId, _from: MigrationPhase, to: MigrationPhase) {
        self.phase_transitions
            .with_label_values(&[&to.to_string()])
            .inc();
    }

    fn on_batch_committed(
        &self,
        _run_id: &RunId,
        processed: u64,
        skipped: u64,
        errored: u64,
        duration: Duration,
    ) {
        self.batches_committed.inc();
        self.documents_processed.inc_by(processed);
        self.documents_skipped.inc_by(skipped);
        self.documents_errored.inc_by(errored);
        self.batch_duration.observe(duration.as_secs_f64());
    }

    fn on_verification_completed(&self, _run_id: &RunId, verdict: Verdict, mismatches: u64) {
        let label = match verdict {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
        };
        self.verifications.with_label_values(&[label]).inc();
        self.verification_mismatches.inc_by(mismatches);
    }

    fn on_rollback(&self, _run_id: &RunId, phase: MigrationPhase, _reason: &str) {
        self.rollbacks
            .with_label_values(&[&phase.to_string()])
            .inc();
    }

    fn on_run_failed(&self, _run_id: &RunId, _error: &str) {
        self.runs_failed.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_run_lifecycle_metrics() {
        let metrics = PrometheusMetrics::new().expect("metrics");
        let run_id = RunId::new();

        metrics.on_run_started(&run_id, &SpecId::new("spec"));
        metrics.on_phase_changed(&run_id, MigrationPhase::Pending, MigrationPhase::Expanding);
        metrics.on_batch_committed(&run_id, 10, 1, 2, Duration::from_millis(40));
        metrics.on_verification_completed(&run_id, Verdict::Fail, 3);
        metrics.on_rollback(&run_id, MigrationPhase::DualWriting, "bad data");
        metrics.on_run_failed(&run_id, "boom");

        let rendered = metrics.gather();
        assert!(rendered.contains("shift_runs_started_total 1"));
        assert!(rendered.contains("shift_documents_processed_total 10"));
        assert!(rendered.contains("shift_documents_errored_total 2"));
        assert!(rendered.contains("shift_verifications_total{verdict=\"fail\"} 1"));
        assert!(rendered.contains("shift_rollbacks_total{phase=\"dual_writing\"} 1"));
        assert!(rendered.contains("shift_runs_failed_total 1"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let metrics = PrometheusMetrics::new().expect("metrics");
        let err = metrics
            .registry()
            .register(Box::new(
                prometheus::IntCounter::new("shift_runs_started_total", "dup").expect("counter"),
            ))
            .unwrap_err();
        assert!(matches!(err, prometheus::Error::AlreadyReg));
    }
}
