//! # Migration Orchestrator
//!
//! Drives the phase state machine for migration runs. Every transition is
//! a compare-and-swap on the run's version: concurrent orchestrator
//! instances can race on the same run, exactly one wins each step, and
//! losers transparently re-read and retry.

pub mod config;

pub use config::{EnvConfig, OrchestratorConfig};

use std::sync::Arc;

use chrono::Utc;

use crate::backoff::BackoffPolicy;
use crate::error::{MigrationError, Result};
use crate::migration::{
    MigrationPhase, MigrationRun, MigrationSpec, RunId, RunStatus, RunStatusView,
};
use crate::port::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::port::document_store::DocumentStore;
use crate::port::flag_store::FlagStore;
use crate::port::run_store::{cas_update, load_run, RunStore};
use crate::rollback::RollbackController;
use crate::router::{flag_for_phase, set_routing_flag};
use crate::telemetry::{MigrationTelemetry, TracingTelemetry};

/// Coordinates run lifecycle: creation, phase transitions, pause/resume,
/// rollback delegation, and the status API.
pub struct MigrationOrchestrator<R, D, F, A>
where
    R: RunStore + 'static,
    D: DocumentStore + 'static,
    F: FlagStore + 'static,
    A: AuditSink + 'static,
{
    config: OrchestratorConfig,
    run_store: Arc<R>,
    document_store: Arc<D>,
    flag_store: Arc<F>,
    audit: Arc<A>,
    rollback: RollbackController<R, F, A>,
    telemetry: Arc<dyn MigrationTelemetry>,
}

impl<R, D, F, A> MigrationOrchestrator<R, D, F, A>
where
    R: RunStore + 'static,
    D: DocumentStore + 'static,
    F: FlagStore + 'static,
    A: AuditSink + 'static,
{
    pub fn new(
        config: OrchestratorConfig,
        run_store: Arc<R>,
        document_store: Arc<D>,
        flag_store: Arc<F>,
        audit: Arc<A>,
    ) -> Self {
        let rollback =
            RollbackController::new(run_store.clone(), flag_store.clone(), audit.clone());
        Self {
            config,
            run_store,
            document_store,
            flag_store,
            audit,
            rollback,
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn MigrationTelemetry>) -> Self {
        self.rollback = self.rollback.with_telemetry(telemetry.clone());
        self.telemetry = telemetry;
        self
    }

    /// Create a run for `spec` in the Pending phase.
    ///
    /// Rejected when any target collection already has a non-terminal run
    /// (one in-flight migration per collection, a deliberate restriction)
    /// or already contains new-schema documents.
    pub async fn start(&self, spec: MigrationSpec) -> Result<RunId> {
        spec.validate()?;
        let policy = spec.retry_policy();

        for collection in &spec.collections {
            let active = policy
                .retry("run_store.find_active", || async move {
                    self.run_store
                        .find_active(collection)
                        .await
                        .map_err(MigrationError::from_run_store)
                })
                .await?;
            if let Some(active) = active {
                return Err(MigrationError::ConcurrentRun {
                    collection: collection.clone(),
                    run_id: active.id,
                });
            }

            let mutated = policy
                .retry("document_store.count_new_shape", || async move {
                    self.document_store
                        .count_new_shape(collection)
                        .await
                        .map_err(MigrationError::from_document_store)
                })
                .await?;
            if mutated > 0 {
                return Err(MigrationError::CollectionNotPristine {
                    collection: collection.clone(),
                });
            }
        }

        let run = MigrationRun::new(spec);
        policy
            .retry("run_store.create", || {
                let run = run.clone();
                async move {
                    self.run_store
                        .create(&run)
                        .await
                        .map_err(MigrationError::from_run_store)
                }
            })
            .await?;

        for collection in &run.spec.collections {
            set_routing_flag(
                self.flag_store.as_ref(),
                collection,
                flag_for_phase(&run.id, MigrationPhase::Pending),
                &policy,
                self.config.cas_retry_limit,
            )
            .await?;
        }

        self.append_audit(
            &policy,
            AuditRecord::new(
                run.id.clone(),
                AuditEvent::RunStarted {
                    spec_id: run.spec.id.clone(),
                },
            ),
        )
        .await?;
        self.telemetry.on_run_started(&run.id, &run.spec.id);
        tracing::info!(run_id = %run.id, spec_id = %run.spec.id, "migration run created");
        Ok(run.id)
    }

    /// Attempt one idempotent step of the phase machine.
    ///
    /// Verifies the current phase's exit condition, then CAS-updates
    /// phase and version. Returns the (possibly unchanged) phase: a run
    /// whose exit condition is not yet met keeps its phase, and a
    /// terminal run is returned as-is.
    ///
    /// # Errors
    ///
    /// - [`MigrationError::VerificationFailed`] when Verifying holds a
    ///   failing report.
    /// - [`MigrationError::PhaseTransitionConflict`] when the CAS retry
    ///   budget is exhausted against concurrent orchestrators.
    pub async fn advance(&self, run_id: &RunId) -> Result<MigrationPhase> {
        let mut cas_attempts: u32 = 0;
        loop {
            let run = load_run(self.run_store.as_ref(), run_id, &self.config.retry).await?;
            if run.is_terminal() {
                return Ok(run.phase);
            }
            match run.status {
                RunStatus::Paused => {
                    return Err(MigrationError::InvalidState(format!(
                        "run {run_id} is paused"
                    )));
                }
                RunStatus::Failed => {
                    return Err(MigrationError::InvalidState(format!(
                        "run {run_id} is failed; resume it before advancing"
                    )));
                }
                _ => {}
            }
            let policy = run.spec.retry_policy();

            let Some(next) = next_phase(&run)? else {
                tracing::debug!(%run_id, phase = %run.phase, "exit condition not met, phase unchanged");
                return Ok(run.phase);
            };

            let mut updated = run.clone();
            updated.phase = next;
            updated.updated_at = Utc::now();
            if next == MigrationPhase::Backfilling {
                updated.counts.expected = match self.total_documents(&run, &policy).await {
                    Ok(total) => total,
                    Err(err) => return Err(self.fail_on_exhaustion(run_id, &policy, err).await),
                };
            }
            if next == MigrationPhase::Completed {
                updated.status = if updated.counts.errored > 0 {
                    RunStatus::CompletedWithWarnings
                } else {
                    RunStatus::Completed
                };
            }

            let attempt = policy
                .retry("run_store.update", || {
                    let updated = updated.clone();
                    async move {
                        self.run_store
                            .update(&updated, run.version)
                            .await
                            .map_err(MigrationError::from_run_store)
                    }
                })
                .await;

            match attempt {
                Ok(stored) => {
                    // routing follows the phase just entered; each flag
                    // write is an atomic CAS, and a re-run of advance
                    // converges if this step is interrupted
                    for collection in &stored.spec.collections {
                        set_routing_flag(
                            self.flag_store.as_ref(),
                            collection,
                            flag_for_phase(&stored.id, next),
                            &policy,
                            self.config.cas_retry_limit,
                        )
                        .await?;
                    }
                    self.append_audit(
                        &policy,
                        AuditRecord::new(
                            stored.id.clone(),
                            AuditEvent::PhaseChanged {
                                from: run.phase,
                                to: next,
                            },
                        ),
                    )
                    .await?;
                    self.telemetry.on_phase_changed(run_id, run.phase, next);
                    tracing::info!(%run_id, from = %run.phase, to = %next, "phase advanced");
                    return Ok(next);
                }
                Err(MigrationError::PhaseTransitionConflict { expected, actual }) => {
                    if cas_attempts >= self.config.cas_retry_limit {
                        return Err(MigrationError::PhaseTransitionConflict { expected, actual });
                    }
                    cas_attempts += 1;
                    tracing::debug!(%run_id, expected, actual, "lost phase CAS, re-reading");
                }
                Err(err) => {
                    let err = self.fail_on_exhaustion(run_id, &policy, err).await;
                    return Err(err);
                }
            }
        }
    }

    /// Suspend a run without touching its checkpoint. The backfill worker
    /// honors the pause between batches.
    pub async fn pause(&self, run_id: &RunId) -> Result<RunStatusView> {
        let stored = cas_update(
            self.run_store.as_ref(),
            run_id,
            &self.config.retry,
            self.config.cas_retry_limit,
            |run| {
                if run.is_terminal() {
                    return Err(MigrationError::InvalidState(format!(
                        "run {} is terminal and cannot be paused",
                        run.id
                    )));
                }
                if run.status == RunStatus::Failed {
                    return Err(MigrationError::InvalidState(format!(
                        "run {} is failed; resume it instead",
                        run.id
                    )));
                }
                run.status = RunStatus::Paused;
                Ok(())
            },
        )
        .await?;
        self.append_audit(
            &stored.spec.retry_policy(),
            AuditRecord::new(stored.id.clone(), AuditEvent::Paused),
        )
        .await?;
        tracing::info!(%run_id, "run paused");
        Ok(stored.view())
    }

    /// Continue a paused run, or reactivate a failed one from its intact
    /// checkpoint once the underlying cause is fixed.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunStatusView> {
        let stored = cas_update(
            self.run_store.as_ref(),
            run_id,
            &self.config.retry,
            self.config.cas_retry_limit,
            |run| {
                match run.status {
                    RunStatus::Paused | RunStatus::Failed => {
                        run.status = RunStatus::Active;
                        Ok(())
                    }
                    RunStatus::Active => Ok(()),
                    _ => Err(MigrationError::InvalidState(format!(
                        "run {} is {} and cannot be resumed",
                        run.id, run.status
                    ))),
                }
            },
        )
        .await?;
        self.append_audit(
            &stored.spec.retry_policy(),
            AuditRecord::new(stored.id.clone(), AuditEvent::Resumed),
        )
        .await?;
        tracing::info!(%run_id, "run resumed");
        Ok(stored.view())
    }

    /// Emergency reversal; see [`RollbackController::rollback`].
    pub async fn rollback(&self, run_id: &RunId, reason: &str) -> Result<RunStatusView> {
        self.rollback.rollback(run_id, reason).await
    }

    /// Status API: phase, counts, checkpoint, and last error.
    pub async fn status(&self, run_id: &RunId) -> Result<RunStatusView> {
        let run = load_run(self.run_store.as_ref(), run_id, &self.config.retry).await?;
        Ok(run.view())
    }

    async fn total_documents(&self, run: &MigrationRun, policy: &BackoffPolicy) -> Result<u64> {
        let mut total = 0u64;
        for collection in &run.spec.collections {
            total += policy
                .retry("document_store.count", || async move {
                    self.document_store
                        .count(collection)
                        .await
                        .map_err(MigrationError::from_document_store)
                })
                .await?;
        }
        Ok(total)
    }

    async fn append_audit(&self, policy: &BackoffPolicy, record: AuditRecord) -> Result<()> {
        policy
            .retry("audit.append", || {
                let record = record.clone();
                async move {
                    self.audit
                        .append(record)
                        .await
                        .map_err(MigrationError::from_audit)
                }
            })
            .await
    }

    /// Exhausted retries set status Failed while preserving phase and
    /// checkpoint for manual resume; other errors pass through untouched.
    async fn fail_on_exhaustion(
        &self,
        run_id: &RunId,
        policy: &BackoffPolicy,
        err: MigrationError,
    ) -> MigrationError {
        if !matches!(err, MigrationError::RetriesExhausted { .. }) {
            return err;
        }
        let message = err.to_string();
        let marked = cas_update(
            self.run_store.as_ref(),
            run_id,
            policy,
            self.config.cas_retry_limit,
            |run| {
                run.status = RunStatus::Failed;
                run.last_error = Some(message.clone());
                Ok(())
            },
        )
        .await;
        match marked {
            Ok(_) => {
                let record = AuditRecord::new(
                    run_id.clone(),
                    AuditEvent::RunFailed {
                        error: message.clone(),
                    },
                );
                if let Err(audit_err) = self.audit.append(record).await {
                    tracing::error!(%run_id, error = ?audit_err, "failed to audit run failure");
                }
                self.telemetry.on_run_failed(run_id, &message);
            }
            Err(mark_err) => {
                tracing::error!(%run_id, error = %mark_err, "failed to record run failure");
            }
        }
        err
    }
}

/// The phase to enter next, `None` while the current phase's exit
/// condition is not met.
fn next_phase(run: &MigrationRun) -> Result<Option<MigrationPhase>> {
    let next = match run.phase {
        MigrationPhase::Pending => MigrationPhase::Expanding,
        MigrationPhase::Expanding => MigrationPhase::Backfilling,
        MigrationPhase::Backfilling => {
            if !run.checkpoint.is_complete() {
                return Ok(None);
            }
            MigrationPhase::DualWriting
        }
        MigrationPhase::DualWriting => MigrationPhase::Verifying,
        MigrationPhase::Verifying => match &run.verification {
            Some(report) if report.verdict.is_pass() => MigrationPhase::Contracting,
            Some(report) => {
                return Err(MigrationError::VerificationFailed {
                    mismatches: report.mismatch_count,
                    sample_size: report.sample_size,
                });
            }
            None => {
                return Err(MigrationError::InvalidState(
                    "contracting requires a passing verification report; run the verifier".into(),
                ));
            }
        },
        MigrationPhase::Contracting => MigrationPhase::Completed,
        MigrationPhase::Completed | MigrationPhase::RolledBack => return Ok(None),
    };
    Ok(Some(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{Checkpoint, CollectionId};
    use crate::transform::TransformId;
    use crate::verifier::{Verdict, VerificationReport};

    fn run_in(phase: MigrationPhase) -> MigrationRun {
        let mut run = MigrationRun::new(MigrationSpec::new(
            "spec",
            vec![CollectionId::new("contracts")],
            TransformId::new("t"),
        ));
        run.phase = phase;
        run
    }

    #[test]
    fn backfilling_holds_until_checkpoint_complete() {
        let mut run = run_in(MigrationPhase::Backfilling);
        assert_eq!(next_phase(&run).ok(), Some(None));

        run.checkpoint = Checkpoint::Complete { last_key: None };
        assert_eq!(
            next_phase(&run).ok(),
            Some(Some(MigrationPhase::DualWriting))
        );
    }

    #[test]
    fn verifying_requires_passing_report() {
        let mut run = run_in(MigrationPhase::Verifying);
        assert!(matches!(
            next_phase(&run),
            Err(MigrationError::InvalidState(_))
        ));

        let mut report = VerificationReport {
            run_id: run.id.clone(),
            total_documents: 10,
            migrated_documents: 10,
            sample_size: 10,
            mismatch_count: 1,
            mismatches: vec![],
            verdict: Verdict::Fail,
            completed_at: chrono::Utc::now(),
        };
        run.verification = Some(report.clone());
        assert!(matches!(
            next_phase(&run),
            Err(MigrationError::VerificationFailed {
                mismatches: 1,
                sample_size: 10
            })
        ));

        report.mismatch_count = 0;
        report.verdict = Verdict::Pass;
        run.verification = Some(report);
        assert_eq!(
            next_phase(&run).ok(),
            Some(Some(MigrationPhase::Contracting))
        );
    }

    #[test]
    fn terminal_phases_do_not_advance() {
        assert_eq!(next_phase(&run_in(MigrationPhase::Completed)).ok(), Some(None));
        assert_eq!(next_phase(&run_in(MigrationPhase::RolledBack)).ok(), Some(None));
    }

    #[test]
    fn forward_steps() {
        assert_eq!(
            next_phase(&run_in(MigrationPhase::Pending)).ok(),
            Some(Some(MigrationPhase::Expanding))
        );
        assert_eq!(
            next_phase(&run_in(MigrationPhase::DualWriting)).ok(),
            Some(Some(MigrationPhase::Verifying))
        );
        assert_eq!(
            next_phase(&run_in(MigrationPhase::Contracting)).ok(),
            Some(Some(MigrationPhase::Completed))
        );
    }
}
