//! # Rollback Controller
//!
//! Non-destructive emergency reversal. Flips routing back to the old
//! schema and terminates the run as RolledBack; new-schema fields already
//! written are left in place so a remediation run can resume from them.

use std::sync::Arc;

use crate::backoff::BackoffPolicy;
use crate::error::{MigrationError, Result};
use crate::migration::{MigrationPhase, RunId, RunStatus, RunStatusView};
use crate::port::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::port::flag_store::{FlagStore, RoutingFlag};
use crate::port::run_store::{load_run, RunStore};
use crate::router::set_routing_flag;
use crate::telemetry::{MigrationTelemetry, TracingTelemetry};

pub struct RollbackController<R, F, A>
where
    R: RunStore + 'static,
    F: FlagStore + 'static,
    A: AuditSink + 'static,
{
    run_store: Arc<R>,
    flag_store: Arc<F>,
    audit: Arc<A>,
    telemetry: Arc<dyn MigrationTelemetry>,
    cas_retry_limit: u32,
}

impl<R, F, A> RollbackController<R, F, A>
where
    R: RunStore + 'static,
    F: FlagStore + 'static,
    A: AuditSink + 'static,
{
    pub fn new(run_store: Arc<R>, flag_store: Arc<F>, audit: Arc<A>) -> Self {
        Self {
            run_store,
            flag_store,
            audit,
            telemetry: Arc::new(TracingTelemetry),
            cas_retry_limit: 5,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn MigrationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Roll a run back.
    ///
    /// Allowed from any non-terminal phase before Contracting. The run is
    /// CAS-terminated first, so a racing `advance` cannot slip past; the
    /// routing flags are flipped right after, and re-flipped on repeat
    /// invocations, which makes the operation idempotent and self-healing
    /// when a previous attempt died between the two steps.
    ///
    /// # Errors
    ///
    /// [`MigrationError::RollbackInvalidState`] when invoked in Contracting
    /// or Completed; old-schema fields may already be gone. Fatal.
    pub async fn rollback(&self, run_id: &RunId, reason: &str) -> Result<RunStatusView> {
        let run = load_run(
            self.run_store.as_ref(),
            run_id,
            &BackoffPolicy::standard(),
        )
        .await?;
        let policy = run.spec.retry_policy();

        let mut cas_attempts: u32 = 0;
        let mut already_rolled_back = run.phase == MigrationPhase::RolledBack;
        let mut phase_at_rollback = run.phase;

        let stored = if already_rolled_back {
            run
        } else {
            loop {
                let current = load_run(self.run_store.as_ref(), run_id, &policy).await?;
                if current.phase == MigrationPhase::RolledBack {
                    // lost the race to a concurrent rollback
                    already_rolled_back = true;
                    break current;
                }
                if !current.phase.allows_rollback() {
                    return Err(MigrationError::RollbackInvalidState {
                        phase: current.phase,
                    });
                }
                phase_at_rollback = current.phase;

                let mut updated = current.clone();
                updated.phase = MigrationPhase::RolledBack;
                updated.status = RunStatus::RolledBack;
                updated.updated_at = chrono::Utc::now();

                let attempt = policy
                    .retry("run_store.update", || {
                        let updated = updated.clone();
                        async move {
                            self.run_store
                                .update(&updated, current.version)
                                .await
                                .map_err(MigrationError::from_run_store)
                        }
                    })
                    .await;
                match attempt {
                    Ok(stored) => break stored,
                    Err(MigrationError::PhaseTransitionConflict { .. })
                        if cas_attempts < self.cas_retry_limit =>
                    {
                        cas_attempts += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        // Flip routing back to the old schema on every invocation, so a
        // rollback interrupted between run update and flag flip converges
        // on retry. Each flag write is an atomic CAS.
        for collection in &stored.spec.collections {
            set_routing_flag(
                self.flag_store.as_ref(),
                collection,
                RoutingFlag::old_schema(stored.id.clone()),
                &policy,
                self.cas_retry_limit,
            )
            .await?;
        }

        if already_rolled_back {
            tracing::info!(%run_id, "rollback already applied, no-op");
            return Ok(stored.view());
        }

        let record = AuditRecord::new(
            stored.id.clone(),
            AuditEvent::RolledBack {
                reason: reason.to_string(),
                phase_at_rollback,
            },
        );
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
            .await?;
        self.telemetry.on_rollback(run_id, phase_at_rollback, reason);
        tracing::warn!(%run_id, phase = %phase_at_rollback, reason, "migration rolled back");

        Ok(stored.view())
    }
}
