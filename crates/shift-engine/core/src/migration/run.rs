//! Migration run state and the phase state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Checkpoint, CollectionId, MigrationSpec, RunId, SpecId};
use crate::verifier::VerificationReport;

/// Phase of the expand/contract workflow.
///
/// The sequence is monotonic in declaration order, with a single allowed
/// jump to [`RolledBack`](MigrationPhase::RolledBack) from any non-terminal
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Run created, nothing touched yet.
    Pending,
    /// New schema is being made available alongside the old one.
    Expanding,
    /// Backfill worker is populating new-schema fields.
    Backfilling,
    /// External writes maintain both shapes; reads prefer the new one.
    DualWriting,
    /// Backfill completeness and correctness are being checked.
    Verifying,
    /// New schema becomes authoritative; old fields await a later cleanup.
    Contracting,
    /// Terminal success.
    Completed,
    /// Terminal emergency reversal; new-schema fields are left in place.
    RolledBack,
}

impl MigrationPhase {
    /// The next phase in the forward sequence, `None` for terminal phases.
    pub fn next(&self) -> Option<MigrationPhase> {
        match self {
            MigrationPhase::Pending => Some(MigrationPhase::Expanding),
            MigrationPhase::Expanding => Some(MigrationPhase::Backfilling),
            MigrationPhase::Backfilling => Some(MigrationPhase::DualWriting),
            MigrationPhase::DualWriting => Some(MigrationPhase::Verifying),
            MigrationPhase::Verifying => Some(MigrationPhase::Contracting),
            MigrationPhase::Contracting => Some(MigrationPhase::Completed),
            MigrationPhase::Completed | MigrationPhase::RolledBack => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Completed | MigrationPhase::RolledBack)
    }

    /// Whether a transition to `next` honors the monotonic-phase invariant:
    /// the forward successor, or the jump to `RolledBack` from any
    /// non-terminal phase.
    pub fn can_transition_to(&self, next: MigrationPhase) -> bool {
        if next == MigrationPhase::RolledBack {
            return !self.is_terminal();
        }
        self.next() == Some(next)
    }

    /// Whether rollback is still allowed from this phase.
    ///
    /// Contracting is excluded: old-schema fields may already be gone.
    pub fn allows_rollback(&self) -> bool {
        !self.is_terminal() && *self != MigrationPhase::Contracting
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationPhase::Pending => "pending",
            MigrationPhase::Expanding => "expanding",
            MigrationPhase::Backfilling => "backfilling",
            MigrationPhase::DualWriting => "dual_writing",
            MigrationPhase::Verifying => "verifying",
            MigrationPhase::Contracting => "contracting",
            MigrationPhase::Completed => "completed",
            MigrationPhase::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

/// Operational status of a run, orthogonal to its phase.
///
/// A `Failed` run keeps its phase and checkpoint so it can be resumed once
/// the underlying cause is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Paused,
    Failed,
    Completed,
    CompletedWithWarnings,
    RolledBack,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Active => "active",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithWarnings => "completed_with_warnings",
            RunStatus::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

/// Document counters accumulated by the backfill worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Total documents in the target collections at backfill start.
    pub expected: u64,
    /// Documents transformed and committed.
    pub processed: u64,
    /// Documents needing no work (already carried the new shape only).
    pub skipped: u64,
    /// Documents skipped because their transform failed.
    pub errored: u64,
}

/// Persisted state of one migration run.
///
/// All mutations go through compare-and-swap on `version`; see
/// [`RunStore`](crate::port::RunStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: RunId,
    /// Immutable copy of the spec this run executes.
    pub spec: MigrationSpec,
    pub phase: MigrationPhase,
    pub status: RunStatus,
    pub checkpoint: Checkpoint,
    pub counts: RunCounts,
    /// Latest verification report, if the verifier has run.
    pub verification: Option<VerificationReport>,
    /// Most recent terminal error, surfaced through the status API.
    pub last_error: Option<String>,
    /// Optimistic concurrency token.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRun {
    /// Create a fresh run in `Pending` with version 1.
    pub fn new(spec: MigrationSpec) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            spec,
            phase: MigrationPhase::Pending,
            status: RunStatus::Active,
            checkpoint: Checkpoint::Start,
            counts: RunCounts::default(),
            verification: None,
            last_error: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn spec_id(&self) -> &SpecId {
        &self.spec.id
    }

    /// Terminal means no further phase transitions are possible.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether this run targets the given collection.
    pub fn touches(&self, collection: &CollectionId) -> bool {
        self.spec.collections.contains(collection)
    }

    /// Snapshot for the status API.
    pub fn view(&self) -> RunStatusView {
        RunStatusView {
            run_id: self.id.clone(),
            phase: self.phase,
            status: self.status,
            counts: self.counts,
            checkpoint: self.checkpoint.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view returned by `get_migration_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: RunId,
    pub phase: MigrationPhase,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub checkpoint: Checkpoint,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformId;

    fn run() -> MigrationRun {
        MigrationRun::new(MigrationSpec::new(
            "contracts-v2",
            vec![CollectionId::new("contracts")],
            TransformId::new("split-party-names"),
        ))
    }

    #[test]
    fn forward_chain_is_complete() {
        let mut phase = MigrationPhase::Pending;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(phase.can_transition_to(next));
            phase = next;
            seen.push(phase);
        }
        assert_eq!(phase, MigrationPhase::Completed);
        assert_eq!(seen.len(), 7);
        // declaration order backs the monotonicity check
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn rollback_jump_from_non_terminal_only() {
        assert!(MigrationPhase::Pending.can_transition_to(MigrationPhase::RolledBack));
        assert!(MigrationPhase::DualWriting.can_transition_to(MigrationPhase::RolledBack));
        assert!(MigrationPhase::Contracting.can_transition_to(MigrationPhase::RolledBack));
        assert!(!MigrationPhase::Completed.can_transition_to(MigrationPhase::RolledBack));
        assert!(!MigrationPhase::RolledBack.can_transition_to(MigrationPhase::RolledBack));
    }

    #[test]
    fn no_phase_skipping() {
        assert!(!MigrationPhase::Pending.can_transition_to(MigrationPhase::Backfilling));
        assert!(!MigrationPhase::Backfilling.can_transition_to(MigrationPhase::Verifying));
        assert!(!MigrationPhase::Verifying.can_transition_to(MigrationPhase::Completed));
    }

    #[test]
    fn rollback_window_excludes_contracting() {
        assert!(MigrationPhase::Verifying.allows_rollback());
        assert!(!MigrationPhase::Contracting.allows_rollback());
        assert!(!MigrationPhase::Completed.allows_rollback());
        assert!(!MigrationPhase::RolledBack.allows_rollback());
    }

    #[test]
    fn new_run_starts_pending() {
        let run = run();
        assert_eq!(run.phase, MigrationPhase::Pending);
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.version, 1);
        assert!(run.checkpoint.is_start());
        assert!(!run.is_terminal());
    }

    #[test]
    fn view_exposes_status_fields() {
        let mut run = run();
        run.last_error = Some("boom".into());
        let view = run.view();
        assert_eq!(view.run_id, run.id);
        assert_eq!(view.phase, MigrationPhase::Pending);
        assert_eq!(view.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn touches_checks_spec_collections() {
        let run = run();
        assert!(run.touches(&CollectionId::new("contracts")));
        assert!(!run.touches(&CollectionId::new("projects")));
    }
}
