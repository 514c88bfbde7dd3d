//! AuditSink port trait definition.
//!
//! Append-only record of phase transitions, rollbacks, and verification
//! reports. Terminal errors are surfaced here and through the status API,
//! never silently dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::migration::{Checkpoint, MigrationPhase, RunCounts, RunId, SpecId};
use crate::verifier::Verdict;

/// What happened, attached to an [`AuditRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AuditEvent {
    RunStarted {
        spec_id: SpecId,
    },
    PhaseChanged {
        from: MigrationPhase,
        to: MigrationPhase,
    },
    Paused,
    Resumed,
    BackfillCompleted {
        checkpoint: Checkpoint,
        counts: RunCounts,
    },
    VerificationCompleted {
        verdict: Verdict,
        mismatches: u64,
    },
    RolledBack {
        reason: String,
        phase_at_rollback: MigrationPhase,
    },
    RunFailed {
        error: String,
    },
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: RunId,
    pub at: DateTime<Utc>,
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(run_id: RunId, event: AuditEvent) -> Self {
        Self {
            run_id,
            at: Utc::now(),
            event,
        }
    }
}

/// Errors from the audit sink.
#[derive(Debug, thiserror::Error)]
pub enum AuditSinkError<E> {
    /// Backend-specific error.
    #[error("backend error: {0:?}")]
    Backend(E),
}

/// Append-only audit log collaborator.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// The error type for this implementation.
    type Error: Debug + Send + Sync + 'static;

    async fn append(&self, record: AuditRecord) -> Result<(), AuditSinkError<Self::Error>>;
}
