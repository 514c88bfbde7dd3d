//! Central error taxonomy for the migration engine.
//!
//! Transient errors are retried locally with bounded backoff and jitter;
//! terminal errors surface through the status API and the audit log.

use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

use crate::document::DocumentKey;
use crate::migration::{Checkpoint, CollectionId, MigrationPhase, RunId};
use crate::port::audit::AuditSinkError;
use crate::port::document_store::DocumentStoreError;
use crate::port::flag_store::FlagStoreError;
use crate::port::run_store::RunStoreError;
use crate::transform::{TransformError, TransformId};

/// Errors from migration engine operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Transient infrastructure failure; retried under the run's backoff
    /// policy.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Non-transient store failure.
    #[error("store error: {0}")]
    Store(String),

    /// A single document's transform failed. Recorded and skipped while
    /// the batch error rate stays under the spec threshold.
    #[error("transform error on document {key}: {source}")]
    Transform {
        key: DocumentKey,
        #[source]
        source: TransformError,
    },

    /// Per-batch error rate exceeded the spec threshold; backfill halted
    /// at the last good checkpoint.
    #[error(
        "batch aborted: error rate {error_rate:.3} exceeded threshold {threshold:.3} at {checkpoint:?}"
    )]
    BatchAborted {
        error_rate: f64,
        threshold: f64,
        checkpoint: Checkpoint,
    },

    /// CAS lost against a concurrent writer. Callers re-read and retry.
    #[error("phase transition conflict: expected version {expected}, found {actual}")]
    PhaseTransitionConflict {
        expected: u64,
        actual: u64,
    },

    /// A failing verification report blocks Contracting until an operator
    /// intervenes.
    #[error("verification failed: {mismatches} mismatch(es) over a sample of {sample_size}")]
    VerificationFailed {
        mismatches: u64,
        sample_size: u64,
    },

    /// Rollback attempted at or after Contracting, when old-schema fields
    /// may already be gone. Fatal, non-retryable.
    #[error("rollback not allowed in phase {phase}: old-schema fields may already be contracted")]
    RollbackInvalidState {
        phase: MigrationPhase,
    },

    /// The collection already has a non-terminal run.
    #[error("collection {collection} already has an active migration run {run_id}")]
    ConcurrentRun {
        collection: CollectionId,
        run_id: RunId,
    },

    /// The collection already contains new-schema documents; a fresh run
    /// requires an untouched collection.
    #[error("collection {collection} already contains new-schema documents")]
    CollectionNotPristine {
        collection: CollectionId,
    },

    #[error("migration run not found: {0}")]
    RunNotFound(RunId),

    #[error("transform not registered: {0}")]
    TransformNotFound(TransformId),

    #[error("invalid migration spec: {0}")]
    InvalidSpec(String),

    /// The run is in a state that does not permit the requested operation.
    #[error("invalid run state: {0}")]
    InvalidState(String),

    /// Retry budget exhausted on a transient error.
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cooperative cancellation honored between batches.
    #[error("operation cancelled")]
    Cancelled,
}

impl MigrationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStore(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Whether a blind retry of the same operation can succeed.
    ///
    /// CAS conflicts are excluded: they need a re-read first and are
    /// handled by the CAS loops.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::TransientStore(_) | MigrationError::Timeout(_)
        )
    }

    /// Fatal errors require operator action and must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MigrationError::RollbackInvalidState { .. })
    }

    pub fn from_document_store<E: Debug>(err: DocumentStoreError<E>) -> Self {
        match err {
            DocumentStoreError::Transient(msg) => MigrationError::TransientStore(msg),
            other => MigrationError::Store(other.to_string()),
        }
    }

    pub fn from_run_store<E: Debug>(err: RunStoreError<E>) -> Self {
        match err {
            RunStoreError::Conflict { expected, actual } => {
                MigrationError::PhaseTransitionConflict { expected, actual }
            }
            RunStoreError::NotFound { run_id } => MigrationError::RunNotFound(run_id),
            RunStoreError::Transient(msg) => MigrationError::TransientStore(msg),
            other => MigrationError::Store(other.to_string()),
        }
    }

    pub fn from_flag_store<E: Debug>(err: FlagStoreError<E>) -> Self {
        match err {
            FlagStoreError::Conflict { expected, actual } => {
                MigrationError::PhaseTransitionConflict {
                    expected: expected.unwrap_or(0),
                    actual: actual.unwrap_or(0),
                }
            }
            FlagStoreError::Transient(msg) => MigrationError::TransientStore(msg),
            other => MigrationError::Store(other.to_string()),
        }
    }

    pub fn from_audit<E: Debug>(err: AuditSinkError<E>) -> Self {
        MigrationError::Store(err.to_string())
    }
}

/// Result type with the engine's error.
pub type Result<T, E = MigrationError> = std::result::Result<T, E>;
