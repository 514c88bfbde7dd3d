//! RunStore port trait definition.
//!
//! Stores [`MigrationRun`] records under optimistic concurrency control.
//! Every mutation is a compare-and-swap on the run's `version`; losers get
//! [`RunStoreError::Conflict`], re-read, and retry.

use async_trait::async_trait;
use chrono::Utc;
use std::fmt::Debug;

use crate::backoff::BackoffPolicy;
use crate::error::MigrationError;
use crate::migration::{CollectionId, MigrationRun, RunId};

/// Errors from run store operations.
#[derive(Debug, thiserror::Error)]
pub enum RunStoreError<E> {
    /// Optimistic locking detected a version mismatch.
    #[error("conflict: expected version {expected}, but current is {actual}")]
    Conflict {
        /// The version the caller based its update on.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// The requested run was not found.
    #[error("migration run not found: {run_id}")]
    NotFound {
        run_id: RunId,
    },

    /// A run with this id already exists.
    #[error("migration run already exists: {run_id}")]
    AlreadyExists {
        run_id: RunId,
    },

    /// Transient infrastructure failure; safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Backend-specific error.
    #[error("backend error: {0:?}")]
    Backend(E),
}

impl<E> RunStoreError<E> {
    pub fn conflict(expected: u64, actual: u64) -> Self {
        Self::Conflict { expected, actual }
    }

    pub fn not_found(run_id: RunId) -> Self {
        Self::NotFound { run_id }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Trait for persisted migration run state.
///
/// # Concurrency Model
///
/// 1. `update` requires the version the caller read.
/// 2. If the stored version differs, return [`RunStoreError::Conflict`].
/// 3. The caller re-reads and retries.
///
/// This lets multiple orchestrator instances drive the same run without
/// coordination; exactly one wins each transition.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// The error type for this implementation.
    type Error: Debug + Send + Sync + 'static;

    /// Persist a new run. Fails with `AlreadyExists` on id collision.
    async fn create(&self, run: &MigrationRun) -> Result<(), RunStoreError<Self::Error>>;

    /// Fetch a run by id.
    async fn get(&self, run_id: &RunId) -> Result<MigrationRun, RunStoreError<Self::Error>>;

    /// CAS-update a run. `expected_version` is the version the caller
    /// read; the stored copy gets `expected_version + 1`. Returns the
    /// stored run.
    async fn update(
        &self,
        run: &MigrationRun,
        expected_version: u64,
    ) -> Result<MigrationRun, RunStoreError<Self::Error>>;

    /// The non-terminal run targeting this collection, if one exists.
    /// At most one is allowed at a time.
    async fn find_active(
        &self,
        collection: &CollectionId,
    ) -> Result<Option<MigrationRun>, RunStoreError<Self::Error>>;
}

/// Load a run, retrying transient store errors under `policy`.
pub async fn load_run<S: RunStore>(
    store: &S,
    run_id: &RunId,
    policy: &BackoffPolicy,
) -> Result<MigrationRun, MigrationError> {
    policy
        .retry("run_store.get", || async move {
            store.get(run_id).await.map_err(MigrationError::from_run_store)
        })
        .await
}

/// Read-mutate-CAS loop shared by the engine components.
///
/// Loads the run fresh, applies `mutate`, and attempts a CAS update;
/// on conflict it re-reads and re-applies up to `cas_retry_limit` times.
/// Transient store errors inside each step are retried under `policy`.
/// `mutate` can abort the whole loop by returning an error (e.g. when the
/// phase changed underneath the caller).
pub async fn cas_update<S, M>(
    store: &S,
    run_id: &RunId,
    policy: &BackoffPolicy,
    cas_retry_limit: u32,
    mutate: M,
) -> Result<MigrationRun, MigrationError>
where
    S: RunStore,
    M: Fn(&mut MigrationRun) -> Result<(), MigrationError>,
{
    let mut cas_attempts: u32 = 0;
    loop {
        let run = policy
            .retry("run_store.get", || async move {
                store.get(run_id).await.map_err(MigrationError::from_run_store)
            })
            .await?;

        let mut updated = run.clone();
        mutate(&mut updated)?;
        updated.updated_at = Utc::now();

        let attempt = policy
            .retry("run_store.update", || {
                let updated = updated.clone();
                async move {
                    store
                        .update(&updated, run.version)
                        .await
                        .map_err(MigrationError::from_run_store)
                }
            })
            .await;

        match attempt {
            Ok(stored) => return Ok(stored),
            Err(MigrationError::PhaseTransitionConflict { expected, actual }) => {
                if cas_attempts >= cas_retry_limit {
                    return Err(MigrationError::PhaseTransitionConflict { expected, actual });
                }
                cas_attempts += 1;
                tracing::debug!(
                    %run_id,
                    expected,
                    actual,
                    cas_attempts,
                    "version conflict, re-reading run"
                );
            }
            Err(err) => return Err(err),
        }
    }
}
