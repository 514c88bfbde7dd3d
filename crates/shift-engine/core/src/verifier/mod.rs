//! # Verifier
//!
//! Confirms backfill completeness and correctness before Contracting is
//! allowed: an exact count check plus a sampled comparison that re-derives
//! new-schema fields with the same transform the backfill worker used.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::document::{DocumentKey, DocumentShape};
use crate::error::{MigrationError, Result};
use crate::migration::{CollectionId, MigrationPhase, MigrationRun, RunId};
use crate::port::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::port::document_store::DocumentStore;
use crate::port::run_store::{cas_update, load_run, RunStore};
use crate::telemetry::{MigrationTelemetry, TracingTelemetry};
use crate::transform::TransformRegistry;

/// Default fraction of documents sampled for the transform comparison.
const DEFAULT_SAMPLE_RATE: f64 = 0.1;

/// Default cap on the diagnostic mismatch list.
const DEFAULT_MAX_MISMATCHES: usize = 16;

/// Default number of tolerated mismatches.
const DEFAULT_TOLERANCE: u64 = 0;

/// Default documents per verification scan batch.
const DEFAULT_SCAN_BATCH_SIZE: usize = 256;

/// Verifier configuration.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Fraction of documents sampled, in `(0, 1]`. Sampling is stride
    /// based so repeated verification visits the same documents.
    pub sample_rate: f64,
    /// Mismatches tolerated before the verdict flips to `Fail`.
    pub tolerance: u64,
    /// Upper bound on the diagnostic mismatch list.
    pub max_mismatches: usize,
    /// Documents per scan batch.
    pub scan_batch_size: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            tolerance: DEFAULT_TOLERANCE,
            max_mismatches: DEFAULT_MAX_MISMATCHES,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
        }
    }
}

impl VerifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn with_tolerance(mut self, tolerance: u64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_mismatches(mut self, max: usize) -> Self {
        self.max_mismatches = max;
        self
    }

    pub fn with_scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size;
        self
    }

    /// Every n-th document gets sampled.
    pub fn sample_stride(&self) -> u64 {
        if self.sample_rate >= 1.0 || self.sample_rate <= 0.0 {
            1
        } else {
            (1.0 / self.sample_rate).round().max(1.0) as u64
        }
    }
}

/// Verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Why a sampled document failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    /// The document has no new-schema fields at all.
    MissingNewShape,
    /// `transform(old_fields)` differs from the stored new-schema fields.
    Divergent,
    /// The transform failed on the stored old-schema fields.
    TransformFailed,
}

/// One failed sample, bounded-listed in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub collection: CollectionId,
    pub key: DocumentKey,
    pub reason: MismatchReason,
}

/// Result of a verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub run_id: RunId,
    /// Total documents across the target collections.
    pub total_documents: u64,
    /// Documents whose new-schema fields are populated.
    pub migrated_documents: u64,
    /// Documents actually sampled for the transform comparison.
    pub sample_size: u64,
    /// Total mismatches found (may exceed the bounded list).
    pub mismatch_count: u64,
    /// Bounded diagnostic list.
    pub mismatches: Vec<Mismatch>,
    pub verdict: Verdict,
    pub completed_at: DateTime<Utc>,
}

/// Gates the Contracting transition.
pub struct Verifier<D, R, A>
where
    D: DocumentStore + 'static,
    R: RunStore + 'static,
    A: AuditSink + 'static,
{
    config: VerifierConfig,
    document_store: Arc<D>,
    run_store: Arc<R>,
    audit: Arc<A>,
    transforms: Arc<TransformRegistry>,
    cancelled: Arc<AtomicBool>,
    telemetry: Arc<dyn MigrationTelemetry>,
    cas_retry_limit: u32,
}

impl<D, R, A> Verifier<D, R, A>
where
    D: DocumentStore + 'static,
    R: RunStore + 'static,
    A: AuditSink + 'static,
{
    pub fn new(
        config: VerifierConfig,
        document_store: Arc<D>,
        run_store: Arc<R>,
        audit: Arc<A>,
        transforms: Arc<TransformRegistry>,
    ) -> Self {
        Self {
            config,
            document_store,
            run_store,
            audit,
            transforms,
            cancelled: Arc::new(AtomicBool::new(false)),
            telemetry: Arc::new(TracingTelemetry),
            cas_retry_limit: 5,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn MigrationTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Flag checked between scan batches for cooperative cancellation.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Run verification for a run in the Verifying phase.
    ///
    /// The report is CAS-stored on the run; a passing verdict is what the
    /// orchestrator requires before Contracting.
    pub async fn run(&self, run_id: &RunId) -> Result<VerificationReport> {
        let run = load_run(
            self.run_store.as_ref(),
            run_id,
            &BackoffPolicy::standard(),
        )
        .await?;

        if run.phase != MigrationPhase::Verifying {
            return Err(MigrationError::InvalidState(format!(
                "verification requires phase verifying, run {run_id} is {}",
                run.phase
            )));
        }

        let transform = self
            .transforms
            .resolve(&run.spec.transform)
            .ok_or_else(|| MigrationError::TransformNotFound(run.spec.transform.clone()))?;
        let policy = run.spec.retry_policy();
        let stride = self.config.sample_stride();

        let mut total_documents = 0u64;
        let mut migrated_documents = 0u64;
        let mut sample_size = 0u64;
        let mut mismatch_count = 0u64;
        let mut mismatches = Vec::new();
        let mut scanned = 0u64;

        for collection in &run.spec.collections {
            total_documents += self.count(&policy, collection, false).await?;
            migrated_documents += self.count(&policy, collection, true).await?;

            let mut after: Option<DocumentKey> = None;
            loop {
                if self.cancelled.load(Ordering::SeqCst) {
                    return Err(MigrationError::Cancelled);
                }
                let batch = policy
                    .retry("document_store.scan_batch", || {
                        let after = after.clone();
                        async move {
                            self.document_store
                                .scan_batch(
                                    collection,
                                    after.as_ref(),
                                    None,
                                    self.config.scan_batch_size,
                                )
                                .await
                                .map_err(MigrationError::from_document_store)
                        }
                    })
                    .await?;
                let Some(last) = batch.last() else {
                    break;
                };
                after = Some(last.key.clone());

                for record in &batch {
                    scanned += 1;
                    if (scanned - 1) % stride != 0 {
                        continue;
                    }
                    sample_size += 1;
                    let reason = match &record.shape {
                        DocumentShape::Old(_) => Some(MismatchReason::MissingNewShape),
                        DocumentShape::New(_) => None,
                        DocumentShape::Both { old, new } => match transform.apply(old) {
                            Ok(derived) if &derived == new => None,
                            Ok(_) => Some(MismatchReason::Divergent),
                            Err(_) => Some(MismatchReason::TransformFailed),
                        },
                    };
                    if let Some(reason) = reason {
                        mismatch_count += 1;
                        if mismatches.len() < self.config.max_mismatches {
                            mismatches.push(Mismatch {
                                collection: collection.clone(),
                                key: record.key.clone(),
                                reason,
                            });
                        }
                    }
                }
            }
        }

        // documents recorded as transform errors were deliberately skipped;
        // they are accounted for by the run counts, not the count check
        let counts_match = migrated_documents + run.counts.errored == total_documents;
        let verdict = if counts_match && mismatch_count <= self.config.tolerance {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        let report = VerificationReport {
            run_id: run_id.clone(),
            total_documents,
            migrated_documents,
            sample_size,
            mismatch_count,
            mismatches,
            verdict,
            completed_at: Utc::now(),
        };

        self.store_report(&run, &policy, &report).await?;
        self.telemetry
            .on_verification_completed(run_id, verdict, mismatch_count);
        tracing::info!(
            %run_id,
            total_documents,
            migrated_documents,
            sample_size,
            mismatch_count,
            ?verdict,
            "verification completed"
        );
        Ok(report)
    }

    async fn count(
        &self,
        policy: &BackoffPolicy,
        collection: &CollectionId,
        new_shape_only: bool,
    ) -> Result<u64> {
        policy
            .retry("document_store.count", || async move {
                let result = if new_shape_only {
                    self.document_store.count_new_shape(collection).await
                } else {
                    self.document_store.count(collection).await
                };
                result.map_err(MigrationError::from_document_store)
            })
            .await
    }

    async fn store_report(
        &self,
        run: &MigrationRun,
        policy: &BackoffPolicy,
        report: &VerificationReport,
    ) -> Result<()> {
        cas_update(
            self.run_store.as_ref(),
            &run.id,
            policy,
            self.cas_retry_limit,
            |r| {
                if r.phase != MigrationPhase::Verifying {
                    return Err(MigrationError::InvalidState(format!(
                        "run left verifying phase during verification (now {})",
                        r.phase
                    )));
                }
                r.verification = Some(report.clone());
                Ok(())
            },
        )
        .await?;

        let audit = AuditRecord::new(
            run.id.clone(),
            AuditEvent::VerificationCompleted {
                verdict: report.verdict,
                mismatches: report.mismatch_count,
            },
        );
        policy
            .retry("audit.append", || {
                let audit = audit.clone();
                async move {
                    self.audit
                        .append(audit)
                        .await
                        .map_err(MigrationError::from_audit)
                }
            })
            .await
    }
}
