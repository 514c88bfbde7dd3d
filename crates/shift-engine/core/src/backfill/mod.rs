//! # Backfill Worker
//!
//! Transforms every document in the target collections, effectively exactly
//! once. Batches are read in key order from the persisted checkpoint,
//! transformed, committed atomically, and only then is the advanced
//! checkpoint persisted. Crash recovery resumes from the last persisted
//! checkpoint; the batch spanning the crash may be re-applied, which the
//! transform's determinism makes safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use tokio::sync::Mutex;

use crate::backoff::BackoffPolicy;
use crate::document::{DocumentKey, DocumentRecord};
use crate::error::{MigrationError, Result};
use crate::migration::{
    Checkpoint, CollectionId, MigrationPhase, MigrationRun, RunCounts, RunId, RunStatus,
};
use crate::port::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::port::document_store::DocumentStore;
use crate::port::run_store::{cas_update, load_run, RunStore};
use crate::telemetry::{MigrationTelemetry, TracingTelemetry};
use crate::transform::{DocumentTransform, TransformRegistry};

/// How a backfill invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BackfillOutcome {
    /// Every target collection is processed; the checkpoint is `Complete`.
    Completed {
        counts: RunCounts,
    },
    /// The run was paused; resume continues from this checkpoint.
    Paused {
        checkpoint: Checkpoint,
    },
    /// Cooperative cancellation was honored between batches.
    Cancelled {
        checkpoint: Checkpoint,
    },
}

/// Result of applying the transform to one scanned batch.
struct BatchApplication {
    updates: Vec<DocumentRecord>,
    processed: u64,
    skipped: u64,
    errored: u64,
}

/// Apply the transform to a batch, skipping and recording per-document
/// failures. Documents already carrying both shapes are re-derived from
/// their old fields, so re-running a batch converges on the same state.
fn apply_transform(transform: &dyn DocumentTransform, batch: &[DocumentRecord]) -> BatchApplication {
    let mut updates = Vec::with_capacity(batch.len());
    let mut processed = 0u64;
    let mut skipped = 0u64;
    let mut errored = 0u64;

    for record in batch {
        match record.shape.old_fields() {
            Some(old) => match transform.apply(old) {
                Ok(new) => {
                    updates.push(DocumentRecord::both(record.key.clone(), old.clone(), new));
                    processed += 1;
                }
                Err(err) => {
                    errored += 1;
                    tracing::warn!(key = %record.key, error = %err, "transform failed, skipping document");
                }
            },
            // new-shape only, nothing left to derive
            None => skipped += 1,
        }
    }

    BatchApplication {
        updates,
        processed,
        skipped,
        errored,
    }
}

/// A disjoint key range for partitioned backfill: keys strictly greater
/// than `after`, up to and including `upper`. Contiguous ranges share
/// their boundary key (`ranges[i].upper == ranges[i+1].after`), so every
/// document belongs to exactly one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub after: Option<DocumentKey>,
    pub upper: Option<DocumentKey>,
}

impl KeyRange {
    pub fn new(after: Option<DocumentKey>, upper: Option<DocumentKey>) -> Self {
        Self { after, upper }
    }
}

/// Safe resumption point computed by [`LowWaterMark`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frontier {
    /// Nothing committed yet.
    Start,
    /// Every document up to and including this key is committed.
    Key(DocumentKey),
    /// Every partition finished.
    Done,
}

/// Tracks per-partition commit boundaries for partitioned backfill.
///
/// The persisted checkpoint may only advance to the minimum fully
/// committed boundary across partitions; everything at or below the
/// frontier is durably committed, whatever the other partitions are doing.
#[derive(Debug)]
pub struct LowWaterMark {
    ranges: Vec<KeyRange>,
    committed: Vec<Option<DocumentKey>>,
    done: Vec<bool>,
}

impl LowWaterMark {
    /// `ranges` must be ordered and contiguous, lowest keys first.
    pub fn new(ranges: Vec<KeyRange>) -> Self {
        let n = ranges.len();
        Self {
            ranges,
            committed: vec![None; n],
            done: vec![false; n],
        }
    }

    /// Record that `partition` durably committed everything up to `key`.
    pub fn record_commit(&mut self, partition: usize, key: DocumentKey) {
        self.committed[partition] = Some(key);
    }

    /// Record that `partition` has no documents left in its range.
    pub fn mark_done(&mut self, partition: usize) {
        self.done[partition] = true;
    }

    pub fn all_done(&self) -> bool {
        self.done.iter().all(|d| *d)
    }

    /// The minimum fully-committed boundary across all partitions.
    pub fn frontier(&self) -> Frontier {
        // the first unfinished partition bounds the safe resumption point
        for partition in 0..self.ranges.len() {
            if self.done[partition] {
                continue;
            }
            return match &self.committed[partition] {
                Some(key) => Frontier::Key(key.clone()),
                // untouched partition: its range start is covered by the
                // (finished) partitions before it
                None => match &self.ranges[partition].after {
                    Some(boundary) => Frontier::Key(boundary.clone()),
                    None => Frontier::Start,
                },
            };
        }
        Frontier::Done
    }
}

/// How a single partition loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionOutcome {
    Done,
    Paused,
    Cancelled,
}

/// Executes the Backfilling phase for a run.
pub struct BackfillWorker<D, R, A>
where
    D: DocumentStore + 'static,
    R: RunStore + 'static,
    A: AuditSink + 'static,
{
    document_store: Arc<D>,
    run_store: Arc<R>,
    audit: Arc<A>,
    transforms: Arc<TransformRegistry>,
    cancelled: Arc<AtomicBool>,
    telemetry: Arc<dyn MigrationTelemetry>,
    cas_retry_limit: u32,
}

impl<D, R, A> BackfillWorker<D, R, A>
where
    D: DocumentStore + 'static,
    R: RunStore + 'static,
    A: AuditSink + 'static,
{
    pub fn new(
        document_store: Arc<D>,
        run_store: Arc<R>,
        audit: Arc<A>,
        transforms: Arc<TransformRegistry>,
    ) -> Self {
        Self {
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

    /// Flag checked between batches for cooperative cancellation. An
    /// in-flight batch always finishes or fully aborts first.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Drive the backfill for `run_id` until the collections are exhausted,
    /// the run is paused or cancelled, or an error halts it at the last
    /// good checkpoint.
    ///
    /// Safe to call again after a crash or a `Failed` resume: it picks up
    /// from the persisted checkpoint.
    pub async fn run(&self, run_id: &RunId) -> Result<BackfillOutcome> {
        loop {
            // fresh read each batch: picks up pause, rollback, and
            // concurrent count updates
            let run = load_run(self.run_store.as_ref(), run_id, &BackoffPolicy::standard()).await?;
            self.ensure_backfilling(&run)?;
            if run.status == RunStatus::Paused {
                return Ok(BackfillOutcome::Paused {
                    checkpoint: run.checkpoint,
                });
            }
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(BackfillOutcome::Cancelled {
                    checkpoint: run.checkpoint,
                });
            }
            if run.checkpoint.is_complete() {
                return Ok(BackfillOutcome::Completed { counts: run.counts });
            }

            let policy = run.spec.retry_policy();
            let transform = self
                .transforms
                .resolve(&run.spec.transform)
                .ok_or_else(|| MigrationError::TransformNotFound(run.spec.transform.clone()))?;

            let Some((collection, batch)) = self.next_batch(&run, &policy).await? else {
                return self.finish(&run, &policy).await;
            };

            let started = Instant::now();
            let application = apply_transform(transform.as_ref(), &batch);
            self.check_error_rate(&run, &policy, &application, batch.len())
                .await?;

            if !application.updates.is_empty() {
                let target = &collection;
                let updates = &application.updates;
                let commit = policy
                    .retry("document_store.commit_batch", || async move {
                        self.document_store
                            .commit_batch(target, updates)
                            .await
                            .map_err(MigrationError::from_document_store)
                    })
                    .await;
                if let Err(err) = commit {
                    self.mark_failed(run_id, &policy, &err).await;
                    return Err(err);
                }
            }

            // checkpoint persists only after the batch commit is durable
            let Some(last) = batch.last() else {
                continue;
            };
            let next_checkpoint = Checkpoint::Position {
                collection: collection.clone(),
                last_key: last.key.clone(),
            };
            let persisted = self
                .persist_progress(run_id, &policy, &next_checkpoint, &application)
                .await;
            if let Err(err) = persisted {
                if matches!(err, MigrationError::RetriesExhausted { .. }) {
                    self.mark_failed(run_id, &policy, &err).await;
                }
                return Err(err);
            }

            self.telemetry.on_batch_committed(
                run_id,
                application.processed,
                application.skipped,
                application.errored,
                started.elapsed(),
            );
            tracing::debug!(
                %run_id,
                collection = %collection,
                batch_len = batch.len(),
                processed = application.processed,
                skipped = application.skipped,
                errored = application.errored,
                last_key = %last.key,
                "backfill batch committed"
            );
        }
    }

    /// Partitioned variant: disjoint, contiguous key ranges over a single
    /// target collection, driven concurrently. The persisted checkpoint
    /// advances only to the low-water mark across partitions, so crash
    /// recovery through [`run`](Self::run) stays safe.
    pub async fn run_partitioned(
        &self,
        run_id: &RunId,
        ranges: Vec<KeyRange>,
    ) -> Result<BackfillOutcome> {
        let run = load_run(self.run_store.as_ref(), run_id, &BackoffPolicy::standard()).await?;
        self.ensure_backfilling(&run)?;
        if run.checkpoint.is_complete() {
            return Ok(BackfillOutcome::Completed { counts: run.counts });
        }
        if run.spec.collections.len() != 1 {
            return Err(MigrationError::InvalidState(
                "partitioned backfill supports a single target collection".into(),
            ));
        }
        validate_ranges(&ranges)?;

        let collection = run.spec.collections[0].clone();
        let policy = run.spec.retry_policy();
        let transform = self
            .transforms
            .resolve(&run.spec.transform)
            .ok_or_else(|| MigrationError::TransformNotFound(run.spec.transform.clone()))?;
        let watermark = Arc::new(Mutex::new(LowWaterMark::new(ranges.clone())));

        let outcomes = try_join_all(ranges.iter().enumerate().map(|(partition, range)| {
            self.drive_partition(
                run_id,
                &collection,
                transform.clone(),
                &policy,
                partition,
                range.clone(),
                watermark.clone(),
            )
        }))
        .await?;

        let run = load_run(self.run_store.as_ref(), run_id, &policy).await?;
        if outcomes.contains(&PartitionOutcome::Cancelled) {
            return Ok(BackfillOutcome::Cancelled {
                checkpoint: run.checkpoint,
            });
        }
        if outcomes.contains(&PartitionOutcome::Paused) {
            return Ok(BackfillOutcome::Paused {
                checkpoint: run.checkpoint,
            });
        }
        self.finish(&run, &policy).await
    }

    async fn drive_partition(
        &self,
        run_id: &RunId,
        collection: &CollectionId,
        transform: Arc<dyn DocumentTransform>,
        policy: &BackoffPolicy,
        partition: usize,
        range: KeyRange,
        watermark: Arc<Mutex<LowWaterMark>>,
    ) -> Result<PartitionOutcome> {
        let mut after = range.after.clone();
        loop {
            let run = load_run(self.run_store.as_ref(), run_id, policy).await?;
            self.ensure_backfilling(&run)?;
            if run.status == RunStatus::Paused {
                return Ok(PartitionOutcome::Paused);
            }
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(PartitionOutcome::Cancelled);
            }

            let mut batch = self
                .scan(&run, policy, collection, after.as_ref(), None)
                .await?;
            // trim to this partition's inclusive upper bound
            let mut reached_end = false;
            if let Some(upper) = &range.upper {
                let keep = batch.iter().take_while(|r| &r.key <= upper).count();
                if keep < batch.len() {
                    batch.truncate(keep);
                    reached_end = true;
                }
            }
            let Some(last) = batch.last() else {
                let mut watermark = watermark.lock().await;
                watermark.mark_done(partition);
                self.persist_frontier(run_id, policy, collection, &watermark)
                    .await?;
                return Ok(PartitionOutcome::Done);
            };
            let last_key = last.key.clone();

            let started = Instant::now();
            let application = apply_transform(transform.as_ref(), &batch);
            self.check_error_rate(&run, policy, &application, batch.len())
                .await?;

            if !application.updates.is_empty() {
                let updates = &application.updates;
                let commit = policy
                    .retry("document_store.commit_batch", || async move {
                        self.document_store
                            .commit_batch(collection, updates)
                            .await
                            .map_err(MigrationError::from_document_store)
                    })
                    .await;
                if let Err(err) = commit {
                    self.mark_failed(run_id, policy, &err).await;
                    return Err(err);
                }
            }

            {
                // lock spans the checkpoint write so frontier updates
                // serialize across partitions
                let mut watermark = watermark.lock().await;
                watermark.record_commit(partition, last_key.clone());
                let frontier = watermark.frontier();
                self.persist_partition_progress(run_id, policy, collection, frontier, &application)
                    .await?;
            }

            self.telemetry.on_batch_committed(
                run_id,
                application.processed,
                application.skipped,
                application.errored,
                started.elapsed(),
            );
            if reached_end {
                let mut watermark = watermark.lock().await;
                watermark.mark_done(partition);
                self.persist_frontier(run_id, policy, collection, &watermark)
                    .await?;
                return Ok(PartitionOutcome::Done);
            }
            after = Some(last_key);
        }
    }

    /// Scan the next non-empty batch from the checkpoint, walking forward
    /// across collection boundaries. `None` means every collection is
    /// exhausted.
    async fn next_batch(
        &self,
        run: &MigrationRun,
        policy: &BackoffPolicy,
    ) -> Result<Option<(CollectionId, Vec<DocumentRecord>)>> {
        let (mut index, mut after) = match &run.checkpoint {
            Checkpoint::Start => (0usize, None),
            Checkpoint::Position {
                collection,
                last_key,
            } => {
                let index = run
                    .spec
                    .collections
                    .iter()
                    .position(|c| c == collection)
                    .ok_or_else(|| {
                        MigrationError::InvalidState(format!(
                            "checkpoint references unknown collection {collection}"
                        ))
                    })?;
                (index, Some(last_key.clone()))
            }
            Checkpoint::Complete { .. } => return Ok(None),
        };

        loop {
            let collection = &run.spec.collections[index];
            let batch = self
                .scan(run, policy, collection, after.as_ref(), None)
                .await?;
            if !batch.is_empty() {
                return Ok(Some((collection.clone(), batch)));
            }
            if index + 1 < run.spec.collections.len() {
                index += 1;
                after = None;
            } else {
                return Ok(None);
            }
        }
    }

    async fn scan(
        &self,
        run: &MigrationRun,
        policy: &BackoffPolicy,
        collection: &CollectionId,
        after: Option<&DocumentKey>,
        upper: Option<&DocumentKey>,
    ) -> Result<Vec<DocumentRecord>> {
        let batch_size = run.spec.batch_size;
        let scanned = policy
            .retry("document_store.scan_batch", || async move {
                self.document_store
                    .scan_batch(collection, after, upper, batch_size)
                    .await
                    .map_err(MigrationError::from_document_store)
            })
            .await;
        match scanned {
            Ok(batch) => Ok(batch),
            Err(err) => {
                if matches!(err, MigrationError::RetriesExhausted { .. }) {
                    self.mark_failed(&run.id, policy, &err).await;
                }
                Err(err)
            }
        }
    }

    fn ensure_backfilling(&self, run: &MigrationRun) -> Result<()> {
        if run.phase != MigrationPhase::Backfilling {
            return Err(MigrationError::InvalidState(format!(
                "backfill requires phase backfilling, run {} is {}",
                run.id, run.phase
            )));
        }
        if run.status == RunStatus::Failed {
            return Err(MigrationError::InvalidState(format!(
                "run {} is failed; resume it before backfilling",
                run.id
            )));
        }
        Ok(())
    }

    /// Abort the batch when its transform error rate exceeds the spec
    /// threshold, halting the run at the last good checkpoint.
    async fn check_error_rate(
        &self,
        run: &MigrationRun,
        policy: &BackoffPolicy,
        application: &BatchApplication,
        batch_len: usize,
    ) -> Result<()> {
        if batch_len == 0 {
            return Ok(());
        }
        let error_rate = application.errored as f64 / batch_len as f64;
        if error_rate > run.spec.error_rate_threshold {
            let err = MigrationError::BatchAborted {
                error_rate,
                threshold: run.spec.error_rate_threshold,
                checkpoint: run.checkpoint.clone(),
            };
            self.mark_failed(&run.id, policy, &err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn persist_progress(
        &self,
        run_id: &RunId,
        policy: &BackoffPolicy,
        next_checkpoint: &Checkpoint,
        application: &BatchApplication,
    ) -> Result<MigrationRun> {
        cas_update(
            self.run_store.as_ref(),
            run_id,
            policy,
            self.cas_retry_limit,
            |run| {
                if run.phase != MigrationPhase::Backfilling {
                    return Err(MigrationError::InvalidState(format!(
                        "run left backfilling phase mid-batch (now {})",
                        run.phase
                    )));
                }
                if !next_checkpoint.advances(&run.checkpoint, &run.spec.collections) {
                    return Err(MigrationError::InvalidState(
                        "checkpoint would not advance; another worker moved past this batch".into(),
                    ));
                }
                run.checkpoint = next_checkpoint.clone();
                run.counts.processed += application.processed;
                run.counts.skipped += application.skipped;
                run.counts.errored += application.errored;
                Ok(())
            },
        )
        .await
    }

    async fn persist_partition_progress(
        &self,
        run_id: &RunId,
        policy: &BackoffPolicy,
        collection: &CollectionId,
        frontier: Frontier,
        application: &BatchApplication,
    ) -> Result<()> {
        let next_checkpoint = match frontier {
            Frontier::Start | Frontier::Done => None,
            Frontier::Key(key) => Some(Checkpoint::Position {
                collection: collection.clone(),
                last_key: key,
            }),
        };
        cas_update(
            self.run_store.as_ref(),
            run_id,
            policy,
            self.cas_retry_limit,
            |run| {
                if run.phase != MigrationPhase::Backfilling {
                    return Err(MigrationError::InvalidState(format!(
                        "run left backfilling phase mid-batch (now {})",
                        run.phase
                    )));
                }
                if let Some(next) = &next_checkpoint {
                    // only the low-water mark may move the checkpoint
                    if next.advances(&run.checkpoint, &run.spec.collections) {
                        run.checkpoint = next.clone();
                    }
                }
                run.counts.processed += application.processed;
                run.counts.skipped += application.skipped;
                run.counts.errored += application.errored;
                Ok(())
            },
        )
        .await
        .map(|_| ())
    }

    /// Final frontier write after a partition drains, so the checkpoint
    /// jumps forward past finished partitions.
    async fn persist_frontier(
        &self,
        run_id: &RunId,
        policy: &BackoffPolicy,
        collection: &CollectionId,
        watermark: &LowWaterMark,
    ) -> Result<()> {
        let next_checkpoint = match watermark.frontier() {
            // the wrapper writes the Complete checkpoint once all
            // partitions are done
            Frontier::Start | Frontier::Done => return Ok(()),
            Frontier::Key(key) => Checkpoint::Position {
                collection: collection.clone(),
                last_key: key,
            },
        };
        cas_update(
            self.run_store.as_ref(),
            run_id,
            policy,
            self.cas_retry_limit,
            |run| {
                if run.phase != MigrationPhase::Backfilling {
                    return Err(MigrationError::InvalidState(format!(
                        "run left backfilling phase mid-batch (now {})",
                        run.phase
                    )));
                }
                if next_checkpoint.advances(&run.checkpoint, &run.spec.collections) {
                    run.checkpoint = next_checkpoint.clone();
                }
                Ok(())
            },
        )
        .await
        .map(|_| ())
    }

    /// Mark the checkpoint `Complete` and audit the finished backfill.
    async fn finish(&self, run: &MigrationRun, policy: &BackoffPolicy) -> Result<BackfillOutcome> {
        let last_key = run.checkpoint.last_key().cloned();
        let stored = cas_update(
            self.run_store.as_ref(),
            &run.id,
            policy,
            self.cas_retry_limit,
            |r| {
                if r.phase != MigrationPhase::Backfilling {
                    return Err(MigrationError::InvalidState(format!(
                        "run left backfilling phase before completion (now {})",
                        r.phase
                    )));
                }
                if !r.checkpoint.is_complete() {
                    r.checkpoint = Checkpoint::Complete {
                        last_key: last_key.clone(),
                    };
                }
                Ok(())
            },
        )
        .await?;

        let record = AuditRecord::new(
            stored.id.clone(),
            AuditEvent::BackfillCompleted {
                checkpoint: stored.checkpoint.clone(),
                counts: stored.counts,
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
        tracing::info!(
            run_id = %stored.id,
            processed = stored.counts.processed,
            skipped = stored.counts.skipped,
            errored = stored.counts.errored,
            "backfill completed"
        );
        Ok(BackfillOutcome::Completed {
            counts: stored.counts,
        })
    }

    /// Best-effort: record the failure on the run so the status API and
    /// audit log expose it. The original error is what propagates.
    async fn mark_failed(&self, run_id: &RunId, policy: &BackoffPolicy, err: &MigrationError) {
        let message = err.to_string();
        let marked = cas_update(
            self.run_store.as_ref(),
            run_id,
            policy,
            self.cas_retry_limit,
            |run| {
                run.status = RunStatus::Failed;
                run.last_error = Some(message.clone());
                Ok(())
            },
        )
        .await;
        if let Err(mark_err) = marked {
            tracing::error!(%run_id, error = %mark_err, "failed to record run failure");
            return;
        }
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
}

fn validate_ranges(ranges: &[KeyRange]) -> Result<()> {
    if ranges.is_empty() {
        return Err(MigrationError::InvalidState(
            "partitioned backfill needs at least one key range".into(),
        ));
    }
    for window in ranges.windows(2) {
        let upper = window[0].upper.as_ref();
        let next_after = window[1].after.as_ref();
        if upper.is_none() || upper != next_after {
            return Err(MigrationError::InvalidState(
                "partition ranges must be contiguous and ordered".into(),
            ));
        }
    }
    if let Some(last) = ranges.last() {
        if last.upper.is_some() {
            return Err(MigrationError::InvalidState(
                "the final partition range must be unbounded above".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformError;
    use serde_json::{json, Value};

    struct Widen;

    impl DocumentTransform for Widen {
        fn apply(&self, old: &Value) -> std::result::Result<Value, TransformError> {
            match old.get("v") {
                Some(v) => Ok(json!({ "v2": v })),
                None => Err(TransformError::MissingField("v".into())),
            }
        }
    }

    fn key(s: &str) -> DocumentKey {
        DocumentKey::new(s)
    }

    #[test]
    fn apply_transform_splits_outcomes() {
        let batch = vec![
            DocumentRecord::old_only("a", json!({"v": 1})),
            DocumentRecord::old_only("b", json!({"broken": true})),
            DocumentRecord::new(key("c"), crate::document::DocumentShape::New(json!({"v2": 3}))),
            DocumentRecord::both(key("d"), json!({"v": 4}), json!({"v2": 0})),
        ];
        let result = apply_transform(&Widen, &batch);
        assert_eq!(result.processed, 2); // a and the re-derived d
        assert_eq!(result.errored, 1); // b
        assert_eq!(result.skipped, 1); // c
        assert_eq!(result.updates.len(), 2);
        // d converges on transform(old), whatever was stored before
        assert_eq!(
            result.updates[1].shape.new_fields(),
            Some(&json!({"v2": 4}))
        );
    }

    #[test]
    fn low_water_mark_tracks_minimum_boundary() {
        let ranges = vec![
            KeyRange::new(None, Some(key("m"))),
            KeyRange::new(Some(key("m")), None),
        ];
        let mut lwm = LowWaterMark::new(ranges);
        assert_eq!(lwm.frontier(), Frontier::Start);

        // the faster second partition cannot move the frontier
        lwm.record_commit(1, key("t"));
        assert_eq!(lwm.frontier(), Frontier::Start);

        lwm.record_commit(0, key("f"));
        assert_eq!(lwm.frontier(), Frontier::Key(key("f")));

        // once partition 0 drains, the frontier jumps to partition 1
        lwm.mark_done(0);
        assert_eq!(lwm.frontier(), Frontier::Key(key("t")));

        lwm.mark_done(1);
        assert_eq!(lwm.frontier(), Frontier::Done);
        assert!(lwm.all_done());
    }

    #[test]
    fn untouched_partition_frontier_is_its_range_start() {
        let ranges = vec![
            KeyRange::new(None, Some(key("m"))),
            KeyRange::new(Some(key("m")), None),
        ];
        let mut lwm = LowWaterMark::new(ranges);
        lwm.mark_done(0);
        // partition 1 untouched: everything through "m" is committed
        assert_eq!(lwm.frontier(), Frontier::Key(key("m")));
    }

    #[test]
    fn range_validation_requires_contiguity() {
        assert!(validate_ranges(&[]).is_err());
        assert!(validate_ranges(&[
            KeyRange::new(None, Some(key("m"))),
            KeyRange::new(Some(key("n")), None),
        ])
        .is_err());
        assert!(validate_ranges(&[
            KeyRange::new(None, Some(key("m"))),
            KeyRange::new(Some(key("m")), Some(key("z"))),
        ])
        .is_err());
        assert!(validate_ranges(&[
            KeyRange::new(None, Some(key("m"))),
            KeyRange::new(Some(key("m")), None),
        ])
        .is_ok());
    }
}
