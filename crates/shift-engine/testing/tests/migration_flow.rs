//! End-to-end migration scenarios against the in-memory adapters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;

use shift_engine_core::backfill::{BackfillOutcome, KeyRange};
use shift_engine_core::document::{DocumentKey, DocumentRecord, DocumentShape};
use shift_engine_core::error::MigrationError;
use shift_engine_core::migration::{Checkpoint, MigrationPhase, RunStatus};
use shift_engine_core::port::document_store::DocumentStore;
use shift_engine_core::port::flag_store::{ReadRoute, WriteRoute};
use shift_engine_core::router::{dual_write_shape, resolve_read, ResolvedRead};
use shift_engine_core::transform::DocumentTransform;
use shift_engine_core::verifier::{Verdict, VerifierConfig};
use shift_engine_testing::fixtures::{
    contact, corrupt_contact, BatchProbe, SplitNameTransform, TestHarness,
};

fn key(i: usize) -> DocumentKey {
    DocumentKey::new(format!("doc-{i:03}"))
}

/// Scenario A: batch_size 2 over 5 documents completes in 3 batches with
/// the checkpoint resting on the last document.
#[tokio::test]
async fn backfill_completes_in_expected_batches() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(5);
    let run_id = harness.start_backfilling(harness.spec(2)).await?;

    let probe = BatchProbe::new();
    let worker = harness.worker().with_telemetry(probe.clone());
    let outcome = worker.run(&run_id).await?;

    let BackfillOutcome::Completed { counts } = outcome else {
        anyhow::bail!("expected completed outcome, got {outcome:?}");
    };
    assert_eq!(counts.processed, 5);
    assert_eq!(counts.errored, 0);
    assert_eq!(probe.batches(), 3); // 2 + 2 + 1

    let status = harness.orchestrator.status(&run_id).await?;
    assert_eq!(status.counts.expected, 5);
    assert_eq!(
        status.checkpoint,
        Checkpoint::Complete {
            last_key: Some(key(5)),
        }
    );
    Ok(())
}

/// Scenario B: a transform error on one of five documents under the skip
/// policy; the run reaches Completed-with-warnings with the error counted.
#[tokio::test]
async fn transform_error_is_skipped_and_recorded() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.documents.seed(
        &TestHarness::collection(),
        vec![
            contact(1),
            contact(2),
            corrupt_contact(3),
            contact(4),
            contact(5),
        ],
    );
    let spec = harness.spec(5).with_error_rate_threshold(0.5);
    let run_id = harness.start_backfilling(spec).await?;

    let outcome = harness.worker().run(&run_id).await?;
    let BackfillOutcome::Completed { counts } = outcome else {
        anyhow::bail!("expected completed outcome, got {outcome:?}");
    };
    assert_eq!(counts.processed, 4);
    assert_eq!(counts.errored, 1);

    // the skipped document keeps its old shape only
    let snapshot = harness.documents.snapshot(&TestHarness::collection());
    assert!(!snapshot[2].shape.has_new());

    harness.orchestrator.advance(&run_id).await?; // -> DualWriting
    harness.orchestrator.advance(&run_id).await?; // -> Verifying
    // the operator accepts the one recorded casualty
    let report = harness
        .verifier(VerifierConfig::new().with_sample_rate(1.0).with_tolerance(1))
        .run(&run_id)
        .await?;
    assert_eq!(report.verdict, Verdict::Pass);

    harness.orchestrator.advance(&run_id).await?; // -> Contracting
    harness.orchestrator.advance(&run_id).await?; // -> Completed

    let status = harness.orchestrator.status(&run_id).await?;
    assert_eq!(status.phase, MigrationPhase::Completed);
    assert_eq!(status.status, RunStatus::CompletedWithWarnings);
    Ok(())
}

/// Scenario C: interrupt after the first committed batch; the restart
/// resumes at batch 2 and the final state matches an uninterrupted run.
#[tokio::test]
async fn interrupted_backfill_resumes_from_checkpoint() -> anyhow::Result<()> {
    let interrupted = TestHarness::new();
    interrupted.seed_contacts(6);
    let run_id = interrupted.start_backfilling(interrupted.spec(2)).await?;

    // stop cooperatively once batch 1 has durably committed
    let worker = interrupted.worker();
    let probe = BatchProbe::cancelling_after(1, worker.cancellation_flag());
    let outcome = worker.with_telemetry(probe).run(&run_id).await?;
    let BackfillOutcome::Cancelled { checkpoint } = outcome else {
        anyhow::bail!("expected cancelled outcome, got {outcome:?}");
    };
    assert_eq!(
        checkpoint,
        Checkpoint::Position {
            collection: TestHarness::collection(),
            last_key: key(2),
        }
    );

    // "restart": a fresh worker picks up from the persisted checkpoint
    let probe = BatchProbe::new();
    let outcome = interrupted
        .worker()
        .with_telemetry(probe.clone())
        .run(&run_id)
        .await?;
    let BackfillOutcome::Completed { counts } = outcome else {
        anyhow::bail!("expected completed outcome, got {outcome:?}");
    };
    assert_eq!(counts.processed, 6);
    assert_eq!(probe.batches(), 2); // batches 2 and 3 only

    // byte-for-byte identical to a run that was never interrupted
    let uninterrupted = TestHarness::new();
    uninterrupted.seed_contacts(6);
    let other_run = uninterrupted
        .start_backfilling(uninterrupted.spec(2))
        .await?;
    uninterrupted.worker().run(&other_run).await?;
    assert_eq!(
        interrupted.documents.snapshot(&TestHarness::collection()),
        uninterrupted.documents.snapshot(&TestHarness::collection()),
    );
    Ok(())
}

/// Scenario D: one planted mismatch in a fully-sampled collection fails
/// verification and blocks Contracting.
#[tokio::test]
async fn verification_mismatch_blocks_contracting() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(10);
    let run_id = harness.start_backfilling(harness.spec(10)).await?;
    harness.worker().run(&run_id).await?;
    harness.orchestrator.advance(&run_id).await?; // -> DualWriting
    harness.orchestrator.advance(&run_id).await?; // -> Verifying

    // plant new-schema fields that the transform cannot have produced
    harness.documents.put(
        &TestHarness::collection(),
        DocumentRecord::both(
            key(7),
            json!({"name": "First7 Last7"}),
            json!({"first_name": "Imposter", "last_name": "Last7"}),
        ),
    );

    let report = harness
        .verifier(VerifierConfig::new().with_sample_rate(1.0))
        .run(&run_id)
        .await?;
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(report.sample_size, 10);
    assert_eq!(report.mismatch_count, 1);
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].key, key(7));

    let err = harness.orchestrator.advance(&run_id).await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::VerificationFailed {
            mismatches: 1,
            sample_size: 10,
        }
    ));
    Ok(())
}

/// Scenario E: rollback during DualWriting flips routing to OLD atomically
/// and terminates the run; a second rollback is a no-op with the same state.
#[tokio::test]
async fn rollback_is_atomic_and_idempotent() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(4);
    let run_id = harness.start_backfilling(harness.spec(2)).await?;
    harness.worker().run(&run_id).await?;
    harness.orchestrator.advance(&run_id).await?; // -> DualWriting

    let router = harness.router();
    let collection = TestHarness::collection();
    assert_eq!(
        router.route_read(&collection).await?,
        ReadRoute::NewWithFallback
    );

    let first = harness
        .orchestrator
        .rollback(&run_id, "latency regression")
        .await?;
    assert_eq!(first.phase, MigrationPhase::RolledBack);
    assert_eq!(first.status, RunStatus::RolledBack);
    assert_eq!(router.route_read(&collection).await?, ReadRoute::Old);
    assert_eq!(router.route_write(&collection).await?, WriteRoute::OldOnly);

    // new-schema fields are left in place for a remediation run
    let snapshot = harness.documents.snapshot(&collection);
    assert!(snapshot.iter().all(|record| record.shape.has_new()));

    let second = harness
        .orchestrator
        .rollback(&run_id, "still rolled back")
        .await?;
    assert_eq!(second, first);

    let rollback_audits = harness
        .audit
        .records_for(&run_id)
        .into_iter()
        .filter(|record| {
            matches!(
                record.event,
                shift_engine_core::port::audit::AuditEvent::RolledBack { .. }
            )
        })
        .count();
    assert_eq!(rollback_audits, 1);
    Ok(())
}

/// Rollback after Contracting is a fatal, non-retryable error.
#[tokio::test]
async fn rollback_after_contracting_is_rejected() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(3);
    let run_id = harness.start_backfilling(harness.spec(3)).await?;
    harness.worker().run(&run_id).await?;
    harness.orchestrator.advance(&run_id).await?; // -> DualWriting
    harness.orchestrator.advance(&run_id).await?; // -> Verifying
    harness
        .verifier(VerifierConfig::new().with_sample_rate(1.0))
        .run(&run_id)
        .await?;
    harness.orchestrator.advance(&run_id).await?; // -> Contracting

    let err = harness
        .orchestrator
        .rollback(&run_id, "too late")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::RollbackInvalidState {
            phase: MigrationPhase::Contracting,
        }
    ));
    assert!(err.is_fatal());
    Ok(())
}

/// Monotonic phases: the audited sequence of a full run never goes
/// backwards and ends in Completed.
#[tokio::test]
async fn full_run_phases_are_monotonic() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(4);
    let run_id = harness.start_backfilling(harness.spec(2)).await?;

    // advancing mid-backfill leaves the phase unchanged
    assert_eq!(
        harness.orchestrator.advance(&run_id).await?,
        MigrationPhase::Backfilling
    );

    harness.worker().run(&run_id).await?;
    harness.orchestrator.advance(&run_id).await?; // -> DualWriting
    harness.orchestrator.advance(&run_id).await?; // -> Verifying
    harness
        .verifier(VerifierConfig::new().with_sample_rate(1.0))
        .run(&run_id)
        .await?;
    harness.orchestrator.advance(&run_id).await?; // -> Contracting
    harness.orchestrator.advance(&run_id).await?; // -> Completed

    // advancing a terminal run is a no-op
    assert_eq!(
        harness.orchestrator.advance(&run_id).await?,
        MigrationPhase::Completed
    );

    let transitions = harness.audit.phase_changes(&run_id);
    assert_eq!(transitions.len(), 6);
    assert!(transitions.iter().all(|(from, to)| from < to));
    assert_eq!(
        transitions.last().map(|(_, to)| *to),
        Some(MigrationPhase::Completed)
    );

    let status = harness.orchestrator.status(&run_id).await?;
    assert_eq!(status.status, RunStatus::Completed);
    Ok(())
}

/// Dual-write atomicity: during DualWriting a write carries both shapes in
/// one record, and readers observe them together.
#[tokio::test]
async fn dual_writes_keep_both_shapes_together() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(2);
    let run_id = harness.start_backfilling(harness.spec(2)).await?;
    harness.worker().run(&run_id).await?;
    harness.orchestrator.advance(&run_id).await?; // -> DualWriting

    let collection = TestHarness::collection();
    let router = harness.router();
    assert_eq!(router.route_write(&collection).await?, WriteRoute::Both);

    // the CRUD layer routes an incoming write through the dual-write shape
    let incoming = json!({"name": "Edith Clarke"});
    let shape = dual_write_shape(incoming, &SplitNameTransform)?;
    let record = DocumentRecord::new(key(1), shape);
    harness
        .documents
        .commit_batch(&collection, std::slice::from_ref(&record))
        .await
        .map_err(MigrationError::from_document_store)?;

    let stored = harness
        .documents
        .get(&collection, &key(1))
        .await
        .map_err(MigrationError::from_document_store)?
        .expect("document exists");
    let DocumentShape::Both { old, new } = &stored.shape else {
        anyhow::bail!("expected both shapes, got {:?}", stored.shape);
    };
    assert_eq!(old["name"], "Edith Clarke");
    assert_eq!(new["first_name"], "Edith");

    // reads prefer the new shape, falling back only with a staleness signal
    let resolved = resolve_read(router.route_read(&collection).await?, &stored);
    assert_eq!(
        resolved,
        Some(ResolvedRead::Current(
            json!({"first_name": "Edith", "last_name": "Clarke"})
        ))
    );
    Ok(())
}

/// Transform idempotence: re-deriving already-backfilled documents leaves
/// them unchanged.
#[tokio::test]
async fn reapplying_backfill_converges() -> anyhow::Result<()> {
    let transform = SplitNameTransform;
    let old = json!({"name": "Ada Lovelace"});
    let once = transform.apply(&old)?;
    let twice = transform.apply(&old)?;
    assert_eq!(once, twice);

    // a worker re-run over a completed collection changes nothing
    let harness = TestHarness::new();
    harness.seed_contacts(4);
    let run_id = harness.start_backfilling(harness.spec(2)).await?;
    harness.worker().run(&run_id).await?;
    let first_pass = harness.documents.snapshot(&TestHarness::collection());

    let outcome = harness.worker().run(&run_id).await?;
    assert!(matches!(outcome, BackfillOutcome::Completed { .. }));
    assert_eq!(
        harness.documents.snapshot(&TestHarness::collection()),
        first_pass
    );
    Ok(())
}

/// A second run on a collection with a non-terminal run is rejected.
#[tokio::test]
async fn concurrent_runs_on_a_collection_are_rejected() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(3);
    let first = harness.orchestrator.start(harness.spec(2)).await?;

    let err = harness
        .orchestrator
        .start(harness.spec(2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::ConcurrentRun { ref run_id, .. } if *run_id == first
    ));

    // once the first run is terminal, a new one may start
    harness.orchestrator.rollback(&first, "make way").await?;
    // the collection now carries no new-schema fields, so it is pristine
    assert!(harness.orchestrator.start(harness.spec(2)).await.is_ok());
    Ok(())
}

/// Starting over a collection that already has new-schema documents fails.
#[tokio::test]
async fn start_requires_pristine_collections() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.documents.seed(
        &TestHarness::collection(),
        vec![
            contact(1),
            DocumentRecord::both(key(2), json!({"name": "A B"}), json!({"first_name": "A"})),
        ],
    );
    let err = harness
        .orchestrator
        .start(harness.spec(2))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::CollectionNotPristine { .. }));
    Ok(())
}

/// Pause suspends between batches without losing the checkpoint; resume
/// continues to completion.
#[tokio::test]
async fn pause_and_resume_preserve_checkpoint() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(4);
    let run_id = harness.start_backfilling(harness.spec(2)).await?;

    harness.orchestrator.pause(&run_id).await?;
    let outcome = harness.worker().run(&run_id).await?;
    assert!(matches!(outcome, BackfillOutcome::Paused { .. }));

    let err = harness.orchestrator.advance(&run_id).await.unwrap_err();
    assert!(matches!(err, MigrationError::InvalidState(_)));

    harness.orchestrator.resume(&run_id).await?;
    let outcome = harness.worker().run(&run_id).await?;
    let BackfillOutcome::Completed { counts } = outcome else {
        anyhow::bail!("expected completed outcome, got {outcome:?}");
    };
    assert_eq!(counts.processed, 4);
    Ok(())
}

/// Exceeding the error-rate threshold aborts the batch at the last good
/// checkpoint and marks the run failed with an intact cursor.
#[tokio::test]
async fn error_rate_threshold_aborts_batch() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.documents.seed(
        &TestHarness::collection(),
        vec![
            contact(1),
            contact(2),
            corrupt_contact(3),
            corrupt_contact(4),
            contact(5),
            contact(6),
        ],
    );
    let spec = harness.spec(2).with_error_rate_threshold(0.5);
    let run_id = harness.start_backfilling(spec).await?;

    let err = harness.worker().run(&run_id).await.unwrap_err();
    let MigrationError::BatchAborted {
        error_rate,
        checkpoint,
        ..
    } = err
    else {
        anyhow::bail!("expected batch abort, got {err:?}");
    };
    assert_eq!(error_rate, 1.0); // both documents of batch 2 failed
    assert_eq!(
        checkpoint,
        Checkpoint::Position {
            collection: TestHarness::collection(),
            last_key: key(2),
        }
    );

    let status = harness.orchestrator.status(&run_id).await?;
    assert_eq!(status.status, RunStatus::Failed);
    assert!(status.last_error.is_some());
    // batch 1 stayed committed, nothing past the checkpoint was touched
    let snapshot = harness.documents.snapshot(&TestHarness::collection());
    assert!(snapshot[0].shape.has_new());
    assert!(snapshot[1].shape.has_new());
    assert!(snapshot[4].shape.has_old() && !snapshot[4].shape.has_new());
    Ok(())
}

/// Transient store errors are retried; exhausting the budget marks the run
/// failed, and a resume completes from the intact checkpoint.
#[tokio::test]
async fn transient_failures_retry_then_fail_then_resume() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(4);
    let spec = harness.spec(2).with_max_retries(1);
    let run_id = harness.start_backfilling(spec).await?;

    // two consecutive faults beat a budget of one retry
    harness.documents.fail_next_scans(2);
    let err = harness.worker().run(&run_id).await.unwrap_err();
    assert!(matches!(err, MigrationError::RetriesExhausted { .. }));

    let status = harness.orchestrator.status(&run_id).await?;
    assert_eq!(status.status, RunStatus::Failed);
    assert!(status.last_error.is_some());

    harness.orchestrator.resume(&run_id).await?;
    let outcome = harness.worker().run(&run_id).await?;
    let BackfillOutcome::Completed { counts } = outcome else {
        anyhow::bail!("expected completed outcome, got {outcome:?}");
    };
    assert_eq!(counts.processed, 4);
    Ok(())
}

/// Partitioned backfill over disjoint key ranges matches the sequential
/// result, with the checkpoint governed by the low-water mark.
#[tokio::test]
async fn partitioned_backfill_matches_sequential() -> anyhow::Result<()> {
    let partitioned = TestHarness::new();
    partitioned.seed_contacts(9);
    let run_id = partitioned
        .start_backfilling(partitioned.spec(2))
        .await?;

    let ranges = vec![
        KeyRange::new(None, Some(key(4))),
        KeyRange::new(Some(key(4)), None),
    ];
    let outcome = partitioned.worker().run_partitioned(&run_id, ranges).await?;
    let BackfillOutcome::Completed { counts } = outcome else {
        anyhow::bail!("expected completed outcome, got {outcome:?}");
    };
    assert_eq!(counts.processed, 9);

    let sequential = TestHarness::new();
    sequential.seed_contacts(9);
    let other_run = sequential.start_backfilling(sequential.spec(2)).await?;
    sequential.worker().run(&other_run).await?;

    assert_eq!(
        partitioned.documents.snapshot(&TestHarness::collection()),
        sequential.documents.snapshot(&TestHarness::collection()),
    );
    let status = partitioned.orchestrator.status(&run_id).await?;
    assert!(status.checkpoint.is_complete());
    Ok(())
}

/// The staleness signal fires only while a document still lacks its new
/// shape.
#[tokio::test]
async fn fallback_reads_surface_staleness_during_backfill() -> anyhow::Result<()> {
    let harness = TestHarness::new();
    harness.seed_contacts(2);
    let run_id = harness.start_backfilling(harness.spec(1)).await?;

    // stop after the first document so the second is still old-only
    let worker = harness.worker();
    let probe = BatchProbe::cancelling_after(1, worker.cancellation_flag());
    worker.with_telemetry(probe).run(&run_id).await?;

    let collection = TestHarness::collection();
    let snapshot = harness.documents.snapshot(&collection);
    let migrated = resolve_read(ReadRoute::NewWithFallback, &snapshot[0]);
    assert!(matches!(migrated, Some(ResolvedRead::Current(_))));
    let pending = resolve_read(ReadRoute::NewWithFallback, &snapshot[1]);
    assert!(matches!(pending, Some(ResolvedRead::StaleFallback(_))));
    Ok(())
}
