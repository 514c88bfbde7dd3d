//! Test fixtures: a canonical transform, seeded contacts, and a harness
//! wiring the engine to the in-memory adapters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use shift_engine_core::backfill::BackfillWorker;
use shift_engine_core::backoff::BackoffPolicy;
use shift_engine_core::document::DocumentRecord;
use shift_engine_core::error::Result;
use shift_engine_core::migration::{
    CollectionId, MigrationPhase, MigrationSpec, RunId, SpecId,
};
use shift_engine_core::orchestrator::{MigrationOrchestrator, OrchestratorConfig};
use shift_engine_core::router::{RouterConfig, SchemaRouter};
use shift_engine_core::telemetry::MigrationTelemetry;
use shift_engine_core::transform::{
    DocumentTransform, TransformError, TransformId, TransformRegistry,
};
use shift_engine_core::verifier::{Verdict, Verifier, VerifierConfig};

use crate::memory_audit_sink::InMemoryAuditSink;
use crate::memory_document_store::InMemoryDocumentStore;
use crate::memory_flag_store::InMemoryFlagStore;
use crate::memory_run_store::InMemoryRunStore;

pub type TestOrchestrator = MigrationOrchestrator<
    InMemoryRunStore,
    InMemoryDocumentStore,
    InMemoryFlagStore,
    InMemoryAuditSink,
>;
pub type TestWorker = BackfillWorker<InMemoryDocumentStore, InMemoryRunStore, InMemoryAuditSink>;
pub type TestVerifier = Verifier<InMemoryDocumentStore, InMemoryRunStore, InMemoryAuditSink>;

/// Splits a contact's `name` into `first_name` / `last_name`.
///
/// Documents without a `name` field fail, which is how tests inject
/// per-document transform errors.
pub struct SplitNameTransform;

impl DocumentTransform for SplitNameTransform {
    fn apply(&self, old: &Value) -> std::result::Result<Value, TransformError> {
        let name = old
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TransformError::MissingField("name".into()))?;
        let (first, last) = name.split_once(' ').unwrap_or((name, ""));
        Ok(json!({
            "first_name": first,
            "last_name": last,
        }))
    }
}

pub fn split_name_id() -> TransformId {
    TransformId::new("split-name")
}

/// Contact `i` with a zero-padded key so lexicographic key order matches
/// numeric order.
pub fn contact(i: usize) -> DocumentRecord {
    DocumentRecord::old_only(
        format!("doc-{i:03}"),
        json!({ "name": format!("First{i} Last{i}") }),
    )
}

/// Contact with no `name` field; its transform always fails.
pub fn corrupt_contact(i: usize) -> DocumentRecord {
    DocumentRecord::old_only(format!("doc-{i:03}"), json!({ "nickname": "???" }))
}

/// Telemetry probe counting committed batches, optionally raising a
/// cancellation flag after a fixed number of them (crash simulation).
#[derive(Default)]
pub struct BatchProbe {
    batches: AtomicU64,
    cancel_after: u64,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl BatchProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Raise `flag` once `n` batches have committed.
    pub fn cancelling_after(n: u64, flag: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            batches: AtomicU64::new(0),
            cancel_after: n,
            cancel_flag: Some(flag),
        })
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }
}

impl MigrationTelemetry for BatchProbe {
    fn on_run_started(&self, _run_id: &RunId, _spec_id: &SpecId) {}

    fn on_phase_changed(&self, _run_id: &RunId, _from: MigrationPhase, _to: MigrationPhase) {}

    fn on_batch_committed(
        &self,
        _run_id: &RunId,
        _processed: u64,
        _skipped: u64,
        _errored: u64,
        _duration: Duration,
    ) {
        let committed = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(flag) = &self.cancel_flag {
            if self.cancel_after > 0 && committed >= self.cancel_after {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    fn on_verification_completed(&self, _run_id: &RunId, _verdict: Verdict, _mismatches: u64) {}

    fn on_rollback(&self, _run_id: &RunId, _phase: MigrationPhase, _reason: &str) {}

    fn on_run_failed(&self, _run_id: &RunId, _error: &str) {}
}

/// Engine wired to fresh in-memory adapters.
pub struct TestHarness {
    pub documents: Arc<InMemoryDocumentStore>,
    pub runs: Arc<InMemoryRunStore>,
    pub flags: Arc<InMemoryFlagStore>,
    pub audit: Arc<InMemoryAuditSink>,
    pub transforms: Arc<TransformRegistry>,
    pub orchestrator: TestOrchestrator,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let flags = Arc::new(InMemoryFlagStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let transforms = Arc::new(TransformRegistry::new());
        transforms.register(split_name_id(), Arc::new(SplitNameTransform));

        let orchestrator = MigrationOrchestrator::new(
            OrchestratorConfig::new().with_retry(BackoffPolicy::immediate()),
            runs.clone(),
            documents.clone(),
            flags.clone(),
            audit.clone(),
        );

        Self {
            documents,
            runs,
            flags,
            audit,
            transforms,
            orchestrator,
        }
    }

    pub fn collection() -> CollectionId {
        CollectionId::new("contacts")
    }

    /// Spec over the contacts collection with a fast test backoff.
    pub fn spec(&self, batch_size: usize) -> MigrationSpec {
        MigrationSpec::new(
            "contacts-split-name",
            vec![Self::collection()],
            split_name_id(),
        )
        .with_batch_size(batch_size)
        .with_backoff(BackoffPolicy::immediate())
    }

    /// Seed contacts `1..=n`.
    pub fn seed_contacts(&self, n: usize) {
        self.documents
            .seed(&Self::collection(), (1..=n).map(contact).collect());
    }

    pub fn worker(&self) -> TestWorker {
        BackfillWorker::new(
            self.documents.clone(),
            self.runs.clone(),
            self.audit.clone(),
            self.transforms.clone(),
        )
    }

    pub fn verifier(&self, config: VerifierConfig) -> TestVerifier {
        Verifier::new(
            config,
            self.documents.clone(),
            self.runs.clone(),
            self.audit.clone(),
            self.transforms.clone(),
        )
    }

    pub fn router(&self) -> SchemaRouter<InMemoryFlagStore> {
        SchemaRouter::new(RouterConfig::default(), self.flags.clone())
    }

    /// Start a run and advance it into Backfilling.
    pub async fn start_backfilling(&self, spec: MigrationSpec) -> Result<RunId> {
        let run_id = self.orchestrator.start(spec).await?;
        self.orchestrator.advance(&run_id).await?; // -> Expanding
        self.orchestrator.advance(&run_id).await?; // -> Backfilling
        Ok(run_id)
    }
}
