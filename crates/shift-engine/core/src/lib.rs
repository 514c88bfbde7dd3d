//! # shift-engine-core
//!
//! Zero-downtime schema migration engine for live document collections:
//! a phased expand → backfill → dual-write → verify → contract workflow
//! with resumable, idempotent, crash-safe batch processing and a
//! non-destructive rollback path.
//!
//! ## Architecture
//!
//! This crate defines the engine and its port traits; it has no
//! infrastructure dependencies. Document store, run store, flag store, and
//! audit sink are collaborators behind [`port`] traits, with in-memory
//! implementations in `shift-engine-testing`.
//!
//! ## Modules
//!
//! - [`migration`]: [`MigrationSpec`], [`MigrationRun`], [`MigrationPhase`], [`Checkpoint`]
//! - [`document`]: [`DocumentRecord`] with its tagged [`DocumentShape`]
//! - [`transform`]: [`DocumentTransform`] and the [`TransformRegistry`]
//! - [`port`]: infrastructure collaborator traits
//! - [`orchestrator`]: phase state machine and control API
//! - [`backfill`]: resumable batch worker, low-water-mark partitioning
//! - [`router`]: per-request dual-read/write routing
//! - [`verifier`]: count and sampled-transform verification
//! - [`rollback`]: non-destructive emergency reversal
//! - [`error`]: the engine error taxonomy
//! - [`backoff`]: explicit retry state with exponential backoff and jitter
//! - [`telemetry`]: tracing setup and instrumentation hooks

pub mod backfill;
pub mod backoff;
pub mod document;
pub mod error;
pub mod migration;
pub mod orchestrator;
pub mod port;
pub mod rollback;
pub mod router;
pub mod telemetry;
pub mod transform;
pub mod verifier;

pub use backfill::{BackfillOutcome, BackfillWorker, Frontier, KeyRange, LowWaterMark};
pub use backoff::BackoffPolicy;
pub use document::{DocumentKey, DocumentRecord, DocumentShape};
pub use error::{MigrationError, Result};
pub use migration::{
    Checkpoint, CollectionId, MigrationPhase, MigrationRun, MigrationSpec, RunCounts, RunId,
    RunStatus, RunStatusView, SpecId,
};
pub use orchestrator::{EnvConfig, MigrationOrchestrator, OrchestratorConfig};
pub use port::{
    cas_update, load_run, AuditEvent, AuditRecord, AuditSink, AuditSinkError, DocumentStore,
    DocumentStoreError, FlagStore, FlagStoreError, ReadRoute, RoutingFlag, RunStore, RunStoreError,
    VersionedFlag, WriteRoute,
};
pub use rollback::RollbackController;
pub use router::{
    dual_write_shape, flag_for_phase, resolve_read, set_routing_flag, ResolvedRead, RouterConfig,
    SchemaRouter,
};
pub use telemetry::{
    init_telemetry, MigrationTelemetry, TelemetryConfig, TelemetryGuard, TracingTelemetry,
};
pub use transform::{DocumentTransform, TransformError, TransformId, TransformRegistry};
pub use verifier::{
    Mismatch, MismatchReason, VerificationReport, Verdict, Verifier, VerifierConfig,
};
