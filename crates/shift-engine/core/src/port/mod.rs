//! Ports for the engine's infrastructure collaborators.
//!
//! Each port is a trait the engine programs against; implementations live
//! outside this crate (a Firestore-like store in production, in-memory
//! adapters in `shift-engine-testing`).

pub mod audit;
pub mod document_store;
pub mod flag_store;
pub mod run_store;

pub use audit::{AuditEvent, AuditRecord, AuditSink, AuditSinkError};
pub use document_store::{DocumentStore, DocumentStoreError};
pub use flag_store::{FlagStore, FlagStoreError, ReadRoute, RoutingFlag, VersionedFlag, WriteRoute};
pub use run_store::{cas_update, load_run, RunStore, RunStoreError};
