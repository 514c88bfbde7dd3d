//! # shift-engine-testing
//!
//! Testing utilities for the migration engine: in-memory implementations
//! of every port plus fixtures wiring them to the engine components.

pub mod fixtures;
pub mod memory_audit_sink;
pub mod memory_document_store;
pub mod memory_flag_store;
pub mod memory_run_store;

pub use fixtures::{
    contact, corrupt_contact, split_name_id, BatchProbe, SplitNameTransform, TestHarness,
    TestOrchestrator, TestVerifier, TestWorker,
};
pub use memory_audit_sink::InMemoryAuditSink;
pub use memory_document_store::InMemoryDocumentStore;
pub use memory_flag_store::InMemoryFlagStore;
pub use memory_run_store::InMemoryRunStore;
