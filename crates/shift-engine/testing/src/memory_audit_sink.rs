//! In-memory implementation of the AuditSink port.

use parking_lot::Mutex;

use async_trait::async_trait;
use shift_engine_core::migration::RunId;
use shift_engine_core::port::audit::{AuditEvent, AuditRecord, AuditSink, AuditSinkError};

/// Append-only in-memory audit log.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record appended so far, in order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records for one run, in order.
    pub fn records_for(&self, run_id: &RunId) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| &record.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Phase transitions for one run, in order, as `(from, to)` pairs.
    pub fn phase_changes(
        &self,
        run_id: &RunId,
    ) -> Vec<(
        shift_engine_core::migration::MigrationPhase,
        shift_engine_core::migration::MigrationPhase,
    )> {
        self.records_for(run_id)
            .into_iter()
            .filter_map(|record| match record.event {
                AuditEvent::PhaseChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    type Error = std::convert::Infallible;

    async fn append(&self, record: AuditRecord) -> Result<(), AuditSinkError<Self::Error>> {
        self.records.lock().push(record);
        Ok(())
    }
}
