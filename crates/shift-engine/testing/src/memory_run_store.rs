//! In-memory implementation of the RunStore port with optimistic locking.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use shift_engine_core::migration::{CollectionId, MigrationRun, RunId};
use shift_engine_core::port::run_store::{RunStore, RunStoreError};

/// In-memory run store. CAS semantics match the port contract exactly:
/// `update` succeeds only when the stored version equals the expected one,
/// and the stored copy gets `expected + 1`.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, MigrationRun>>,
    /// Remaining update calls to fail with a transient error.
    fail_updates: AtomicU32,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` updates fail with a transient error.
    pub fn fail_next_updates(&self, n: u32) {
        self.fail_updates.store(n, Ordering::SeqCst);
    }

    /// Direct read for assertions.
    pub fn inspect(&self, run_id: &RunId) -> Option<MigrationRun> {
        self.runs.read().get(run_id).cloned()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    type Error = std::convert::Infallible;

    async fn create(&self, run: &MigrationRun) -> Result<(), RunStoreError<Self::Error>> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(RunStoreError::AlreadyExists {
                run_id: run.id.clone(),
            });
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<MigrationRun, RunStoreError<Self::Error>> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunStoreError::not_found(run_id.clone()))
    }

    async fn update(
        &self,
        run: &MigrationRun,
        expected_version: u64,
    ) -> Result<MigrationRun, RunStoreError<Self::Error>> {
        if self
            .fail_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RunStoreError::Transient("injected update failure".into()));
        }
        let mut runs = self.runs.write();
        let stored = runs
            .get_mut(&run.id)
            .ok_or_else(|| RunStoreError::not_found(run.id.clone()))?;
        if stored.version != expected_version {
            return Err(RunStoreError::conflict(expected_version, stored.version));
        }
        let mut updated = run.clone();
        updated.version = expected_version + 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn find_active(
        &self,
        collection: &CollectionId,
    ) -> Result<Option<MigrationRun>, RunStoreError<Self::Error>> {
        Ok(self
            .runs
            .read()
            .values()
            .find(|run| !run.is_terminal() && run.touches(collection))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shift_engine_core::migration::{MigrationPhase, MigrationSpec};
    use shift_engine_core::transform::TransformId;

    fn run() -> MigrationRun {
        MigrationRun::new(MigrationSpec::new(
            "spec",
            vec![CollectionId::new("contacts")],
            TransformId::new("t"),
        ))
    }

    #[tokio::test]
    async fn cas_update_bumps_version_and_detects_conflicts() {
        let store = InMemoryRunStore::new();
        let run = run();
        store.create(&run).await.expect("create");

        let mut first = run.clone();
        first.phase = MigrationPhase::Expanding;
        let stored = store.update(&first, 1).await.expect("first update");
        assert_eq!(stored.version, 2);

        // a second writer holding the stale version loses
        let mut second = run.clone();
        second.phase = MigrationPhase::Expanding;
        let err = store.update(&second, 1).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn find_active_skips_terminal_runs() {
        let store = InMemoryRunStore::new();
        let mut run = run();
        store.create(&run).await.expect("create");

        let collection = CollectionId::new("contacts");
        assert!(store.find_active(&collection).await.expect("find").is_some());

        run.phase = MigrationPhase::RolledBack;
        store.update(&run, 1).await.expect("update");
        assert!(store.find_active(&collection).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = InMemoryRunStore::new();
        let run = run();
        store.create(&run).await.expect("create");
        assert!(matches!(
            store.create(&run).await,
            Err(RunStoreError::AlreadyExists { .. })
        ));
    }
}
