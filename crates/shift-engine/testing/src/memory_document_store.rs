//! In-memory implementation of the DocumentStore port.
//!
//! Thread-safe, ordered, and atomic the way the port contract demands,
//! with transient-fault injection for retry-path tests. No database
//! required.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use shift_engine_core::document::{DocumentKey, DocumentRecord};
use shift_engine_core::migration::CollectionId;
use shift_engine_core::port::document_store::{DocumentStore, DocumentStoreError};

/// In-memory document store backed by ordered maps.
///
/// `commit_batch` holds the write lock for the whole batch, so updates are
/// all-or-nothing and readers never observe a half-applied batch.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<BTreeMap<CollectionId, BTreeMap<DocumentKey, DocumentRecord>>>,
    /// Remaining scan calls to fail with a transient error.
    fail_scans: AtomicU32,
    /// Remaining commit calls to fail with a transient error.
    fail_commits: AtomicU32,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a collection with records, keyed by their document keys.
    pub fn seed(&self, collection: &CollectionId, records: Vec<DocumentRecord>) {
        let mut collections = self.collections.write();
        let documents = collections.entry(collection.clone()).or_default();
        for record in records {
            documents.insert(record.key.clone(), record);
        }
    }

    /// Overwrite a single record directly, bypassing the port. Used to
    /// plant verification mismatches.
    pub fn put(&self, collection: &CollectionId, record: DocumentRecord) {
        let mut collections = self.collections.write();
        collections
            .entry(collection.clone())
            .or_default()
            .insert(record.key.clone(), record);
    }

    /// All records of a collection in key order, for assertions.
    pub fn snapshot(&self, collection: &CollectionId) -> Vec<DocumentRecord> {
        self.collections
            .read()
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next `n` scans fail with a transient error.
    pub fn fail_next_scans(&self, n: u32) {
        self.fail_scans.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail with a transient error.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    type Error = std::convert::Infallible;

    async fn scan_batch(
        &self,
        collection: &CollectionId,
        after: Option<&DocumentKey>,
        upper_bound: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, DocumentStoreError<Self::Error>> {
        if Self::take_fault(&self.fail_scans) {
            return Err(DocumentStoreError::Transient("injected scan failure".into()));
        }
        let collections = self.collections.read();
        let Some(documents) = collections.get(collection) else {
            return Err(DocumentStoreError::CollectionNotFound(collection.clone()));
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let upper = match upper_bound {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        Ok(documents
            .range((lower, upper))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn commit_batch(
        &self,
        collection: &CollectionId,
        records: &[DocumentRecord],
    ) -> Result<(), DocumentStoreError<Self::Error>> {
        if Self::take_fault(&self.fail_commits) {
            return Err(DocumentStoreError::Transient(
                "injected commit failure".into(),
            ));
        }
        let mut collections = self.collections.write();
        let Some(documents) = collections.get_mut(collection) else {
            return Err(DocumentStoreError::CollectionNotFound(collection.clone()));
        };
        for record in records {
            documents.insert(record.key.clone(), record.clone());
        }
        Ok(())
    }

    async fn get(
        &self,
        collection: &CollectionId,
        key: &DocumentKey,
    ) -> Result<Option<DocumentRecord>, DocumentStoreError<Self::Error>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|documents| documents.get(key).cloned()))
    }

    async fn count(
        &self,
        collection: &CollectionId,
    ) -> Result<u64, DocumentStoreError<Self::Error>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|documents| documents.len() as u64)
            .unwrap_or(0))
    }

    async fn count_new_shape(
        &self,
        collection: &CollectionId,
    ) -> Result<u64, DocumentStoreError<Self::Error>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|documents| {
                documents
                    .values()
                    .filter(|record| record.shape.has_new())
                    .count() as u64
            })
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection() -> CollectionId {
        CollectionId::new("contacts")
    }

    fn seeded() -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new();
        store.seed(
            &collection(),
            (1..=5)
                .map(|i| DocumentRecord::old_only(format!("doc-{i}"), json!({"n": i})))
                .collect(),
        );
        store
    }

    #[tokio::test]
    async fn scans_in_key_order_with_cursor() {
        let store = seeded();
        let first = store
            .scan_batch(&collection(), None, None, 2)
            .await
            .expect("scan");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].key.as_str(), "doc-1");

        let after = &first[1].key;
        let second = store
            .scan_batch(&collection(), Some(after), None, 10)
            .await
            .expect("scan");
        assert_eq!(second.len(), 3);
        assert_eq!(second[0].key.as_str(), "doc-3");
    }

    #[tokio::test]
    async fn scan_respects_upper_bound() {
        let store = seeded();
        let batch = store
            .scan_batch(
                &collection(),
                None,
                Some(&DocumentKey::new("doc-4")),
                10,
            )
            .await
            .expect("scan");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.last().map(|r| r.key.as_str()), Some("doc-3"));
    }

    #[tokio::test]
    async fn counts_track_new_shape() {
        let store = seeded();
        assert_eq!(store.count(&collection()).await.ok(), Some(5));
        assert_eq!(store.count_new_shape(&collection()).await.ok(), Some(0));

        store
            .commit_batch(
                &collection(),
                &[DocumentRecord::both(
                    DocumentKey::new("doc-1"),
                    json!({"n": 1}),
                    json!({"n2": 1}),
                )],
            )
            .await
            .expect("commit");
        assert_eq!(store.count_new_shape(&collection()).await.ok(), Some(1));
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_bounded() {
        let store = seeded();
        store.fail_next_scans(1);
        let err = store
            .scan_batch(&collection(), None, None, 1)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.scan_batch(&collection(), None, None, 1).await.is_ok());
    }
}
