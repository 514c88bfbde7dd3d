//! DocumentStore port trait definition.
//!
//! The document store is an external collaborator (a Firestore-like store
//! in production). The engine only needs ordered cursor scans, atomic batch
//! updates, and count queries; everything else stays on the other side of
//! this trait.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::document::{DocumentKey, DocumentRecord};
use crate::migration::CollectionId;

/// Errors from document store operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError<E> {
    /// The collection does not exist.
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionId),

    /// Transient infrastructure failure; safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Backend-specific error.
    #[error("backend error: {0:?}")]
    Backend(E),
}

impl<E> DocumentStoreError<E> {
    /// Whether retrying the operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Trait for the ordered document collections under migration.
///
/// # Ordering
///
/// `scan_batch` must return documents in strictly ascending key order, and
/// repeated scans with the same cursor must observe a stable order for
/// documents that existed at cursor time. The backfill checkpoint depends
/// on this.
///
/// # Atomicity
///
/// `commit_batch` must apply all record updates or none, on every exit
/// path. A record carrying [`DocumentShape::Both`] must become visible with
/// both shapes at once; readers never observe one without the other.
///
/// [`DocumentShape::Both`]: crate::document::DocumentShape::Both
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// The error type for this implementation.
    type Error: Debug + Send + Sync + 'static;

    /// Scan up to `limit` documents with keys strictly greater than
    /// `after` (or from the beginning when `None`), stopping before
    /// `upper_bound` when one is given.
    async fn scan_batch(
        &self,
        collection: &CollectionId,
        after: Option<&DocumentKey>,
        upper_bound: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, DocumentStoreError<Self::Error>>;

    /// Atomically apply all record updates in one commit.
    async fn commit_batch(
        &self,
        collection: &CollectionId,
        records: &[DocumentRecord],
    ) -> Result<(), DocumentStoreError<Self::Error>>;

    /// Fetch a single document.
    async fn get(
        &self,
        collection: &CollectionId,
        key: &DocumentKey,
    ) -> Result<Option<DocumentRecord>, DocumentStoreError<Self::Error>>;

    /// Total number of documents in the collection.
    async fn count(
        &self,
        collection: &CollectionId,
    ) -> Result<u64, DocumentStoreError<Self::Error>>;

    /// Number of documents whose new-schema fields are populated.
    async fn count_new_shape(
        &self,
        collection: &CollectionId,
    ) -> Result<u64, DocumentStoreError<Self::Error>>;
}
