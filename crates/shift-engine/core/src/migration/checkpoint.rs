//! Resumable backfill cursor.
//!
//! The checkpoint marks the last fully committed document along the
//! collection ordering key. It is persisted only after a batch's writes are
//! durably committed, so crash recovery never re-processes anything before
//! it; the batch spanning a crash may be re-applied, which the transform's
//! determinism makes safe.

use serde::{Deserialize, Serialize};

use super::CollectionId;
use crate::document::DocumentKey;

/// Cursor over the target collections, advancing in
/// `(collection index, document key)` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// No document has been processed yet.
    Start,
    /// Last committed document within a collection.
    Position {
        collection: CollectionId,
        last_key: DocumentKey,
    },
    /// The cursor has passed the end of every target collection.
    ///
    /// `last_key` keeps the final committed key for status reporting;
    /// it is `None` when the collections were empty.
    Complete {
        last_key: Option<DocumentKey>,
    },
}

impl Checkpoint {
    pub fn is_start(&self) -> bool {
        matches!(self, Checkpoint::Start)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Checkpoint::Complete { .. })
    }

    /// The last committed document key, if any.
    pub fn last_key(&self) -> Option<&DocumentKey> {
        match self {
            Checkpoint::Start => None,
            Checkpoint::Position { last_key, .. } => Some(last_key),
            Checkpoint::Complete { last_key } => last_key.as_ref(),
        }
    }

    /// Whether `self` is a strict advance over `from`, given the spec's
    /// ordered collection list.
    ///
    /// Positions in unknown collections never count as an advance.
    pub fn advances(&self, from: &Checkpoint, collections: &[CollectionId]) -> bool {
        let index_of = |c: &CollectionId| collections.iter().position(|x| x == c);
        match (from, self) {
            (_, Checkpoint::Start) => false,
            (Checkpoint::Complete { .. }, _) => false,
            (Checkpoint::Start, _) => true,
            (Checkpoint::Position { .. }, Checkpoint::Complete { .. }) => true,
            (
                Checkpoint::Position {
                    collection: from_coll,
                    last_key: from_key,
                },
                Checkpoint::Position {
                    collection: to_coll,
                    last_key: to_key,
                },
            ) => match (index_of(from_coll), index_of(to_coll)) {
                (Some(from_idx), Some(to_idx)) => {
                    to_idx > from_idx || (to_idx == from_idx && to_key > from_key)
                }
                _ => false,
            },
        }
    }
}
