//! Document records as the migration engine sees them.
//!
//! A document under migration can carry the old schema shape, the new one,
//! or both at once. The shape is an explicit tagged variant rather than
//! runtime attribute probing; carrying a new shape is the marker that the
//! document has been backfilled.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Ordering key of a document within its collection.
///
/// Keys compare lexicographically. The backfill cursor advances strictly
/// along this order, so the key must be stable for the lifetime of a run
/// (creation time or document id in practice).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey(pub String);

impl DocumentKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema shape(s) a document currently holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentShape {
    /// Only old-schema fields are present.
    Old(Value),
    /// Only new-schema fields are present (after contraction cleanup).
    New(Value),
    /// Transitional: both shapes held concurrently in the same document.
    Both {
        old: Value,
        new: Value,
    },
}

impl DocumentShape {
    /// Whether the new-schema fields have been populated.
    pub fn has_new(&self) -> bool {
        matches!(self, DocumentShape::New(_) | DocumentShape::Both { .. })
    }

    /// Whether the old-schema fields are still present.
    pub fn has_old(&self) -> bool {
        matches!(self, DocumentShape::Old(_) | DocumentShape::Both { .. })
    }

    /// The old-schema fields, if present.
    pub fn old_fields(&self) -> Option<&Value> {
        match self {
            DocumentShape::Old(old) | DocumentShape::Both { old, .. } => Some(old),
            DocumentShape::New(_) => None,
        }
    }

    /// The new-schema fields, if present.
    pub fn new_fields(&self) -> Option<&Value> {
        match self {
            DocumentShape::New(new) | DocumentShape::Both { new, .. } => Some(new),
            DocumentShape::Old(_) => None,
        }
    }
}

/// A document record, externally owned by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub key: DocumentKey,
    pub shape: DocumentShape,
}

impl DocumentRecord {
    pub fn new(key: DocumentKey, shape: DocumentShape) -> Self {
        Self { key, shape }
    }

    /// A record that only carries old-schema fields.
    pub fn old_only(key: impl Into<String>, old: Value) -> Self {
        Self {
            key: DocumentKey::new(key),
            shape: DocumentShape::Old(old),
        }
    }

    /// A record carrying both shapes, as written by the backfill worker.
    pub fn both(key: DocumentKey, old: Value, new: Value) -> Self {
        Self {
            key,
            shape: DocumentShape::Both { old, new },
        }
    }
}
