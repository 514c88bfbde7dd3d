//! Document transforms and their registry.
//!
//! A transform maps old-schema fields to new-schema fields. It must be a
//! pure, deterministic function of its input: the backfill worker relies on
//! that to re-apply the batch spanning a crash, and the verifier relies on
//! it to re-derive expected values during sampling.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use serde_json::Value;

/// Unique identifier for a registered transform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformId(pub String);

impl TransformId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-document transform failure.
///
/// Under the spec's error-rate threshold these are recorded and the
/// document skipped; they never abort the run on their own.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformError {
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// A pure mapping from old-schema fields to new-schema fields.
///
/// Implementations must be deterministic and side-effect-free; applying a
/// transform twice to the same input must yield the same output.
pub trait DocumentTransform: Send + Sync {
    fn apply(&self, old: &Value) -> Result<Value, TransformError>;
}

/// Registry resolving [`TransformId`]s to transform implementations.
///
/// Specs reference transforms by id so run records stay serializable; the
/// backfill worker and verifier resolve the same implementation here.
pub struct TransformRegistry {
    transforms: RwLock<HashMap<TransformId, Arc<dyn DocumentTransform>>>,
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("transform_count", &self.len())
            .finish()
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self {
            transforms: RwLock::new(HashMap::new()),
        }
    }

    /// Register a transform under the given id, replacing any previous one.
    pub fn register(&self, id: TransformId, transform: Arc<dyn DocumentTransform>) {
        self.transforms
            .write()
            .expect("transform registry lock poisoned")
            .insert(id, transform);
    }

    /// Resolve a transform by id.
    pub fn resolve(&self, id: &TransformId) -> Option<Arc<dyn DocumentTransform>> {
        self.transforms
            .read()
            .expect("transform registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.transforms
            .read()
            .expect("transform registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
