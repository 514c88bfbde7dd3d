//! Static migration definitions.

use serde::{Deserialize, Serialize};

use super::{CollectionId, SpecId};
use crate::backoff::BackoffPolicy;
use crate::error::MigrationError;
use crate::transform::TransformId;

/// Default documents per backfill batch.
const DEFAULT_BATCH_SIZE: usize = 100;

/// Default retry budget for transient store errors.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default tolerated per-batch transform error rate.
const DEFAULT_ERROR_RATE_THRESHOLD: f64 = 0.05;

/// Static description of a migration.
///
/// Immutable once a run starts; the run embeds a copy so concurrent spec
/// edits cannot affect an in-flight migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSpec {
    /// Spec identifier.
    pub id: SpecId,
    /// Target collections, processed in this order.
    pub collections: Vec<CollectionId>,
    /// Registered transform applied to every document.
    pub transform: TransformId,
    /// Documents per backfill batch.
    pub batch_size: usize,
    /// Retry budget for transient store errors.
    pub max_retries: u32,
    /// Backoff curve for those retries.
    pub backoff: BackoffPolicy,
    /// Per-batch transform error rate above which the batch aborts.
    pub error_rate_threshold: f64,
}

impl MigrationSpec {
    pub fn new(
        id: impl Into<String>,
        collections: Vec<CollectionId>,
        transform: TransformId,
    ) -> Self {
        Self {
            id: SpecId::new(id),
            collections,
            transform,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::standard(),
            error_rate_threshold: DEFAULT_ERROR_RATE_THRESHOLD,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    /// The retry policy components use for this spec's store operations:
    /// the spec's backoff curve bounded by the spec's retry budget.
    pub fn retry_policy(&self) -> BackoffPolicy {
        self.backoff.clone().with_max_retries(self.max_retries)
    }

    /// Validate the spec before a run is created from it.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.id.as_str().is_empty() {
            return Err(MigrationError::InvalidSpec("spec id is empty".into()));
        }
        if self.collections.is_empty() {
            return Err(MigrationError::InvalidSpec(
                "spec has no target collections".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for collection in &self.collections {
            if !seen.insert(collection) {
                return Err(MigrationError::InvalidSpec(format!(
                    "duplicate target collection: {collection}"
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(MigrationError::InvalidSpec("batch_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(MigrationError::InvalidSpec(format!(
                "error_rate_threshold must be within [0, 1], got {}",
                self.error_rate_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MigrationSpec {
        MigrationSpec::new(
            "contracts-v2",
            vec![CollectionId::new("contracts")],
            TransformId::new("split-party-names"),
        )
    }

    #[test]
    fn defaults_are_valid() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn rejects_empty_collections() {
        let spec = MigrationSpec::new("s", vec![], TransformId::new("t"));
        assert!(matches!(
            spec.validate(),
            Err(MigrationError::InvalidSpec(_))
        ));
    }

    #[test]
    fn rejects_duplicate_collections() {
        let spec = MigrationSpec::new(
            "s",
            vec![CollectionId::new("a"), CollectionId::new("a")],
            TransformId::new("t"),
        );
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        assert!(spec().with_batch_size(0).validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        assert!(spec().with_error_rate_threshold(1.5).validate().is_err());
        assert!(spec().with_error_rate_threshold(-0.1).validate().is_err());
        assert!(spec().with_error_rate_threshold(0.0).validate().is_ok());
    }

    #[test]
    fn retry_policy_uses_spec_budget() {
        let spec = spec().with_max_retries(7);
        assert_eq!(spec.retry_policy().max_retries, 7);
    }
}
