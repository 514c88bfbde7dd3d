//! FlagStore port trait definition.
//!
//! The routing flag is the one piece of state shared by every concurrent
//! reader and writer during a migration. The store must provide
//! linearizable reads and CAS writes; only the orchestrator and the
//! rollback controller mutate it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::migration::{CollectionId, RunId};

/// Which schema shape a read should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadRoute {
    /// Read old-schema fields.
    Old,
    /// Read new-schema fields.
    New,
    /// Prefer new-schema fields, fall back to old with a staleness signal.
    NewWithFallback,
}

/// Which schema shape(s) a write must target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteRoute {
    /// Write old-schema fields only; the backfill worker fills in the rest.
    OldOnly,
    /// Update both shapes within a single atomic document update.
    Both,
    /// Write new-schema fields only.
    NewOnly,
}

/// Per-collection routing state for the run migrating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingFlag {
    pub run_id: RunId,
    pub read_mode: ReadRoute,
    pub write_mode: WriteRoute,
}

impl RoutingFlag {
    pub fn new(run_id: RunId, read_mode: ReadRoute, write_mode: WriteRoute) -> Self {
        Self {
            run_id,
            read_mode,
            write_mode,
        }
    }

    /// The pre-migration / post-rollback state: everything targets OLD.
    pub fn old_schema(run_id: RunId) -> Self {
        Self::new(run_id, ReadRoute::Old, WriteRoute::OldOnly)
    }
}

/// A flag together with its CAS version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedFlag {
    pub flag: RoutingFlag,
    pub version: u64,
}

/// Errors from flag store operations.
#[derive(Debug, thiserror::Error)]
pub enum FlagStoreError<E> {
    /// CAS detected a version mismatch.
    #[error("conflict: expected version {expected:?}, but current is {actual:?}")]
    Conflict {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Transient infrastructure failure; safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Backend-specific error.
    #[error("backend error: {0:?}")]
    Backend(E),
}

impl<E> FlagStoreError<E> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Trait for the routing flag persistence.
///
/// `get` must be linearizable: a read issued after a successful `set`
/// observes that flag or a later one, never an older one. No reader may
/// observe a half-applied flag.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// The error type for this implementation.
    type Error: Debug + Send + Sync + 'static;

    /// Current flag for a collection, if any.
    async fn get(
        &self,
        collection: &CollectionId,
    ) -> Result<Option<VersionedFlag>, FlagStoreError<Self::Error>>;

    /// CAS-write the flag. `expected_version == None` means the flag must
    /// not exist yet (create). Returns the new version.
    async fn set(
        &self,
        collection: &CollectionId,
        flag: RoutingFlag,
        expected_version: Option<u64>,
    ) -> Result<u64, FlagStoreError<Self::Error>>;
}
