//! # Dual-Read/Write Router
//!
//! Decides, per request, which schema shape to read and write. Decisions
//! are derived from the routing flag read fresh on every call; nothing is
//! cached across a flag flip, so a rollback takes effect on the very next
//! request.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::backoff::BackoffPolicy;
use crate::document::{DocumentRecord, DocumentShape};
use crate::error::{MigrationError, Result};
use crate::migration::{CollectionId, MigrationPhase, RunId};
use crate::port::flag_store::{
    FlagStore, ReadRoute, RoutingFlag, VersionedFlag, WriteRoute,
};
use crate::transform::{DocumentTransform, TransformError};

/// Default bound on a routing decision in the request path.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default retry budget for transient flag store errors.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Upper bound on each flag read, request path included.
    pub request_timeout: Duration,
    /// Bounded retries on transient flag store errors.
    pub max_retries: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// The routing flag matching a phase.
///
/// The orchestrator writes this at every transition; the rollback
/// controller writes the `RolledBack` mapping. Routing therefore follows
/// the phase without the router ever loading the run.
pub fn flag_for_phase(run_id: &RunId, phase: MigrationPhase) -> RoutingFlag {
    let (read_mode, write_mode) = match phase {
        MigrationPhase::Pending | MigrationPhase::Expanding | MigrationPhase::Backfilling => {
            (ReadRoute::Old, WriteRoute::OldOnly)
        }
        MigrationPhase::DualWriting | MigrationPhase::Verifying => {
            (ReadRoute::NewWithFallback, WriteRoute::Both)
        }
        MigrationPhase::Contracting | MigrationPhase::Completed => {
            (ReadRoute::New, WriteRoute::NewOnly)
        }
        MigrationPhase::RolledBack => (ReadRoute::Old, WriteRoute::OldOnly),
    };
    RoutingFlag::new(run_id.clone(), read_mode, write_mode)
}

/// CAS loop writing a routing flag: read the current version, swap, and on
/// conflict re-read, up to `cas_retry_limit` times. Transient errors are
/// retried under `policy`. The flag flip itself is atomic; no reader ever
/// observes a half-applied change.
pub async fn set_routing_flag<F: FlagStore>(
    flag_store: &F,
    collection: &CollectionId,
    flag: RoutingFlag,
    policy: &BackoffPolicy,
    cas_retry_limit: u32,
) -> Result<u64> {
    let mut cas_attempts: u32 = 0;
    loop {
        let current = policy
            .retry("flag_store.get", || async move {
                flag_store
                    .get(collection)
                    .await
                    .map_err(MigrationError::from_flag_store)
            })
            .await?;
        let expected = current.map(|v| v.version);

        let attempt = policy
            .retry("flag_store.set", || {
                let flag = flag.clone();
                async move {
                    flag_store
                        .set(collection, flag, expected)
                        .await
                        .map_err(MigrationError::from_flag_store)
                }
            })
            .await;

        match attempt {
            Ok(version) => return Ok(version),
            Err(MigrationError::PhaseTransitionConflict { .. }) if cas_attempts < cas_retry_limit => {
                cas_attempts += 1;
                tracing::debug!(%collection, cas_attempts, "flag version conflict, re-reading");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Outcome of resolving a read against a document record.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedRead {
    /// The routed shape was present.
    Current(Value),
    /// `NewWithFallback` fell back to the old shape; the document has not
    /// been backfilled yet.
    StaleFallback(Value),
}

/// Apply a read route to a record's shape.
///
/// Returns `None` when the routed shape is absent and no fallback applies.
pub fn resolve_read(route: ReadRoute, record: &DocumentRecord) -> Option<ResolvedRead> {
    match route {
        ReadRoute::Old => record.shape.old_fields().cloned().map(ResolvedRead::Current),
        ReadRoute::New => record.shape.new_fields().cloned().map(ResolvedRead::Current),
        ReadRoute::NewWithFallback => {
            if let Some(new) = record.shape.new_fields() {
                Some(ResolvedRead::Current(new.clone()))
            } else if let Some(old) = record.shape.old_fields() {
                tracing::warn!(key = %record.key, "read fell back to old schema shape");
                Some(ResolvedRead::StaleFallback(old.clone()))
            } else {
                None
            }
        }
    }
}

/// Build the shape for a dual write: one atomic document update carrying
/// both the incoming old-schema fields and the derived new-schema fields.
/// Never two separate writes that could partially fail.
pub fn dual_write_shape(
    old: Value,
    transform: &dyn DocumentTransform,
) -> std::result::Result<DocumentShape, TransformError> {
    let new = transform.apply(&old)?;
    Ok(DocumentShape::Both { old, new })
}

/// Per-request schema router.
pub struct SchemaRouter<F>
where
    F: FlagStore + 'static,
{
    config: RouterConfig,
    flag_store: Arc<F>,
}

impl<F> SchemaRouter<F>
where
    F: FlagStore + 'static,
{
    pub fn new(config: RouterConfig, flag_store: Arc<F>) -> Self {
        Self { config, flag_store }
    }

    /// Which shape reads should target right now.
    ///
    /// Collections with no flag are not under migration and read OLD.
    pub async fn route_read(&self, collection: &CollectionId) -> Result<ReadRoute> {
        Ok(self
            .fetch_flag(collection)
            .await?
            .map(|v| v.flag.read_mode)
            .unwrap_or(ReadRoute::Old))
    }

    /// Which shape(s) writes must target right now.
    pub async fn route_write(&self, collection: &CollectionId) -> Result<WriteRoute> {
        Ok(self
            .fetch_flag(collection)
            .await?
            .map(|v| v.flag.write_mode)
            .unwrap_or(WriteRoute::OldOnly))
    }

    /// Fresh flag read under the request-path timeout and retry bounds.
    async fn fetch_flag(&self, collection: &CollectionId) -> Result<Option<VersionedFlag>> {
        let policy = BackoffPolicy::aggressive().with_max_retries(self.config.max_retries);
        let timeout = self.config.request_timeout;
        policy
            .retry("flag_store.get", || {
                let store = self.flag_store.clone();
                let collection = collection.clone();
                async move {
                    match tokio::time::timeout(timeout, store.get(&collection)).await {
                        Ok(result) => result.map_err(MigrationError::from_flag_store),
                        Err(_) => Err(MigrationError::Timeout(timeout)),
                    }
                }
            })
            .await
    }
}
