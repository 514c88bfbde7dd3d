//! In-memory implementation of the FlagStore port.
//!
//! A single lock around the map gives the linearizable reads and CAS
//! writes the port contract requires.

use parking_lot::RwLock;
use std::collections::HashMap;

use async_trait::async_trait;
use shift_engine_core::migration::CollectionId;
use shift_engine_core::port::flag_store::{
    FlagStore, FlagStoreError, RoutingFlag, VersionedFlag,
};

#[derive(Debug, Default)]
pub struct InMemoryFlagStore {
    flags: RwLock<HashMap<CollectionId, VersionedFlag>>,
}

impl InMemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlagStore for InMemoryFlagStore {
    type Error = std::convert::Infallible;

    async fn get(
        &self,
        collection: &CollectionId,
    ) -> Result<Option<VersionedFlag>, FlagStoreError<Self::Error>> {
        Ok(self.flags.read().get(collection).cloned())
    }

    async fn set(
        &self,
        collection: &CollectionId,
        flag: RoutingFlag,
        expected_version: Option<u64>,
    ) -> Result<u64, FlagStoreError<Self::Error>> {
        let mut flags = self.flags.write();
        let actual = flags.get(collection).map(|v| v.version);
        if actual != expected_version {
            return Err(FlagStoreError::Conflict {
                expected: expected_version,
                actual,
            });
        }
        let version = actual.unwrap_or(0) + 1;
        flags.insert(collection.clone(), VersionedFlag { flag, version });
        Ok(version)
    }
}
