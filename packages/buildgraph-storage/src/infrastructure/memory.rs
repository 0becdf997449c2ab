//! Process-local claim store
//!
//! Cloning shares the underlying map, so several runners inside one process
//! (tests, single-machine cobuild) see the same claims.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{ClaimRecord, ClaimStore, VersionedClaim};
use crate::Result;

#[derive(Clone, Default)]
pub struct InMemoryClaimStore {
    claims: Arc<Mutex<HashMap<String, VersionedClaim>>>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.claims.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.lock().is_empty()
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedClaim>> {
        Ok(self.claims.lock().get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        record: &ClaimRecord,
    ) -> Result<Option<u64>> {
        let mut claims = self.claims.lock();
        let current = claims.get(key).map(|c| c.version);
        if current != expected_version {
            return Ok(None);
        }

        let version = expected_version.map_or(1, |v| v + 1);
        claims.insert(
            key.to_string(),
            VersionedClaim {
                version,
                record: record.clone(),
            },
        );
        Ok(Some(version))
    }
}
