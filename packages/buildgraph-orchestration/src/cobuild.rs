//! Cobuild coordination
//!
//! Cooperating runners that share a `context_id` use one claim record per
//! operation to decide who executes it. Claims are leases: the holder keeps
//! refreshing the expiry while executing, and an expired claim (crashed
//! holder) becomes reclaimable by anyone. Completion is published with a
//! longer TTL so late waiters still see it.
//!
//! Every write is a versioned compare-and-set against the shared
//! [`ClaimStore`]; no in-process lock is involved.

use std::sync::Arc;
use std::time::Duration;

use buildgraph_storage::{
    ClaimOutcome, ClaimRecord, ClaimState, ClaimStore, CobuildMetadata, VersionedClaim,
};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::operation::OperationKey;

/// Lost compare-and-set races tolerated before giving up on a single call
const MAX_CAS_ATTEMPTS: usize = 8;

/// Whether cobuild applies to the current run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CobuildMode {
    Disabled,
    Enabled {
        context_id: String,
        runner_id: String,
    },
}

impl CobuildMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, CobuildMode::Enabled { .. })
    }

    pub fn metadata(&self) -> Option<CobuildMetadata> {
        match self {
            CobuildMode::Enabled {
                context_id,
                runner_id,
            } => Some(CobuildMetadata {
                context_id: context_id.clone(),
                runner_id: runner_id.clone(),
            }),
            CobuildMode::Disabled => None,
        }
    }
}

/// Result of [`CobuildCoordinator::try_claim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// This runner now holds the claim and must execute the operation
    Claimed,
    /// Another runner holds a live claim
    AlreadyClaimed { runner_id: String },
    /// Another runner already finished the operation in this context
    AlreadyCompleted {
        runner_id: String,
        outcome: ClaimOutcome,
        cache_key: Option<String>,
    },
}

/// One poll of a claim this runner is waiting on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResolution {
    Pending,
    Completed {
        runner_id: String,
        outcome: ClaimOutcome,
        cache_key: Option<String>,
    },
    /// The holder vanished (claim expired or released); anyone may claim again
    Reclaimable,
}

pub struct CobuildCoordinator {
    store: Arc<dyn ClaimStore>,
    context_id: String,
    runner_id: String,
    lease_ttl: chrono::Duration,
    completed_ttl: chrono::Duration,
    /// claim key -> version of the record this runner last wrote
    held: DashMap<String, u64>,
}

impl CobuildCoordinator {
    pub fn new(
        store: Arc<dyn ClaimStore>,
        context_id: impl Into<String>,
        runner_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            context_id: context_id.into(),
            runner_id: runner_id.into(),
            lease_ttl: chrono::Duration::seconds(30),
            completed_ttl: chrono::Duration::hours(1),
            held: DashMap::new(),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = to_chrono(ttl);
        self
    }

    pub fn with_completed_ttl(mut self, ttl: Duration) -> Self {
        self.completed_ttl = to_chrono(ttl);
        self
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn metadata(&self) -> CobuildMetadata {
        CobuildMetadata {
            context_id: self.context_id.clone(),
            runner_id: self.runner_id.clone(),
        }
    }

    /// Shared-store key for one operation within this context
    pub fn claim_key(&self, operation: &OperationKey) -> String {
        format!(
            "cobuild:{}:{};{}",
            self.context_id, operation.project, operation.phase
        )
    }

    pub fn holds(&self, operation: &OperationKey) -> bool {
        self.held.contains_key(&self.claim_key(operation))
    }

    pub async fn try_claim(&self, operation: &OperationKey) -> Result<ClaimResult> {
        let key = self.claim_key(operation);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let current = self.get(&key).await?;

            if let Some(existing) = current.as_ref().filter(|c| c.record.is_live(now)) {
                let record = &existing.record;
                match record.state {
                    ClaimState::Claimed if record.runner_id == self.runner_id => {
                        self.held.insert(key, existing.version);
                        return Ok(ClaimResult::Claimed);
                    }
                    ClaimState::Claimed => {
                        return Ok(ClaimResult::AlreadyClaimed {
                            runner_id: record.runner_id.clone(),
                        })
                    }
                    ClaimState::Completed => {
                        return Ok(ClaimResult::AlreadyCompleted {
                            runner_id: record.runner_id.clone(),
                            outcome: record.outcome.unwrap_or(ClaimOutcome::Failure),
                            cache_key: record.cache_key.clone(),
                        })
                    }
                    ClaimState::Unclaimed => {}
                }
            }

            let record = ClaimRecord::claimed(self.runner_id.clone(), now + self.lease_ttl);
            let expected = current.map(|c| c.version);
            if let Some(version) = self.cas(&key, expected, &record).await? {
                debug!(claim = %key, runner = %self.runner_id, "Claimed operation");
                self.held.insert(key, version);
                return Ok(ClaimResult::Claimed);
            }
            // Lost the race: re-read and classify whoever won
        }

        Err(OrchestratorError::cobuild(format!(
            "Gave up claiming {} after {} contended attempts",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    /// Heartbeat: push the expiry of a held claim forward.
    ///
    /// Returns `false` when the claim is no longer ours (it expired and was
    /// taken over); the caller keeps executing, the work is merely duplicated.
    pub async fn refresh(&self, operation: &OperationKey) -> Result<bool> {
        let key = self.claim_key(operation);
        let Some(version) = self.held.get(&key).map(|v| *v) else {
            return Ok(false);
        };

        let record = ClaimRecord::claimed(self.runner_id.clone(), Utc::now() + self.lease_ttl);
        match self.cas(&key, Some(version), &record).await? {
            Some(next) => {
                self.held.insert(key, next);
                Ok(true)
            }
            None => {
                warn!(claim = %key, "Cobuild claim was lost while executing");
                self.held.remove(&key);
                Ok(false)
            }
        }
    }

    /// Publish the outcome of a held claim. Returns `false` if another runner
    /// took the claim over in the meantime, in which case nothing is written.
    pub async fn complete(
        &self,
        operation: &OperationKey,
        outcome: ClaimOutcome,
        cache_key: Option<String>,
    ) -> Result<bool> {
        let key = self.claim_key(operation);
        let Some((_, version)) = self.held.remove(&key) else {
            return Ok(false);
        };

        let record = ClaimRecord::completed(
            self.runner_id.clone(),
            outcome,
            cache_key,
            Utc::now() + self.completed_ttl,
        );
        let written = self.cas(&key, Some(version), &record).await?.is_some();
        if written {
            debug!(claim = %key, outcome = outcome.as_str(), "Published cobuild completion");
        } else {
            warn!(claim = %key, "Cobuild claim was taken over before completion");
        }
        Ok(written)
    }

    /// Give up a held claim without completing, so waiters may reclaim at once.
    pub async fn release(&self, operation: &OperationKey) -> Result<()> {
        let key = self.claim_key(operation);
        if let Some((_, version)) = self.held.remove(&key) {
            let record = ClaimRecord::unclaimed(self.runner_id.clone(), Utc::now());
            self.cas(&key, Some(version), &record).await?;
        }
        Ok(())
    }

    pub async fn resolve(&self, operation: &OperationKey) -> Result<ClaimResolution> {
        let key = self.claim_key(operation);
        let now = Utc::now();
        let resolution = match self.get(&key).await? {
            Some(claim) if claim.record.is_live(now) => match claim.record.state {
                ClaimState::Completed => ClaimResolution::Completed {
                    runner_id: claim.record.runner_id,
                    outcome: claim.record.outcome.unwrap_or(ClaimOutcome::Failure),
                    cache_key: claim.record.cache_key,
                },
                _ => ClaimResolution::Pending,
            },
            _ => ClaimResolution::Reclaimable,
        };
        Ok(resolution)
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedClaim>> {
        self.store.get(key).await.map_err(OrchestratorError::cobuild)
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<u64>,
        record: &ClaimRecord,
    ) -> Result<Option<u64>> {
        self.store
            .compare_and_set(key, expected, record)
            .await
            .map_err(OrchestratorError::cobuild)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildgraph_storage::InMemoryClaimStore;

    fn key() -> OperationKey {
        OperationKey::new("web", "build")
    }

    fn pair(store: &InMemoryClaimStore) -> (CobuildCoordinator, CobuildCoordinator) {
        let a = CobuildCoordinator::new(Arc::new(store.clone()), "ctx", "runner-a");
        let b = CobuildCoordinator::new(Arc::new(store.clone()), "ctx", "runner-b");
        (a, b)
    }

    #[test]
    fn test_claim_key_format() {
        let c = CobuildCoordinator::new(Arc::new(InMemoryClaimStore::new()), "ctx-1", "r");
        assert_eq!(c.claim_key(&key()), "cobuild:ctx-1:web;build");
    }

    #[test]
    fn test_mode_metadata() {
        assert!(CobuildMode::Disabled.metadata().is_none());
        let mode = CobuildMode::Enabled {
            context_id: "ctx".into(),
            runner_id: "r1".into(),
        };
        assert!(mode.is_enabled());
        assert_eq!(mode.metadata().unwrap().runner_id, "r1");
    }

    #[tokio::test]
    async fn test_second_runner_sees_claim() {
        let store = InMemoryClaimStore::new();
        let (a, b) = pair(&store);

        assert_eq!(a.try_claim(&key()).await.unwrap(), ClaimResult::Claimed);
        assert!(a.holds(&key()));
        assert_eq!(
            b.try_claim(&key()).await.unwrap(),
            ClaimResult::AlreadyClaimed {
                runner_id: "runner-a".into()
            }
        );
        assert_eq!(b.resolve(&key()).await.unwrap(), ClaimResolution::Pending);
    }

    #[tokio::test]
    async fn test_completion_is_visible() {
        let store = InMemoryClaimStore::new();
        let (a, b) = pair(&store);

        a.try_claim(&key()).await.unwrap();
        assert!(a
            .complete(&key(), ClaimOutcome::Success, Some("abc".into()))
            .await
            .unwrap());
        assert!(!a.holds(&key()));

        let expected = ClaimResolution::Completed {
            runner_id: "runner-a".into(),
            outcome: ClaimOutcome::Success,
            cache_key: Some("abc".into()),
        };
        assert_eq!(b.resolve(&key()).await.unwrap(), expected);
        assert!(matches!(
            b.try_claim(&key()).await.unwrap(),
            ClaimResult::AlreadyCompleted {
                outcome: ClaimOutcome::Success,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_expired_claim_is_reclaimable() {
        let store = InMemoryClaimStore::new();
        let a = CobuildCoordinator::new(Arc::new(store.clone()), "ctx", "runner-a")
            .with_lease_ttl(Duration::from_millis(20));
        let b = CobuildCoordinator::new(Arc::new(store.clone()), "ctx", "runner-b");

        a.try_claim(&key()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(b.resolve(&key()).await.unwrap(), ClaimResolution::Reclaimable);
        assert_eq!(b.try_claim(&key()).await.unwrap(), ClaimResult::Claimed);

        // The crashed holder finds out on its next heartbeat
        assert!(!a.refresh(&key()).await.unwrap());
        assert!(!a.complete(&key(), ClaimOutcome::Success, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_extends_lease() {
        let store = InMemoryClaimStore::new();
        let a = CobuildCoordinator::new(Arc::new(store.clone()), "ctx", "runner-a")
            .with_lease_ttl(Duration::from_millis(60));

        a.try_claim(&key()).await.unwrap();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(a.refresh(&key()).await.unwrap());
        }
        let (_, b) = pair(&store);
        assert!(matches!(
            b.try_claim(&key()).await.unwrap(),
            ClaimResult::AlreadyClaimed { .. }
        ));
    }

    #[tokio::test]
    async fn test_release_lets_others_claim() {
        let store = InMemoryClaimStore::new();
        let (a, b) = pair(&store);

        a.try_claim(&key()).await.unwrap();
        a.release(&key()).await.unwrap();

        assert_eq!(b.resolve(&key()).await.unwrap(), ClaimResolution::Reclaimable);
        assert_eq!(b.try_claim(&key()).await.unwrap(), ClaimResult::Claimed);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = InMemoryClaimStore::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let c = CobuildCoordinator::new(Arc::new(store.clone()), "ctx", format!("runner-{}", i));
            handles.push(tokio::spawn(async move { c.try_claim(&key()).await.unwrap() }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimResult::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }
}
