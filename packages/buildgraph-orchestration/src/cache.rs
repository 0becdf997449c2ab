//! Cache decision service
//!
//! Decides, per operation, whether real work is needed:
//!
//! ```text
//! has no work ───────────────────────────────► NoOp
//! cache key known ── cache has it ── restore ► FromCache
//!                 └─ cobuild claim
//!                      Claimed ──────────────► Execute { claimed: true }
//!                      AlreadyClaimed ───────► CobuildWait
//!                      AlreadyCompleted ─────► FromCache | Execute
//! otherwise ─────────────────────────────────► Execute { claimed: false }
//! ```
//!
//! Caching and cobuild are optimizations: every failure along the way
//! degrades to `Execute` and is reported as a warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use buildgraph_storage::ClaimOutcome;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cobuild::{ClaimResolution, ClaimResult, CobuildCoordinator};
use crate::operation::{Operation, OperationKey};
use crate::status::OperationStatus;

/// Computes the content fingerprint of an operation's own inputs
#[async_trait]
pub trait FingerprintProvider: Send + Sync {
    async fn compute_fingerprint(&self, operation: &Operation) -> anyhow::Result<String>;
}

/// Build cache backend
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn has(&self, key: &str) -> anyhow::Result<bool>;

    /// Restore the outputs stored under `key` into `destination`
    /// (the operation's project folder, when it declares one).
    async fn restore(&self, key: &str, destination: Option<&Path>) -> anyhow::Result<()>;

    async fn save(&self, key: &str, artifacts: &[PathBuf]) -> anyhow::Result<()>;
}

/// Combine an operation's own fingerprint with the keys of its dependencies.
///
/// Fields are NUL-separated so adjacent values cannot run together.
pub fn compose_cache_key(key: &OperationKey, fingerprint: &str, upstream: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.project.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.phase.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.as_bytes());
    for dep in upstream {
        hasher.update([0u8]);
        hasher.update(dep.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Collect the cache keys an operation's key depends on, in dependency order.
///
/// `NoOp` and `Skipped` dependencies produced nothing and contribute nothing.
/// Any other dependency without a key makes the dependent uncacheable (`None`).
pub fn upstream_keys<'a, I>(dependencies: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = (OperationStatus, Option<&'a str>)>,
{
    let mut keys = Vec::new();
    for (status, key) in dependencies {
        if matches!(status, OperationStatus::NoOp | OperationStatus::Skipped) {
            continue;
        }
        keys.push(key?.to_string());
    }
    Some(keys)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    /// Hand the operation to the runner. `claimed` when this runner holds the
    /// cobuild claim and must publish the outcome.
    Execute { claimed: bool },
    /// Outputs were restored; the runner is not invoked
    FromCache,
    NoOp,
    /// Another runner is executing this operation; poll its claim
    CobuildWait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: CacheDecision,
    /// Final cache key; `None` when the operation is uncacheable this run
    pub cache_key: Option<String>,
    /// Runner that produced a result adopted through cobuild
    pub produced_by: Option<String>,
    pub warnings: Vec<String>,
}

impl Decision {
    fn new(outcome: CacheDecision, cache_key: Option<String>) -> Self {
        Self {
            outcome,
            cache_key,
            produced_by: None,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct CacheDecisionService {
    fingerprints: Option<Arc<dyn FingerprintProvider>>,
    store: Option<Arc<dyn CacheStore>>,
    cobuild: Option<Arc<CobuildCoordinator>>,
    read: bool,
    write: bool,
}

impl CacheDecisionService {
    pub fn new() -> Self {
        Self {
            fingerprints: None,
            store: None,
            cobuild: None,
            read: true,
            write: true,
        }
    }

    pub fn with_fingerprints(mut self, provider: Arc<dyn FingerprintProvider>) -> Self {
        self.fingerprints = Some(provider);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cobuild(mut self, coordinator: Arc<CobuildCoordinator>) -> Self {
        self.cobuild = Some(coordinator);
        self
    }

    pub fn with_access(mut self, read: bool, write: bool) -> Self {
        self.read = read;
        self.write = write;
        self
    }

    pub fn cobuild(&self) -> Option<&Arc<CobuildCoordinator>> {
        self.cobuild.as_ref()
    }

    /// Decide how `operation` resolves. `upstream` comes from
    /// [`upstream_keys`]; `None` forces a cache miss.
    pub async fn decide(&self, operation: &Operation, upstream: Option<&[String]>) -> Decision {
        if !operation.has_work() {
            return Decision::new(CacheDecision::NoOp, None);
        }

        let mut decision = Decision::new(CacheDecision::Execute { claimed: false }, None);
        let Some(cache_key) = self.cache_key(operation, upstream, &mut decision).await else {
            return decision;
        };
        decision.cache_key = Some(cache_key.clone());

        if self.read {
            if let Some(store) = &self.store {
                match store.has(&cache_key).await {
                    Ok(true) => {
                        if self.restore(operation, &cache_key, &mut decision).await {
                            decision.outcome = CacheDecision::FromCache;
                            return decision;
                        }
                    }
                    Ok(false) => debug!(operation = %operation.key(), "Cache miss"),
                    Err(e) => decision.warn(format!(
                        "Cache lookup failed for {}: {}",
                        operation.key(),
                        e
                    )),
                }
            }
        }

        self.claim(operation, &cache_key, decision).await
    }

    /// One poll of a `CobuildWait`. `None` while the holder is still working.
    pub async fn poll_cobuild(&self, operation: &Operation, cache_key: &str) -> Option<Decision> {
        let coordinator = self.cobuild.as_ref()?;
        let mut decision = Decision::new(
            CacheDecision::Execute { claimed: false },
            Some(cache_key.to_string()),
        );

        match coordinator.resolve(operation.key()).await {
            Ok(ClaimResolution::Pending) => None,
            Ok(ClaimResolution::Completed {
                runner_id,
                outcome,
                cache_key: published,
            }) => Some(
                self.adopt(operation, cache_key, runner_id, outcome, published, decision)
                    .await,
            ),
            Ok(ClaimResolution::Reclaimable) => {
                debug!(operation = %operation.key(), "Cobuild claim expired, reclaiming");
                let decision = self.claim(operation, cache_key, decision).await;
                match decision.outcome {
                    CacheDecision::CobuildWait => None,
                    _ => Some(decision),
                }
            }
            Err(e) => {
                decision.warn(format!(
                    "Cobuild unavailable for {}, executing locally: {}",
                    operation.key(),
                    e
                ));
                Some(decision)
            }
        }
    }

    /// Store the outputs of a successful execution. Returns a warning on failure.
    pub async fn save(&self, cache_key: &str, artifacts: &[PathBuf]) -> Option<String> {
        if !self.write {
            return None;
        }
        let store = self.store.as_ref()?;
        match store.save(cache_key, artifacts).await {
            Ok(()) => None,
            Err(e) => {
                let message = format!("Failed to write cache entry {}: {}", cache_key, e);
                warn!("{}", message);
                Some(message)
            }
        }
    }

    pub fn can_save(&self) -> bool {
        self.write && self.store.is_some()
    }

    async fn cache_key(
        &self,
        operation: &Operation,
        upstream: Option<&[String]>,
        decision: &mut Decision,
    ) -> Option<String> {
        if !operation.is_cacheable() {
            return None;
        }
        let provider = self.fingerprints.as_ref()?;
        let Some(upstream) = upstream else {
            debug!(operation = %operation.key(), "Dependency is uncacheable, forcing cache miss");
            return None;
        };

        match provider.compute_fingerprint(operation).await {
            Ok(fingerprint) => Some(compose_cache_key(operation.key(), &fingerprint, upstream)),
            Err(e) => {
                decision.warn(format!(
                    "Could not fingerprint {}, forcing cache miss: {}",
                    operation.key(),
                    e
                ));
                None
            }
        }
    }

    async fn restore(&self, operation: &Operation, cache_key: &str, decision: &mut Decision) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.restore(cache_key, operation.project_folder()).await {
            Ok(()) => true,
            Err(e) => {
                decision.warn(format!(
                    "Cache restore failed for {}: {}",
                    operation.key(),
                    e
                ));
                false
            }
        }
    }

    async fn claim(&self, operation: &Operation, cache_key: &str, mut decision: Decision) -> Decision {
        let Some(coordinator) = &self.cobuild else {
            return decision;
        };

        match coordinator.try_claim(operation.key()).await {
            Ok(ClaimResult::Claimed) => {
                decision.outcome = CacheDecision::Execute { claimed: true };
                decision
            }
            Ok(ClaimResult::AlreadyClaimed { runner_id }) => {
                debug!(operation = %operation.key(), holder = %runner_id, "Waiting on cobuild peer");
                decision.outcome = CacheDecision::CobuildWait;
                decision
            }
            Ok(ClaimResult::AlreadyCompleted {
                runner_id,
                outcome,
                cache_key: published,
            }) => {
                self.adopt(operation, cache_key, runner_id, outcome, published, decision)
                    .await
            }
            Err(e) => {
                decision.warn(format!(
                    "Cobuild unavailable for {}, executing locally: {}",
                    operation.key(),
                    e
                ));
                decision
            }
        }
    }

    /// Take over a peer's published result, or fall back to local execution
    async fn adopt(
        &self,
        operation: &Operation,
        cache_key: &str,
        runner_id: String,
        outcome: ClaimOutcome,
        published: Option<String>,
        mut decision: Decision,
    ) -> Decision {
        decision.outcome = CacheDecision::Execute { claimed: false };
        if !outcome.is_success() {
            debug!(operation = %operation.key(), peer = %runner_id, "Peer failed, executing locally");
            return decision;
        }
        if published.as_deref() != Some(cache_key) {
            debug!(operation = %operation.key(), peer = %runner_id, "Peer result not cached, executing locally");
            return decision;
        }
        if self.restore(operation, cache_key, &mut decision).await {
            decision.outcome = CacheDecision::FromCache;
            decision.produced_by = Some(runner_id);
        }
        decision
    }
}

impl Default for CacheDecisionService {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local [`CacheStore`] that remembers artifact lists per key
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, Vec<PathBuf>>>>,
    restores: Arc<Mutex<Vec<(String, Option<PathBuf>)>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn artifacts(&self, key: &str) -> Option<Vec<PathBuf>> {
        self.entries.lock().get(key).cloned()
    }

    /// Every successful restore as (key, destination), in call order
    pub fn restores(&self) -> Vec<(String, Option<PathBuf>)> {
        self.restores.lock().clone()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn has(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.lock().contains_key(key))
    }

    async fn restore(&self, key: &str, destination: Option<&Path>) -> anyhow::Result<()> {
        if !self.entries.lock().contains_key(key) {
            anyhow::bail!("no cache entry for {}", key);
        }
        self.restores
            .lock()
            .push((key.to_string(), destination.map(Path::to_path_buf)));
        Ok(())
    }

    async fn save(&self, key: &str, artifacts: &[PathBuf]) -> anyhow::Result<()> {
        self.entries.lock().insert(key.to_string(), artifacts.to_vec());
        Ok(())
    }
}
