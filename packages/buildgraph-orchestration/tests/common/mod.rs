//! Shared fakes for the executor integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildgraph_orchestration::{
    CacheStore, ExecutionHook, ExecutionRecord, ExecutorConfig, FingerprintProvider, HookVerdict,
    Operation, OperationGraph, OperationKey, OperationRunner, OperationSpec, OperationStatus,
    OutputSink, Parallelism, PhaseRule, RunSummary, RunnerContext, RunnerError, RunnerOutput,
    RunnerStatus, StaticTopology,
};
use buildgraph_storage::{
    ClaimRecord, ClaimStore, LogChunk, MetadataDraft, MetadataStore, OperationMetadata,
    OperationRef, StorageError, StoredOperation, VersionedClaim,
};
use parking_lot::Mutex;

pub fn key(project: &str, phase: &str) -> OperationKey {
    OperationKey::new(project, phase)
}

pub fn build(project: &str) -> OperationKey {
    key(project, "build")
}

/// `build` phase over a project graph; each project depends on the listed upstreams
pub fn build_topology(projects: &[(&str, &[&str])]) -> StaticTopology {
    let mut topology =
        StaticTopology::new().with_phase("build", PhaseRule::new().after_upstream("build"));
    for (name, upstream) in projects {
        topology = topology
            .with_project(*name, upstream.iter().copied())
            .with_operation(OperationSpec::new(*name, "build"));
    }
    topology
}

pub fn graph(projects: &[(&str, &[&str])]) -> OperationGraph {
    OperationGraph::build(&build_topology(projects)).expect("acyclic test graph")
}

pub fn config(slots: usize) -> ExecutorConfig {
    ExecutorConfig::default().with_parallelism(Parallelism::Fixed(slots))
}

pub fn cobuild_config(slots: usize, runner_id: &str) -> ExecutorConfig {
    let mut config = config(slots).with_cobuild("ctx-test", runner_id);
    config.cobuild.lease_ttl_secs = 5;
    config.cobuild.heartbeat_interval_ms = 50;
    config.cobuild.poll_interval_ms = 20;
    config
}

pub fn status(summary: &RunSummary, project: &str) -> OperationStatus {
    summary
        .status_of(&build(project))
        .unwrap_or_else(|| panic!("no operation for {}", project))
}

// ═══════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Start(OperationKey),
    End(OperationKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    Warn,
    Fail,
    Error,
    Panic,
}

/// Runner whose verdict per operation is scripted up front
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: HashMap<OperationKey, Script>,
    delay: Duration,
    reported: Option<Duration>,
    events: Mutex<Vec<RunEvent>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Duration the runner claims to have taken, instead of the wall clock
    pub fn with_reported_duration(mut self, duration: Duration) -> Self {
        self.reported = Some(duration);
        self
    }

    pub fn script(mut self, key: OperationKey, script: Script) -> Self {
        self.scripts.insert(key, script);
        self
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Operations the runner was invoked for, in start order
    pub fn calls(&self) -> Vec<OperationKey> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RunEvent::Start(key) => Some(key.clone()),
                RunEvent::End(_) => None,
            })
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationRunner for ScriptedRunner {
    async fn run(&self, ctx: &RunnerContext) -> Result<RunnerOutput, RunnerError> {
        let key = ctx.operation.clone();
        self.events.lock().push(RunEvent::Start(key.clone()));
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().push(RunEvent::End(key.clone()));

        let status = match self.scripts.get(&key).copied().unwrap_or(Script::Succeed) {
            Script::Succeed => RunnerStatus::Success,
            Script::Warn => RunnerStatus::SuccessWithWarning,
            Script::Fail => RunnerStatus::Failure,
            Script::Error => return Err(RunnerError::Spawn(format!("cannot start {}", key))),
            Script::Panic => panic!("runner exploded on {}", key),
        };

        let mut output = RunnerOutput::new(status)
            .with_chunk(LogChunk::stdout(format!("built {}\n", key)))
            .with_artifact(format!("dist/{}", key.project));
        if status == RunnerStatus::Failure {
            output = output.with_chunk(LogChunk::stderr(format!("error in {}\n", key)));
        }
        if let Some(reported) = self.reported {
            output = output.with_duration(reported);
        }
        Ok(output)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fingerprints
// ═══════════════════════════════════════════════════════════════════════════

/// `fp-<project>-<phase>-v<revision>`; revisions and failures are adjustable between runs
#[derive(Default)]
pub struct Fingerprints {
    revisions: Mutex<HashMap<OperationKey, u32>>,
    failing: Mutex<HashSet<OperationKey>>,
}

impl Fingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, key: OperationKey) {
        *self.revisions.lock().entry(key).or_insert(0) += 1;
    }

    pub fn fail(&self, key: OperationKey) {
        self.failing.lock().insert(key);
    }

    pub fn set_revision(&self, key: OperationKey, revision: u32) {
        self.revisions.lock().insert(key, revision);
    }
}

#[async_trait]
impl FingerprintProvider for Fingerprints {
    async fn compute_fingerprint(&self, operation: &Operation) -> anyhow::Result<String> {
        let key = operation.key();
        if self.failing.lock().contains(key) {
            anyhow::bail!("cannot read sources of {}", key);
        }
        let revision = self.revisions.lock().get(key).copied().unwrap_or(0);
        Ok(format!("fp-{}-{}-v{}", key.project, key.phase, revision))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Broken infrastructure
// ═══════════════════════════════════════════════════════════════════════════

pub struct BrokenCacheStore;

#[async_trait]
impl CacheStore for BrokenCacheStore {
    async fn has(&self, _key: &str) -> anyhow::Result<bool> {
        anyhow::bail!("cache endpoint unreachable")
    }

    async fn restore(&self, _key: &str, _destination: Option<&Path>) -> anyhow::Result<()> {
        anyhow::bail!("cache endpoint unreachable")
    }

    async fn save(&self, _key: &str, _artifacts: &[PathBuf]) -> anyhow::Result<()> {
        anyhow::bail!("cache endpoint unreachable")
    }
}

pub struct BrokenClaimStore;

#[async_trait]
impl ClaimStore for BrokenClaimStore {
    async fn get(&self, _key: &str) -> buildgraph_storage::Result<Option<VersionedClaim>> {
        Err(StorageError::database("claim store unreachable"))
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected_version: Option<u64>,
        _record: &ClaimRecord,
    ) -> buildgraph_storage::Result<Option<u64>> {
        Err(StorageError::database("claim store unreachable"))
    }
}

pub struct BrokenMetadataStore;

#[async_trait]
impl MetadataStore for BrokenMetadataStore {
    async fn save(
        &self,
        _operation: &OperationRef,
        _draft: MetadataDraft<'_>,
    ) -> buildgraph_storage::Result<OperationMetadata> {
        Err(StorageError::io("disk full"))
    }

    async fn load(
        &self,
        _operation: &OperationRef,
    ) -> buildgraph_storage::Result<Option<StoredOperation>> {
        Err(StorageError::io("disk full"))
    }

    async fn load_cached(
        &self,
        _operation: &OperationRef,
        _cache_key: &str,
    ) -> buildgraph_storage::Result<Option<StoredOperation>> {
        Err(StorageError::io("disk full"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Output sink and hooks
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct CollectingSink {
    chunks: Mutex<Vec<(OperationKey, LogChunk)>>,
}

impl CollectingSink {
    pub fn chunks_for(&self, key: &OperationKey) -> Vec<LogChunk> {
        self.chunks
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }
}

impl OutputSink for CollectingSink {
    fn write_chunk(&self, operation: &OperationKey, chunk: &LogChunk) {
        self.chunks.lock().push((operation.clone(), chunk.clone()));
    }
}

/// Logs every hook invocation and answers dispatch with scripted verdicts
#[derive(Default)]
pub struct RecordingHook {
    verdicts: HashMap<OperationKey, HookVerdict>,
    log: Mutex<Vec<String>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verdict(mut self, key: OperationKey, verdict: HookVerdict) -> Self {
        self.verdicts.insert(key, verdict);
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl ExecutionHook for RecordingHook {
    fn name(&self) -> &str {
        "recording"
    }

    fn before_execute_operations(&self, graph: &OperationGraph) {
        self.log.lock().push(format!("before_all:{}", graph.len()));
    }

    fn before_execute_operation(&self, operation: &Operation) -> HookVerdict {
        self.log.lock().push(format!("before:{}", operation.key()));
        self.verdicts
            .get(operation.key())
            .cloned()
            .unwrap_or(HookVerdict::Proceed)
    }

    fn after_execute_operation(&self, operation: &Operation, record: &ExecutionRecord) {
        self.log
            .lock()
            .push(format!("after:{}:{}", operation.key(), record.status()));
    }

    fn on_operation_status_changed(&self, operation: &Operation, record: &ExecutionRecord) {
        self.log
            .lock()
            .push(format!("status:{}:{}", operation.key(), record.status()));
    }

    fn after_execute_operations(&self, summary: &RunSummary) {
        self.log.lock().push(format!("after_all:{}", summary.aggregate));
    }
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
