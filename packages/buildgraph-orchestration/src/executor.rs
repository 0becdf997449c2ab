//! Operation executor
//!
//! A single coordinating loop owns every [`ExecutionRecord`] and the ready
//! set; worker tasks only decide (cache/cobuild) and run one operation, then
//! report back over a channel. Readiness is never stored: an operation is
//! pushed onto the ready heap the moment its last unresolved dependency
//! settles in a non-blocking state.
//!
//! ```text
//!            ┌──────── ready heap (transitive dependents, declaration order)
//!            ▼
//! Ready ─► Queued ─► worker: decide ─► NoOp | FromCache
//!                               └─► Executing ─► Success | SuccessWithWarning | Failure
//! ```
//!
//! A worker slot is held from `Queued` until the worker's report arrives.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use buildgraph_storage::{ClaimOutcome, ClaimStore, CobuildMetadata, LogChunk, MetadataStore};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{
    upstream_keys, CacheDecision, CacheDecisionService, CacheStore, Decision, FingerprintProvider,
};
use crate::cobuild::{CobuildCoordinator, CobuildMode};
use crate::config::{ExecutorConfig, FailurePolicy};
use crate::error::Result;
use crate::graph::OperationGraph;
use crate::hooks::{ExecutionHook, HookRegistry, HookVerdict};
use crate::metadata::{MetadataRecorder, OutputSink};
use crate::operation::{Operation, OperationId};
use crate::record::{warning_chunk, ExecutionRecord};
use crate::runner::{OperationRunner, RunnerContext, RunnerError, RunnerOutput};
use crate::status::OperationStatus;
use crate::summary::RunSummary;
use crate::topology::TopologyProvider;

pub struct OperationExecutor {
    config: ExecutorConfig,
    runner: Arc<dyn OperationRunner>,
    fingerprints: Option<Arc<dyn FingerprintProvider>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    cobuild_mode: CobuildMode,
    coordinator: Option<Arc<CobuildCoordinator>>,
    recorder: MetadataRecorder,
    hooks: HookRegistry,
    cancel: CancellationToken,
    executor_id: String,
}

impl OperationExecutor {
    pub fn new(config: ExecutorConfig, runner: Arc<dyn OperationRunner>) -> Result<Self> {
        config.validate()?;
        let cobuild_mode = config.cobuild_mode();

        Ok(Self {
            config,
            runner,
            fingerprints: None,
            cache_store: None,
            cobuild_mode,
            coordinator: None,
            recorder: MetadataRecorder::new(),
            hooks: HookRegistry::new(),
            cancel: CancellationToken::new(),
            executor_id: format!("executor-{}", Uuid::new_v4()),
        })
    }

    pub fn with_fingerprints(mut self, provider: Arc<dyn FingerprintProvider>) -> Self {
        self.fingerprints = Some(provider);
        self
    }

    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Attach the shared claim store. Ignored unless cobuild is enabled.
    pub fn with_claim_store(mut self, store: Arc<dyn ClaimStore>) -> Self {
        match &self.cobuild_mode {
            CobuildMode::Enabled {
                context_id,
                runner_id,
            } => {
                let coordinator = CobuildCoordinator::new(store, context_id.clone(), runner_id.clone())
                    .with_lease_ttl(self.config.cobuild.lease_ttl())
                    .with_completed_ttl(self.config.cobuild.completed_ttl());
                self.coordinator = Some(Arc::new(coordinator));
            }
            CobuildMode::Disabled => debug!("Cobuild disabled, claim store not used"),
        }
        self
    }

    pub fn with_metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.recorder = self.recorder.with_store(store);
        self
    }

    pub fn with_output_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.recorder = self.recorder.with_sink(sink);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ExecutionHook>) -> Self {
        self.hooks.register(hook);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn cobuild_mode(&self) -> &CobuildMode {
        &self.cobuild_mode
    }

    /// Run-level abort signal. Cancelling it stops new dispatch; operations
    /// already executing finish with their real result. Once cancelled, every
    /// later run of this executor is cancelled as well.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build the graph and run it. Graph errors are the only fatal ones.
    pub async fn execute_topology<T: TopologyProvider + ?Sized>(
        &self,
        topology: &T,
    ) -> Result<RunSummary> {
        let graph = OperationGraph::build(topology)?;
        self.execute(&graph).await
    }

    pub async fn execute(&self, graph: &OperationGraph) -> Result<RunSummary> {
        let started = Instant::now();
        let slots = self.config.parallelism.resolve();

        info!(
            "Executor {}: starting run of {} operations with {} slots",
            self.executor_id,
            graph.len(),
            slots
        );
        debug!("Execution plan:\n{}", graph.execution_plan());

        if self.cobuild_mode.is_enabled() && self.coordinator.is_none() {
            warn!("Cobuild is enabled but no claim store is configured; executing locally");
        }

        let abort = self.cancel.child_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            runner: self.runner.clone(),
            decisions: Arc::new(self.decision_service()),
            recorder: Arc::new(self.recorder.clone()),
            cobuild: self.coordinator.as_ref().map(|c| c.metadata()),
            heartbeat_interval: self.config.cobuild.heartbeat_interval(),
            poll_interval: self.config.cobuild.poll_interval(),
            allow_warnings_in_success: self.config.allow_warnings_in_success,
            abort: abort.clone(),
            cancel: self.cancel.clone(),
            events: events_tx,
        };

        self.hooks.before_execute_operations(graph);

        let mut scheduler = Scheduler::new(graph, &self.hooks, self.config.failure_policy, abort);
        scheduler.skip_excluded()?;
        scheduler.run(slots, &worker, events_rx).await?;
        let aborted = scheduler.abort.is_cancelled();
        scheduler.cancel_remaining()?;

        let summary = RunSummary::from_records(
            &scheduler.records,
            scheduler.warnings,
            started.elapsed(),
            aborted,
        );
        self.hooks.after_execute_operations(&summary);

        info!(
            "Executor {}: run finished with {} in {}ms ({} warnings)",
            self.executor_id,
            summary.aggregate,
            summary.duration.as_millis(),
            summary.warnings.len()
        );
        Ok(summary)
    }

    fn decision_service(&self) -> CacheDecisionService {
        let mut service = CacheDecisionService::new()
            .with_access(self.config.cache.read, self.config.cache.write);
        if let Some(fingerprints) = &self.fingerprints {
            service = service.with_fingerprints(fingerprints.clone());
        }
        if self.config.cache.enabled {
            if let Some(store) = &self.cache_store {
                service = service.with_store(store.clone());
            }
        }
        if let Some(coordinator) = &self.coordinator {
            service = service.with_cobuild(coordinator.clone());
        }
        service
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Coordinating loop
// ═══════════════════════════════════════════════════════════════════════════

/// Ready-heap entry: more transitive dependents first, then declaration order
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    transitive_dependents: usize,
    id: OperationId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.transitive_dependents
            .cmp(&other.transitive_dependents)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum WorkerEvent {
    Started(OperationId),
    Finished(WorkerReport),
}

struct Scheduler<'a> {
    graph: &'a OperationGraph,
    hooks: &'a HookRegistry,
    policy: FailurePolicy,
    abort: CancellationToken,
    records: Vec<ExecutionRecord>,
    /// Dependencies not yet settled, per operation
    unresolved: Vec<usize>,
    ready: BinaryHeap<ReadyEntry>,
    in_flight: usize,
    warnings: Vec<String>,
}

impl<'a> Scheduler<'a> {
    fn new(
        graph: &'a OperationGraph,
        hooks: &'a HookRegistry,
        policy: FailurePolicy,
        abort: CancellationToken,
    ) -> Self {
        let records = graph
            .operations()
            .iter()
            .map(|op| ExecutionRecord::new(op.id(), op.key().clone()))
            .collect();
        let unresolved = graph
            .operations()
            .iter()
            .map(|op| op.dependencies().len())
            .collect();
        let ready = graph
            .operations()
            .iter()
            .filter(|op| op.dependencies().is_empty())
            .map(Self::entry)
            .collect();

        Self {
            graph,
            hooks,
            policy,
            abort,
            records,
            unresolved,
            ready,
            in_flight: 0,
            warnings: Vec::new(),
        }
    }

    fn entry(op: &Operation) -> ReadyEntry {
        ReadyEntry {
            transitive_dependents: op.transitive_dependents(),
            id: op.id(),
        }
    }

    fn record(&mut self, id: OperationId) -> &mut ExecutionRecord {
        &mut self.records[id.index()]
    }

    /// Operations outside the requested scope resolve before anything runs
    fn skip_excluded(&mut self) -> Result<()> {
        let graph = self.graph;
        for op in graph.operations().iter().filter(|op| !op.is_included()) {
            self.settle(op.id(), OperationStatus::Skipped)?;
        }
        Ok(())
    }

    async fn run(
        &mut self,
        slots: usize,
        worker: &Worker,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Result<()> {
        let abort = self.abort.clone();
        let mut abort_seen = false;
        loop {
            while self.in_flight < slots && !abort.is_cancelled() {
                let Some(entry) = self.ready.pop() else {
                    break;
                };
                if self.records[entry.id.index()].status() == OperationStatus::Ready {
                    self.dispatch(entry.id, worker)?;
                }
            }

            if self.in_flight == 0 {
                return Ok(());
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(WorkerEvent::Started(id)) => self.mark_executing(id)?,
                    Some(WorkerEvent::Finished(report)) => self.finish(report)?,
                    None => return Ok(()),
                },
                _ = abort.cancelled(), if !abort_seen => {
                    abort_seen = true;
                    info!(
                        "Abort requested, waiting for {} in-flight operations",
                        self.in_flight
                    );
                }
            }
        }
    }

    fn dispatch(&mut self, id: OperationId, worker: &Worker) -> Result<()> {
        let graph = self.graph;
        let op = graph.get(id);

        let mut hook_warning = None;
        match self.hooks.before_execute_operation(op) {
            HookVerdict::Proceed => {}
            HookVerdict::Warn(message) => {
                warn!(operation = %op.key(), "{}", message);
                self.warnings.push(format!("{}: {}", op.key(), message));
                self.record(id).push_warning(message.clone());
                hook_warning = Some(message);
            }
            HookVerdict::Veto(reason) => {
                warn!(operation = %op.key(), "Dispatch vetoed: {}", reason);
                self.record(id)
                    .append_chunks([LogChunk::stderr(format!("{}\n", reason))]);
                return self.settle(id, OperationStatus::Failure);
            }
        }

        let upstream = upstream_keys(op.dependencies().iter().map(|dep| {
            let record = &self.records[dep.index()];
            (record.status(), record.cache_key())
        }));

        self.record(id).transition(OperationStatus::Queued)?;
        self.in_flight += 1;
        debug!(operation = %op.key(), in_flight = self.in_flight, "Dispatched");

        worker.spawn(Job {
            operation: op.clone(),
            upstream,
            hook_warning,
        });
        Ok(())
    }

    fn mark_executing(&mut self, id: OperationId) -> Result<()> {
        if self.records[id.index()].status() == OperationStatus::Queued {
            self.record(id).transition(OperationStatus::Executing)?;
        }
        Ok(())
    }

    fn finish(&mut self, report: WorkerReport) -> Result<()> {
        self.in_flight -= 1;
        let id = report.id;

        let record = &mut self.records[id.index()];
        record.set_cache_key(report.cache_key);
        for warning in &report.warnings {
            record.push_warning(warning.clone());
        }
        record.append_chunks(report.chunks);
        if let Some(cobuild) = report.cobuild {
            record.set_cobuild(cobuild);
        }
        if let Some(duration) = report.duration {
            record.override_duration(duration);
        }
        self.warnings.extend(report.warnings);

        self.settle(id, report.status)?;

        let graph = self.graph;
        self.hooks
            .after_execute_operation(graph.get(id), &self.records[id.index()]);
        Ok(())
    }

    /// Move `id` to a terminal status and propagate to its dependents:
    /// unblock them, or block them (transitively) on failure/cancellation.
    fn settle(&mut self, id: OperationId, status: OperationStatus) -> Result<()> {
        let graph = self.graph;
        let mut pending = vec![(id, status)];

        while let Some((id, status)) = pending.pop() {
            if self.records[id.index()].status().is_terminal() {
                continue;
            }
            self.record(id).transition(status)?;

            let op = graph.get(id);
            let record = &self.records[id.index()];
            match status {
                OperationStatus::Failure => error!(operation = %op.key(), "Operation failed"),
                OperationStatus::Blocked => warn!(operation = %op.key(), "Operation blocked by a failed dependency"),
                _ => info!(
                    operation = %op.key(),
                    status = %status,
                    duration_ms = record.duration().as_millis() as u64,
                    "Operation finished"
                ),
            }
            self.hooks.on_operation_status_changed(op, record);

            if status == OperationStatus::Failure
                && self.policy == FailurePolicy::StopOnFirstFailure
                && !self.abort.is_cancelled()
            {
                info!("Stopping dispatch after first failure ({})", op.key());
                self.abort.cancel();
            }

            for &dependent in op.dependents() {
                if status.unblocks_dependents() {
                    let remaining = &mut self.unresolved[dependent.index()];
                    *remaining -= 1;
                    if *remaining == 0 {
                        self.ready.push(Self::entry(graph.get(dependent)));
                    }
                } else {
                    pending.push((dependent, OperationStatus::Blocked));
                }
            }
        }
        Ok(())
    }

    /// After an abort nothing is in flight; whatever never started is cancelled.
    /// Levels are walked in order so dependents of a cancelled operation end
    /// up `Blocked`, the same as when a dispatched worker reports `Cancelled`.
    fn cancel_remaining(&mut self) -> Result<()> {
        let graph = self.graph;
        for &id in graph.levels().iter().flatten() {
            if self.records[id.index()].status().is_terminal() {
                continue;
            }
            if !self.abort.is_cancelled() {
                error!(operation = %graph.get(id).key(), "Operation never became ready");
            }
            self.settle(id, OperationStatus::Cancelled)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Workers
// ═══════════════════════════════════════════════════════════════════════════

struct Job {
    operation: Operation,
    /// Keys of the dependencies, `None` if one of them is uncacheable
    upstream: Option<Vec<String>>,
    hook_warning: Option<String>,
}

struct WorkerReport {
    id: OperationId,
    status: OperationStatus,
    cache_key: Option<String>,
    chunks: Vec<LogChunk>,
    warnings: Vec<String>,
    duration: Option<Duration>,
    cobuild: Option<CobuildMetadata>,
}

impl WorkerReport {
    fn new(id: OperationId, status: OperationStatus) -> Self {
        Self {
            id,
            status,
            cache_key: None,
            chunks: Vec::new(),
            warnings: Vec::new(),
            duration: None,
            cobuild: None,
        }
    }
}

#[derive(Clone)]
struct Worker {
    runner: Arc<dyn OperationRunner>,
    decisions: Arc<CacheDecisionService>,
    recorder: Arc<MetadataRecorder>,
    cobuild: Option<CobuildMetadata>,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    allow_warnings_in_success: bool,
    abort: CancellationToken,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    fn spawn(&self, job: Job) {
        let worker = self.clone();
        tokio::spawn(async move {
            let id = job.operation.id();
            let key = job.operation.key().clone();
            let report = match AssertUnwindSafe(worker.run(job)).catch_unwind().await {
                Ok(report) => report,
                Err(_) => {
                    error!(operation = %key, "Worker panicked");
                    let mut report = WorkerReport::new(id, OperationStatus::Failure);
                    report
                        .chunks
                        .push(LogChunk::stderr(format!("Worker for {} panicked\n", key)));
                    report
                }
            };
            // The receiver only goes away once the run is over
            let _ = worker.events.send(WorkerEvent::Finished(report));
        });
    }

    async fn run(&self, job: Job) -> WorkerReport {
        let op = &job.operation;
        if self.abort.is_cancelled() {
            return WorkerReport::new(op.id(), OperationStatus::Cancelled);
        }

        let mut report = WorkerReport::new(op.id(), OperationStatus::Queued);
        let mut decision = self.decisions.decide(op, job.upstream.as_deref()).await;
        loop {
            report.warnings.append(&mut decision.warnings);
            report.cache_key = decision.cache_key.clone();

            match decision.outcome {
                CacheDecision::NoOp => {
                    report.status = OperationStatus::NoOp;
                    return report;
                }
                CacheDecision::FromCache => {
                    self.adopt_cached(op, &decision, &mut report).await;
                    return report;
                }
                CacheDecision::Execute { claimed } => {
                    return self
                        .execute(op, job.hook_warning.as_deref(), claimed, report)
                        .await;
                }
                CacheDecision::CobuildWait => {
                    let Some(cache_key) = decision.cache_key.clone() else {
                        decision.outcome = CacheDecision::Execute { claimed: false };
                        continue;
                    };
                    match self.wait_for_peer(op, &cache_key).await {
                        Some(next) => decision = next,
                        None => {
                            report.status = OperationStatus::Cancelled;
                            return report;
                        }
                    }
                }
            }
        }
    }

    /// Poll a peer's claim until it resolves. `None` if the run is aborted first.
    async fn wait_for_peer(&self, op: &Operation, cache_key: &str) -> Option<Decision> {
        debug!(operation = %op.key(), "Waiting for cobuild peer");
        loop {
            tokio::select! {
                _ = self.abort.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if let Some(decision) = self.decisions.poll_cobuild(op, cache_key).await {
                return Some(decision);
            }
        }
    }

    async fn adopt_cached(&self, op: &Operation, decision: &Decision, report: &mut WorkerReport) {
        report.status = OperationStatus::FromCache;

        if let Some(peer) = &decision.produced_by {
            // Built by a cobuild peer; its log lives on the peer
            report.cobuild = self.cobuild.as_ref().map(|c| CobuildMetadata {
                context_id: c.context_id.clone(),
                runner_id: peer.clone(),
            });
            return;
        }

        let Some(cache_key) = decision.cache_key.as_deref() else {
            return;
        };
        match self.recorder.replay(op.key(), cache_key).await {
            Ok(Some(stored)) => {
                report.duration = Duration::try_from_secs_f64(stored.metadata.duration_in_seconds).ok();
                report.cobuild = stored.metadata.cobuild;
                report.chunks = stored.chunks;
            }
            Ok(None) => {}
            Err(e) => {
                let message = format!("Could not replay output of {}: {}", op.key(), e);
                warn!("{}", message);
                report.warnings.push(message);
            }
        }
    }

    async fn execute(
        &self,
        op: &Operation,
        hook_warning: Option<&str>,
        claimed: bool,
        mut report: WorkerReport,
    ) -> WorkerReport {
        let key = op.key();
        let coordinator = if claimed {
            self.decisions.cobuild().cloned()
        } else {
            None
        };

        if self.abort.is_cancelled() {
            if let Some(coordinator) = &coordinator {
                if let Err(e) = coordinator.release(key).await {
                    warn!(operation = %key, "Could not release cobuild claim: {}", e);
                }
            }
            report.status = OperationStatus::Cancelled;
            return report;
        }

        let _ = self.events.send(WorkerEvent::Started(op.id()));
        let ctx = RunnerContext {
            operation: key.clone(),
            project_folder: op.project_folder().map(Path::to_path_buf),
            cache_key: report.cache_key.clone(),
            cancellation: self.cancel.clone(),
        };

        let started = Instant::now();
        let (mut status, artifacts) = match self.run_with_heartbeat(&ctx, coordinator.as_deref()).await {
            Ok(output) => {
                report.duration = Some(if output.duration.is_zero() {
                    started.elapsed()
                } else {
                    output.duration
                });
                report.chunks = output.chunks;
                (output.status.to_operation_status(), output.artifacts)
            }
            Err(e) => {
                error!(operation = %key, "Runner error: {}", e);
                report.duration = Some(started.elapsed());
                report.chunks.push(LogChunk::stderr(format!("{}\n", e)));
                (OperationStatus::Failure, Vec::new())
            }
        };
        if status == OperationStatus::Success && hook_warning.is_some() {
            status = OperationStatus::SuccessWithWarning;
        }
        self.recorder.emit(key, &report.chunks);

        let mut published_key = None;
        if let Some(cache_key) = &report.cache_key {
            let worth_saving = status == OperationStatus::Success
                || (status == OperationStatus::SuccessWithWarning && self.allow_warnings_in_success);
            if worth_saving && self.decisions.can_save() {
                match self.decisions.save(cache_key, &artifacts).await {
                    None => published_key = Some(cache_key.clone()),
                    Some(warning) => report.warnings.push(warning),
                }
            }
        }

        // Published after the cache save so waiting peers find the entry
        if let Some(coordinator) = &coordinator {
            let outcome = match status {
                OperationStatus::Success => ClaimOutcome::Success,
                OperationStatus::SuccessWithWarning => ClaimOutcome::SuccessWithWarning,
                _ => ClaimOutcome::Failure,
            };
            if let Err(e) = coordinator.complete(key, outcome, published_key.clone()).await {
                let message = format!("Could not publish cobuild result for {}: {}", key, e);
                warn!("{}", message);
                report.warnings.push(message);
            }
        }

        report.cobuild = self.cobuild.clone();
        let persisted: Vec<LogChunk> = hook_warning
            .into_iter()
            .chain(report.warnings.iter().map(String::as_str))
            .map(warning_chunk)
            .chain(report.chunks.iter().cloned())
            .collect();
        let duration = report.duration.unwrap_or_default();
        if let Err(e) = self
            .recorder
            .persist(
                key,
                duration,
                report.cobuild.clone(),
                published_key.as_deref(),
                &persisted,
            )
            .await
        {
            let message = format!("Could not save metadata for {}: {}", key, e);
            warn!("{}", message);
            report.warnings.push(message);
        }

        report.status = status;
        report
    }

    /// Run, refreshing the cobuild claim while the runner is busy
    async fn run_with_heartbeat(
        &self,
        ctx: &RunnerContext,
        coordinator: Option<&CobuildCoordinator>,
    ) -> std::result::Result<RunnerOutput, RunnerError> {
        let Some(coordinator) = coordinator else {
            return self.runner.run(ctx).await;
        };

        let run = self.runner.run(ctx);
        tokio::pin!(run);
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = heartbeat.tick() => match coordinator.refresh(&ctx.operation).await {
                    Ok(true) => {}
                    Ok(false) => debug!(operation = %ctx.operation, "Cobuild claim no longer held"),
                    Err(e) => warn!(operation = %ctx.operation, "Cobuild heartbeat failed: {}", e),
                },
            }
        }
    }
}
