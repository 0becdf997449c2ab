/*
 * Buildgraph Orchestration - operation graph execution engine
 *
 * Runs every (project, phase) operation of a monorepo build in dependency
 * order with bounded parallelism.
 *
 * Architecture:
 * - Operation graph (phase rules resolved against the project graph, Kahn levels)
 * - Per-operation state machine (ExecutionRecord)
 * - Executor (single coordinating loop + tokio workers, priority ready heap)
 * - Cache decisions (sha256 cache keys over fingerprints and upstream keys)
 * - Cobuild (lease-based claims over a shared compare-and-set store)
 * - Metadata persistence and log replay (buildgraph-storage)
 */

// Public modules
pub mod cache;
pub mod cobuild;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod hooks;
pub mod metadata;
pub mod operation;
pub mod record;
pub mod runner;
pub mod status;
pub mod summary;
pub mod telemetry;
pub mod topology;

// Re-exports
pub use cache::{
    compose_cache_key, upstream_keys, CacheDecision, CacheDecisionService, CacheStore, Decision,
    FingerprintProvider, MemoryCacheStore,
};
pub use cobuild::{ClaimResolution, ClaimResult, CobuildCoordinator, CobuildMode};
pub use config::{
    CacheConfig, CobuildConfig, ConfigError, ExecutorConfig, FailurePolicy, Parallelism,
};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use executor::OperationExecutor;
pub use graph::OperationGraph;
pub use hooks::{ExecutionHook, HookRegistry, HookVerdict};
pub use metadata::{MetadataRecorder, OutputSink, TracingOutputSink};
pub use operation::{Operation, OperationId, OperationKey, OperationSpec};
pub use record::{ExecutionRecord, RecordSnapshot};
pub use runner::{OperationRunner, RunnerContext, RunnerError, RunnerOutput, RunnerStatus};
pub use status::{AggregateStatus, OperationStatus};
pub use summary::RunSummary;
pub use telemetry::init_tracing;
pub use topology::{PhaseRule, StaticTopology, TopologyProvider};
