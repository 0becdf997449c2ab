use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use buildgraph_storage::LogChunk;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::operation::OperationKey;
use crate::status::OperationStatus;

/// Everything a runner gets to know about the operation it executes
#[derive(Debug, Clone)]
pub struct RunnerContext {
    pub operation: OperationKey,
    pub project_folder: Option<PathBuf>,
    /// Final cache key, when the operation is cacheable
    pub cache_key: Option<String>,
    /// Run-level abort signal. Stopping the underlying process is up to the runner.
    pub cancellation: CancellationToken,
}

/// Build verdict reported by a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Success,
    SuccessWithWarning,
    Failure,
}

impl RunnerStatus {
    pub fn to_operation_status(self) -> OperationStatus {
        match self {
            RunnerStatus::Success => OperationStatus::Success,
            RunnerStatus::SuccessWithWarning => OperationStatus::SuccessWithWarning,
            RunnerStatus::Failure => OperationStatus::Failure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOutput {
    pub status: RunnerStatus,
    pub duration: Duration,
    /// Captured output in emission order
    pub chunks: Vec<LogChunk>,
    /// Files produced by the operation, handed to the cache on success
    pub artifacts: Vec<PathBuf>,
}

impl RunnerOutput {
    pub fn new(status: RunnerStatus) -> Self {
        Self {
            status,
            duration: Duration::ZERO,
            chunks: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_chunk(mut self, chunk: LogChunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts.push(path.into());
        self
    }
}

/// The runner could not produce a verdict at all (as opposed to a build
/// that ran and failed). Recorded on the operation as `Failure`.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to start: {0}")]
    Spawn(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Interrupted")]
    Interrupted,
}

impl From<RunnerError> for OrchestratorError {
    fn from(e: RunnerError) -> Self {
        OrchestratorError::runner(e)
    }
}

/// Executes the actual command behind an operation
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn run(&self, ctx: &RunnerContext) -> std::result::Result<RunnerOutput, RunnerError>;
}
