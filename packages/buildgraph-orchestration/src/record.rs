use std::time::Duration;

use buildgraph_storage::{CobuildMetadata, LogChunk, StreamKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::operation::{OperationId, OperationKey};
use crate::status::OperationStatus;

/// Per-operation mutable state for one run
///
/// Owns the state machine of one operation: every status change goes through
/// [`ExecutionRecord::transition`], which rejects moves the machine does not
/// allow, so a terminal record is never reopened.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    operation: OperationId,
    key: OperationKey,
    status: OperationStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration: Duration,
    duration_reported: bool,
    chunks: Vec<LogChunk>,
    cache_key: Option<Option<String>>,
    cobuild: Option<CobuildMetadata>,
    warnings: Vec<String>,
}

impl ExecutionRecord {
    pub fn new(operation: OperationId, key: OperationKey) -> Self {
        Self {
            operation,
            key,
            status: OperationStatus::Ready,
            started_at: None,
            ended_at: None,
            duration: Duration::ZERO,
            duration_reported: false,
            chunks: Vec::new(),
            cache_key: None,
            cobuild: None,
            warnings: Vec::new(),
        }
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn chunks(&self) -> &[LogChunk] {
        &self.chunks
    }

    /// `None` until computed; `Some(None)` when the operation turned out uncacheable
    pub fn cache_key_state(&self) -> Option<Option<&str>> {
        self.cache_key.as_ref().map(|k| k.as_deref())
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_ref().and_then(|k| k.as_deref())
    }

    pub fn cobuild(&self) -> Option<&CobuildMetadata> {
        self.cobuild.as_ref()
    }

    /// Warnings attached by hooks or infrastructure degradations
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Transition to `next`, stamping timing on entry to `Executing` and to
    /// any terminal state.
    pub fn transition(&mut self, next: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                operation: self.key.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == OperationStatus::Executing {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            match self.started_at {
                Some(started) if !self.duration_reported => {
                    self.duration = (now - started).to_std().unwrap_or(Duration::ZERO);
                }
                _ => {}
            }
            self.ended_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Record the fingerprint-derived cache key. The first value sticks.
    pub fn set_cache_key(&mut self, key: Option<String>) {
        if self.cache_key.is_none() {
            self.cache_key = Some(key);
        }
    }

    pub fn set_cobuild(&mut self, cobuild: CobuildMetadata) {
        self.cobuild = Some(cobuild);
    }

    pub fn append_chunks<I: IntoIterator<Item = LogChunk>>(&mut self, chunks: I) {
        self.chunks.extend(chunks);
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        self.chunks.push(warning_chunk(&warning));
        self.warnings.push(warning);
    }

    /// Report the duration measured by the runner (or restored from metadata)
    /// instead of the wall clock between transitions. Sticks across later
    /// transitions.
    pub fn override_duration(&mut self, duration: Duration) {
        self.duration = duration;
        self.duration_reported = true;
    }

    pub fn stderr_text(&self) -> String {
        self.chunks
            .iter()
            .filter(|c| c.kind == StreamKind::Stderr)
            .map(|c| c.text.as_str())
            .collect()
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            key: self.key.clone(),
            status: self.status,
            duration_ms: self.duration.as_millis() as u64,
            cache_key: self.cache_key().map(str::to_string),
            cobuild: self.cobuild.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Stderr line a warning leaves in an operation's captured output
pub fn warning_chunk(warning: &str) -> LogChunk {
    LogChunk::stderr(format!("{}\n", warning))
}

/// Immutable copy of a record taken at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub key: OperationKey,
    pub status: OperationStatus,
    pub duration_ms: u64,
    pub cache_key: Option<String>,
    pub cobuild: Option<CobuildMetadata>,
    pub warnings: Vec<String>,
}
