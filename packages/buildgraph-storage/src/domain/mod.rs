//! Domain layer for buildgraph persistence
//!
//! # Domain Models
//!
//! - `OperationMetadata`: durable record of an operation's last outcome
//! - `LogChunk`: one ordered, stream-tagged piece of captured output
//! - `ClaimRecord`: cobuild claim held in a store shared by cooperating runners
//!
//! # Port Traits
//!
//! - `MetadataStore`: per-operation outcome + log chunk persistence
//! - `ClaimStore`: versioned compare-and-set over small keyed records
//!
//! # Examples
//!
//! ```rust,ignore
//! use buildgraph_storage::domain::{ClaimRecord, ClaimStore};
//!
//! async fn example(store: impl ClaimStore) -> Result<()> {
//!     let record = ClaimRecord::claimed("runner-a", expires_at);
//!     // Only succeeds if nobody wrote the key yet
//!     let version = store.compare_and_set("cobuild:ctx:web;build", None, &record).await?;
//!     assert!(version.is_some());
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Operation Metadata
// ═══════════════════════════════════════════════════════════════════════════

/// Identity of an operation as seen by storage (project + phase names)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationRef {
    pub project: String,
    pub phase: String,
}

impl OperationRef {
    pub fn new(project: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            phase: phase.into(),
        }
    }
}

impl std::fmt::Display for OperationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.project, self.phase)
    }
}

/// Output stream a chunk was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One captured output chunk, kept in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub kind: StreamKind,
    pub text: String,
}

impl LogChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            kind: StreamKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            kind: StreamKind::Stderr,
            text: text.into(),
        }
    }
}

/// Cobuild identifiers recorded with an outcome produced under cobuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CobuildMetadata {
    pub context_id: String,
    pub runner_id: String,
}

/// Durable record of an operation's last outcome
///
/// Serialized as `state.json` next to the log files it points to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    pub duration_in_seconds: f64,
    pub log_path: PathBuf,
    pub error_log_path: PathBuf,
    pub log_chunks_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cobuild: Option<CobuildMetadata>,
    /// Build cache entry this output belongs to, if it was published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Metadata plus the chunks needed to replay the operation's output
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOperation {
    pub metadata: OperationMetadata,
    pub chunks: Vec<LogChunk>,
}

/// What the engine hands to a `MetadataStore` after a terminal transition
#[derive(Debug, Clone)]
pub struct MetadataDraft<'a> {
    pub duration_in_seconds: f64,
    pub cobuild: Option<CobuildMetadata>,
    pub cache_key: Option<String>,
    pub chunks: &'a [LogChunk],
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist the outcome of `operation`, replacing the latest one. A draft
    /// with a cache key is also kept under that key, so later outcomes of the
    /// same operation never overwrite it.
    async fn save(&self, operation: &OperationRef, draft: MetadataDraft<'_>)
        -> Result<OperationMetadata>;

    /// Load the latest persisted outcome. `Ok(None)` when nothing was ever
    /// saved or the files have been removed.
    async fn load(&self, operation: &OperationRef) -> Result<Option<StoredOperation>>;

    /// Load the outcome that was saved with `cache_key`.
    async fn load_cached(
        &self,
        operation: &OperationRef,
        cache_key: &str,
    ) -> Result<Option<StoredOperation>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Cobuild Claims
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Unclaimed,
    Claimed,
    Completed,
}

impl ClaimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimState::Unclaimed => "unclaimed",
            ClaimState::Claimed => "claimed",
            ClaimState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unclaimed" => Some(ClaimState::Unclaimed),
            "claimed" => Some(ClaimState::Claimed),
            "completed" => Some(ClaimState::Completed),
            _ => None,
        }
    }
}

/// Result a claim holder published on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    Success,
    SuccessWithWarning,
    Failure,
}

impl ClaimOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, ClaimOutcome::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimOutcome::Success => "success",
            ClaimOutcome::SuccessWithWarning => "success_with_warning",
            ClaimOutcome::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ClaimOutcome::Success),
            "success_with_warning" => Some(ClaimOutcome::SuccessWithWarning),
            "failure" => Some(ClaimOutcome::Failure),
            _ => None,
        }
    }
}

/// Claim payload; the store attaches the version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub runner_id: String,
    pub state: ClaimState,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub outcome: Option<ClaimOutcome>,
    #[serde(default)]
    pub cache_key: Option<String>,
}

impl ClaimRecord {
    pub fn claimed(runner_id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            runner_id: runner_id.into(),
            state: ClaimState::Claimed,
            expires_at,
            outcome: None,
            cache_key: None,
        }
    }

    pub fn completed(
        runner_id: impl Into<String>,
        outcome: ClaimOutcome,
        cache_key: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            runner_id: runner_id.into(),
            state: ClaimState::Completed,
            expires_at,
            outcome: Some(outcome),
            cache_key,
        }
    }

    pub fn unclaimed(runner_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            runner_id: runner_id.into(),
            state: ClaimState::Unclaimed,
            expires_at: now,
            outcome: None,
            cache_key: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// A record that blocks new claims: claimed or completed, and not expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.state != ClaimState::Unclaimed && !self.is_expired(now)
    }
}

/// Claim record as read back from a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedClaim {
    pub version: u64,
    pub record: ClaimRecord,
}

/// Atomic compare-and-set over small keyed records.
///
/// Implementations must make `compare_and_set` atomic with respect to every
/// other caller of the same backing store, including other processes.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedClaim>>;

    /// Write `record` only if the stored version equals `expected_version`
    /// (`None` means the key must be absent). Returns the new version on
    /// success and `None` when the precondition did not hold.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        record: &ClaimRecord,
    ) -> Result<Option<u64>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_operation_ref_display() {
        let op = OperationRef::new("web", "build");
        assert_eq!(op.to_string(), "web (build)");
    }

    #[test]
    fn test_metadata_serializes_camel_case() {
        let metadata = OperationMetadata {
            duration_in_seconds: 1.5,
            log_path: PathBuf::from("all.log"),
            error_log_path: PathBuf::from("error.log"),
            log_chunks_path: PathBuf::from("log-chunks.jsonl"),
            cobuild: Some(CobuildMetadata {
                context_id: "ctx".to_string(),
                runner_id: "runner-1".to_string(),
            }),
            cache_key: Some("3f2a".to_string()),
            recorded_at: Utc::now(),
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("durationInSeconds"));
        assert!(json.contains("errorLogPath"));
        assert!(json.contains("contextId"));
        assert!(json.contains("cacheKey"));

        let back: OperationMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn test_metadata_without_cobuild_omits_field() {
        let metadata = OperationMetadata {
            duration_in_seconds: 0.0,
            log_path: PathBuf::from("all.log"),
            error_log_path: PathBuf::from("error.log"),
            log_chunks_path: PathBuf::from("log-chunks.jsonl"),
            cobuild: None,
            cache_key: None,
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(!json.contains("cobuild"));
        assert!(!json.contains("cacheKey"));
    }

    #[test]
    fn test_claim_expiry() {
        let now = Utc::now();
        let claim = ClaimRecord::claimed("runner-a", now + Duration::seconds(10));
        assert!(!claim.is_expired(now));
        assert!(claim.is_live(now));
        assert!(claim.is_expired(now + Duration::seconds(10)));
        assert!(!claim.is_live(now + Duration::seconds(11)));
    }

    #[test]
    fn test_unclaimed_is_never_live() {
        let now = Utc::now();
        let claim = ClaimRecord::unclaimed("runner-a", now);
        assert!(!claim.is_live(now - Duration::seconds(5)));
    }

    #[test]
    fn test_claim_state_parse() {
        for state in [ClaimState::Unclaimed, ClaimState::Claimed, ClaimState::Completed] {
            assert_eq!(ClaimState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ClaimState::parse("bogus"), None);
    }

    #[test]
    fn test_claim_outcome_success() {
        assert!(ClaimOutcome::Success.is_success());
        assert!(ClaimOutcome::SuccessWithWarning.is_success());
        assert!(!ClaimOutcome::Failure.is_success());
        assert_eq!(
            ClaimOutcome::parse("success_with_warning"),
            Some(ClaimOutcome::SuccessWithWarning)
        );
    }
}
