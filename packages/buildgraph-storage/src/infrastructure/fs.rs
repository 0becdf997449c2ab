//! Filesystem metadata store
//!
//! Layout, one directory per operation:
//!
//! ```text
//! <root>/<project>/<phase>/state.json
//!                         /all.log
//!                         /error.log
//!                         /log-chunks.jsonl
//!                         /cache/<cache key>/state.json
//!                                           /all.log ...
//! ```
//!
//! The top-level `state.json` always describes the latest outcome. An outcome
//! saved with a cache key writes its logs under `cache/<cache key>/` and keeps
//! its own `state.json` there, so a cache hit can replay exactly the output of
//! the run that produced the entry.
//!
//! Names are percent-escaped into path components: distinct projects or
//! phases never share a directory and none can leave the root.
//!
//! `state.json` is written last through a temp file + rename, so a reader
//! never observes a state file pointing at half-written logs.

use std::fmt::Write as _;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::domain::{
    LogChunk, MetadataDraft, MetadataStore, OperationMetadata, OperationRef, StoredOperation,
    StreamKind,
};
use crate::{Result, StorageError};

const STATE_FILE: &str = "state.json";
const LOG_FILE: &str = "all.log";
const ERROR_LOG_FILE: &str = "error.log";
const CHUNKS_FILE: &str = "log-chunks.jsonl";
const CACHE_DIR: &str = "cache";

#[derive(Debug, Clone)]
pub struct FsMetadataStore {
    root: PathBuf,
}

impl FsMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the latest outcome of `operation`
    pub fn operation_dir(&self, operation: &OperationRef) -> PathBuf {
        self.root
            .join(path_component(&operation.project))
            .join(path_component(&operation.phase))
    }

    /// Directory holding the outcome saved with `cache_key`
    pub fn cached_dir(&self, operation: &OperationRef, cache_key: &str) -> PathBuf {
        self.operation_dir(operation)
            .join(CACHE_DIR)
            .join(path_component(cache_key))
    }
}

/// Injective escape of `name` into one path component.
///
/// Keeps `[A-Za-z0-9_@+-]` and non-leading dots; every other byte, `%`
/// included, becomes `%XX`. The empty name maps to `%`, which no other name
/// can produce.
fn path_component(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_' | b'@' | b'+')
            || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
    out
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_state(dir: &Path, metadata: &OperationMetadata) -> Result<()> {
    let state_path = dir.join(STATE_FILE);
    let tmp_path = dir.join(format!("{}.tmp", STATE_FILE));
    tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(metadata)?).await?;
    tokio::fs::rename(&tmp_path, &state_path).await?;
    Ok(())
}

async fn read_stored(dir: &Path) -> Result<Option<StoredOperation>> {
    let state = match read_optional(&dir.join(STATE_FILE)).await? {
        Some(text) => text,
        None => return Ok(None),
    };
    let metadata: OperationMetadata = serde_json::from_str(&state)?;

    // A state file without its chunks still restores duration and paths.
    let chunks = match read_optional(&metadata.log_chunks_path).await? {
        Some(text) => text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<LogChunk>(line).map_err(|e| {
                    StorageError::serialization(format!(
                        "Corrupt log chunk in {}: {}",
                        metadata.log_chunks_path.display(),
                        e
                    ))
                    .with_source(e)
                })
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(Some(StoredOperation { metadata, chunks }))
}

#[async_trait]
impl MetadataStore for FsMetadataStore {
    async fn save(
        &self,
        operation: &OperationRef,
        draft: MetadataDraft<'_>,
    ) -> Result<OperationMetadata> {
        let dir = self.operation_dir(operation);
        let files_dir = match &draft.cache_key {
            Some(cache_key) => self.cached_dir(operation, cache_key),
            None => dir.clone(),
        };
        tokio::fs::create_dir_all(&files_dir).await?;

        let mut all = String::new();
        let mut errors = String::new();
        let mut jsonl = String::new();
        for chunk in draft.chunks {
            all.push_str(&chunk.text);
            if chunk.kind == StreamKind::Stderr {
                errors.push_str(&chunk.text);
            }
            jsonl.push_str(&serde_json::to_string(chunk)?);
            jsonl.push('\n');
        }

        let metadata = OperationMetadata {
            duration_in_seconds: draft.duration_in_seconds,
            log_path: files_dir.join(LOG_FILE),
            error_log_path: files_dir.join(ERROR_LOG_FILE),
            log_chunks_path: files_dir.join(CHUNKS_FILE),
            cobuild: draft.cobuild,
            cache_key: draft.cache_key,
            recorded_at: Utc::now(),
        };

        tokio::fs::write(&metadata.log_path, all).await?;
        tokio::fs::write(&metadata.error_log_path, errors).await?;
        tokio::fs::write(&metadata.log_chunks_path, jsonl).await?;

        if files_dir != dir {
            write_state(&files_dir, &metadata).await?;
        }
        write_state(&dir, &metadata).await?;

        debug!(operation = %operation, dir = %files_dir.display(), "Saved operation metadata");
        Ok(metadata)
    }

    async fn load(&self, operation: &OperationRef) -> Result<Option<StoredOperation>> {
        read_stored(&self.operation_dir(operation)).await
    }

    async fn load_cached(
        &self,
        operation: &OperationRef,
        cache_key: &str,
    ) -> Result<Option<StoredOperation>> {
        read_stored(&self.cached_dir(operation, cache_key)).await
    }
}
