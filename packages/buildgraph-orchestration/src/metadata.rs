use std::sync::Arc;
use std::time::Duration;

use buildgraph_storage::{
    CobuildMetadata, LogChunk, MetadataDraft, MetadataStore, OperationMetadata, StoredOperation,
    StreamKind,
};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::operation::OperationKey;

/// Receives captured operation output, live or replayed
pub trait OutputSink: Send + Sync {
    fn write_chunk(&self, operation: &OperationKey, chunk: &LogChunk);
}

/// Forwards output to `tracing`: stdout at info, stderr at warn
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOutputSink;

impl OutputSink for TracingOutputSink {
    fn write_chunk(&self, operation: &OperationKey, chunk: &LogChunk) {
        let text = chunk.text.trim_end_matches('\n');
        match chunk.kind {
            StreamKind::Stdout => info!(operation = %operation, "{}", text),
            StreamKind::Stderr => warn!(operation = %operation, "{}", text),
        }
    }
}

/// Glue between the executor and the durable metadata store
#[derive(Clone, Default)]
pub struct MetadataRecorder {
    store: Option<Arc<dyn MetadataStore>>,
    sink: Option<Arc<dyn OutputSink>>,
}

impl MetadataRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn emit(&self, operation: &OperationKey, chunks: &[LogChunk]) {
        if let Some(sink) = &self.sink {
            for chunk in chunks {
                sink.write_chunk(operation, chunk);
            }
        }
    }

    /// Persist an operation's outcome. `cache_key` is the build cache entry
    /// the outcome was published as, if any. `Ok(None)` when no store is
    /// configured.
    pub async fn persist(
        &self,
        operation: &OperationKey,
        duration: Duration,
        cobuild: Option<CobuildMetadata>,
        cache_key: Option<&str>,
        chunks: &[LogChunk],
    ) -> Result<Option<OperationMetadata>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let draft = MetadataDraft {
            duration_in_seconds: duration.as_secs_f64(),
            cobuild,
            cache_key: cache_key.map(str::to_string),
            chunks,
        };
        let metadata = store
            .save(&operation.to_storage_ref(), draft)
            .await
            .map_err(OrchestratorError::persistence)?;
        debug!(operation = %operation, log = %metadata.log_path.display(), "Saved operation metadata");
        Ok(Some(metadata))
    }

    /// Load the outcome that produced cache entry `cache_key` and replay its
    /// output to the sink. A missing record means there is nothing to replay.
    pub async fn replay(
        &self,
        operation: &OperationKey,
        cache_key: &str,
    ) -> Result<Option<StoredOperation>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let stored = store
            .load_cached(&operation.to_storage_ref(), cache_key)
            .await
            .map_err(OrchestratorError::persistence)?;
        match &stored {
            Some(stored) => self.emit(operation, &stored.chunks),
            None => debug!(operation = %operation, cache_key, "No stored output to replay"),
        }
        Ok(stored)
    }
}

impl std::fmt::Debug for MetadataRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRecorder")
            .field("store", &self.store.is_some())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
