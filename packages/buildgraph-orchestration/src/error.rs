use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Duplicate operation: {0}")]
    DuplicateOperation(String),

    #[error("Invalid state transition for {operation}: {from} -> {to}")]
    InvalidStateTransition {
        operation: String,
        from: String,
        to: String,
    },

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cobuild transport error: {0}")]
    CobuildTransport(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn runner<E: std::fmt::Display>(e: E) -> Self {
        Self::Runner(e.to_string())
    }

    pub fn cache<E: std::fmt::Display>(e: E) -> Self {
        Self::Cache(e.to_string())
    }

    pub fn cobuild<E: std::fmt::Display>(e: E) -> Self {
        Self::CobuildTransport(e.to_string())
    }

    pub fn persistence<E: std::fmt::Display>(e: E) -> Self {
        Self::Persistence(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::CycleDetected { .. }
            | OrchestratorError::DuplicateOperation(_)
            | OrchestratorError::InvalidStateTransition { .. }
            | OrchestratorError::Config(_) => ErrorCategory::Fatal,
            OrchestratorError::Runner(_) => ErrorCategory::Build,
            OrchestratorError::Cache(_)
            | OrchestratorError::CobuildTransport(_)
            | OrchestratorError::Persistence(_)
            | OrchestratorError::Io(_)
            | OrchestratorError::Other(_) => ErrorCategory::Degraded,
        }
    }
}

/// How an error affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Aborts the run before or instead of scheduling (e.g., a dependency cycle)
    Fatal,
    /// A genuine build failure, recorded on the operation and blocking its dependents
    Build,
    /// Infrastructure degradation: cache, cobuild or persistence unavailable.
    /// Logged as a warning, the run continues without the optimization.
    Degraded,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::Build => "build",
            ErrorCategory::Degraded => "degraded",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCategory::Fatal)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
