//! Error types for task orchestration, streaming and caching

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Engine errors
///
/// Cloneable so a single upstream failure can be handed to every caller
/// waiting on the same cache load.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Worker pool is at capacity and admission was refused
    #[error("Worker pool saturated (capacity {capacity})")]
    Saturated { capacity: usize },

    /// Unknown task or subscription
    #[error("Not found: {0}")]
    NotFound(String),

    /// A collaborator (data fetch, analysis, text generation) failed
    #[error("Upstream failure from {source_name}: {message}")]
    UpstreamFailure {
        source_name: String,
        message: String,
    },

    /// A deadline elapsed
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A subscriber fell behind its delivery buffer
    #[error("Subscriber lagged behind and skipped {skipped} events")]
    Lagging { skipped: u64 },

    /// Cooperative cancellation was honored
    #[error("Cancelled")]
    Cancelled,

    /// The task's event stream is closed or already reclaimed
    #[error("Event stream closed for task {0}")]
    StreamClosed(String),

    /// A caller-supplied task id is still in use
    #[error("Task id already in use: {0}")]
    DuplicateTask(String),

    /// The analysis request was rejected before admission
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A task body panicked
    #[error("Task body panicked: {0}")]
    Panicked(String),
}

/// Serializable error classification carried by snapshots and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Saturated,
    NotFound,
    UpstreamFailure,
    Timeout,
    Lagging,
    Cancelled,
    StreamClosed,
    DuplicateTask,
    InvalidRequest,
    Config,
    Internal,
}

impl EngineError {
    /// Shorthand for an upstream failure
    pub fn upstream(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamFailure {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Saturated { .. } => ErrorKind::Saturated,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::UpstreamFailure { .. } => ErrorKind::UpstreamFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Lagging { .. } => ErrorKind::Lagging,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::StreamClosed(_) => ErrorKind::StreamClosed,
            Self::DuplicateTask(_) => ErrorKind::DuplicateTask,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Config(_) => ErrorKind::Config,
            Self::Panicked(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same upstream call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamFailure { .. } | Self::Timeout(_))
    }
}

/// Failure description stored on a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for TaskFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Collaborators built on `anyhow` surface as upstream failures
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::upstream("collaborator", format!("{err:#}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Saturated { capacity: 2 };
        assert_eq!(err.to_string(), "Worker pool saturated (capacity 2)");

        let err = EngineError::upstream("quotes", "HTTP 503");
        assert_eq!(err.to_string(), "Upstream failure from quotes: HTTP 503");
    }

    #[test]
    fn test_error_kind_and_failure() {
        let err = EngineError::Timeout(Duration::from_secs(3));
        let failure = TaskFailure::from(&err);
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert!(failure.message.contains("3s"));

        assert_eq!(EngineError::Panicked("boom".into()).kind(), ErrorKind::Internal);
        assert_eq!(
            serde_json::to_value(ErrorKind::UpstreamFailure).unwrap(),
            serde_json::json!("upstream_failure")
        );
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: EngineError = anyhow::anyhow!("socket reset").into();
        match err {
            EngineError::UpstreamFailure { message, .. } => assert!(message.contains("socket reset")),
            other => panic!("Expected UpstreamFailure, got {other:?}"),
        }
        assert!(EngineError::upstream("x", "y").is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }
}
