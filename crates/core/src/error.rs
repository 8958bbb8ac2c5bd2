//! Error types for the core library

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::RuntimeStatus;

/// Persisted error classification.
///
/// Every [`Error`] maps onto exactly one kind; the kind is what lands on disk
/// and in events, the message carries the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionFailed,
    ToolInvocationFailed,
    ModelFailed,
    PersistenceFailed,
    Cancelled,
    NotFound,
    /// An event observer failed; never terminal for a runtime
    HandlerFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::ToolInvocationFailed => "tool_invocation_failed",
            Self::ModelFailed => "model_failed",
            Self::PersistenceFailed => "persistence_failed",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::HandlerFailed => "handler_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection to provider {provider_id} failed: {message}")]
    ConnectionFailed { provider_id: String, message: String },

    #[error("Tool {tool} failed: {message}")]
    ToolInvocationFailed { tool: String, message: String },

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Model error: {0}")]
    ModelFailed(String),

    #[error("Persistence error: {message}")]
    PersistenceFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Runtime cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: RuntimeStatus,
        to: RuntimeStatus,
    },

    #[error("Tool call {call_id} already finished")]
    ToolCallAlreadyFinished { call_id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cleanup failed for {} session(s): {}", .failures.len(), .failures.join("; "))]
    CleanupFailed { failures: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a PersistenceFailed error without an IO source
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a PersistenceFailed error wrapping an IO error
    pub fn persistence_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::PersistenceFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn connection_failed(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolInvocationFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Classify this error for persistence and events
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::ToolInvocationFailed { .. } | Self::Timeout { .. } => {
                ErrorKind::ToolInvocationFailed
            }
            Self::PersistenceFailed { .. } | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::PersistenceFailed
            }
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CleanupFailed { .. } => ErrorKind::ConnectionFailed,
            Self::ModelFailed(_)
            | Self::InvalidTransition { .. }
            | Self::ToolCallAlreadyFinished { .. }
            | Self::InvalidInput(_) => ErrorKind::ModelFailed,
        }
    }

    /// Whether the agent loop may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::ToolInvocationFailed { .. } | Self::Timeout { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::connection_failed("fs", "refused").kind(),
            ErrorKind::ConnectionFailed
        );
        assert_eq!(
            Error::Timeout {
                operation: "tool search".into(),
                millis: 10
            }
            .kind(),
            ErrorKind::ToolInvocationFailed
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(Error::from(io).kind(), ErrorKind::PersistenceFailed);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::tool_failed("search", "bad input").is_recoverable());
        assert!(!Error::ModelFailed("overloaded".into()).is_recoverable());
        assert!(!Error::persistence("nope").is_recoverable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ToolInvocationFailed).unwrap();
        assert_eq!(json, "\"tool_invocation_failed\"");
    }
}
