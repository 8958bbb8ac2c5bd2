//! Event types for runtime execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{ChatMessage, ErrorRecord, RuntimeStatus};

/// Discriminant of a runtime event, used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BeforeInvocation,
    AfterInvocation,
    MessageAdded,
    ToolCalled,
    ToolResult,
    ErrorOccurred,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeInvocation => "before_invocation",
            Self::AfterInvocation => "after_invocation",
            Self::MessageAdded => "message_added",
            Self::ToolCalled => "tool_called",
            Self::ToolResult => "tool_result",
            Self::ErrorOccurred => "error_occurred",
        }
    }
}

/// Where an `ErrorOccurred` event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    /// The runtime itself failed
    Runtime,
    /// A snapshot, tool call or event write failed
    Persistence,
    /// An event handler failed while handling another event
    Handler,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// The runtime entered the executing state
    BeforeInvocation { query: String },

    /// The runtime reached a terminal state
    AfterInvocation {
        status: RuntimeStatus,
        #[serde(default)]
        final_message: Option<String>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    /// A message was appended to the transcript
    MessageAdded { message: ChatMessage },

    /// A tool call began
    ToolCalled {
        call_id: String,
        tool: String,
        #[serde(default)]
        provider_id: Option<String>,
        input: serde_json::Value,
    },

    /// A tool call finished (successfully or not)
    ToolResult {
        call_id: String,
        tool: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "super::present_value"
        )]
        output: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<ErrorRecord>,
    },

    /// Something went wrong
    ErrorOccurred {
        error: ErrorRecord,
        origin: ErrorOrigin,
        #[serde(default)]
        call_id: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::BeforeInvocation { .. } => EventKind::BeforeInvocation,
            Self::AfterInvocation { .. } => EventKind::AfterInvocation,
            Self::MessageAdded { .. } => EventKind::MessageAdded,
            Self::ToolCalled { .. } => EventKind::ToolCalled,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::ErrorOccurred { .. } => EventKind::ErrorOccurred,
        }
    }
}

/// Runtime event with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Runtime this event belongs to
    pub runtime_id: Uuid,

    pub agent_id: String,

    pub timestamp: DateTime<Utc>,

    /// The event payload
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl RuntimeEvent {
    /// Create a new runtime event
    pub fn new(runtime_id: Uuid, agent_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            runtime_id,
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn before_invocation(runtime_id: Uuid, agent_id: &str, query: String) -> Self {
        Self::new(runtime_id, agent_id, EventPayload::BeforeInvocation { query })
    }

    pub fn after_invocation(
        runtime_id: Uuid,
        agent_id: &str,
        status: RuntimeStatus,
        final_message: Option<String>,
        duration_ms: Option<u64>,
    ) -> Self {
        Self::new(
            runtime_id,
            agent_id,
            EventPayload::AfterInvocation {
                status,
                final_message,
                duration_ms,
            },
        )
    }

    pub fn message_added(runtime_id: Uuid, agent_id: &str, message: ChatMessage) -> Self {
        Self::new(runtime_id, agent_id, EventPayload::MessageAdded { message })
    }

    pub fn error_occurred(
        runtime_id: Uuid,
        agent_id: &str,
        error: ErrorRecord,
        origin: ErrorOrigin,
        call_id: Option<String>,
    ) -> Self {
        Self::new(
            runtime_id,
            agent_id,
            EventPayload::ErrorOccurred {
                error,
                origin,
                call_id,
            },
        )
    }

    /// The call id for tool events
    pub fn call_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::ToolCalled { call_id, .. } | EventPayload::ToolResult { call_id, .. } => {
                Some(call_id)
            }
            EventPayload::ErrorOccurred { call_id, .. } => call_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this event reports a failed event handler
    pub fn is_handler_error(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::ErrorOccurred {
                origin: ErrorOrigin::Handler,
                ..
            }
        )
    }
}
