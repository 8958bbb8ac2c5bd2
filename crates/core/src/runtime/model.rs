//! AgentRuntime - Persistent execution record
//!
//! An AgentRuntime is one execution attempt of an agent against one query.
//! It is the unit that gets snapshotted to disk after every transition, so
//! its message and tool call lists only ever grow while it runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::meta::AgentRuntimeMeta;
use super::tool_call::ToolCallRecord;
use crate::error::{Error, ErrorKind};
use crate::Result;

/// Lifecycle status of a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    /// Created and persisted, not yet started
    Pending,
    /// The model/tool loop is running
    Executing,
    /// Loop finished with a final answer
    Completed,
    /// Loop ended with an error or was cancelled
    Failed,
}

impl RuntimeStatus {
    /// Check if the status represents a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an allowed edge of the state machine
    pub fn can_transition_to(&self, next: RuntimeStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Executing)
                | (Self::Executing, Self::Completed)
                | (Self::Executing, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kind and message as stored on a runtime or tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for ErrorRecord {
    fn from(error: &Error) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Identifier chosen by the model, if it supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    /// Symbolic tool name
    pub name: String,

    /// Tool arguments
    #[serde(default)]
    pub input: serde_json::Value,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            call_id: None,
            name: name.into(),
            input,
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }
}

/// A persisted conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message ID
    pub id: String,

    /// Role of the message sender
    pub role: MessageRole,

    /// Message content
    pub content: String,

    pub timestamp: DateTime<Utc>,

    /// Tool calls requested alongside an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_requests: Vec<ToolRequest>,

    /// The call this message answers (tool role only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: MessageRole, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
            tool_requests: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content.into())
    }

    pub fn assistant(content: impl Into<String>, tool_requests: Vec<ToolRequest>) -> Self {
        let mut message = Self::with_role(MessageRole::Assistant, content.into());
        message.tool_requests = tool_requests;
        message
    }

    /// A tool result fed back to the model
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::with_role(MessageRole::Tool, content.into());
        message.tool_call_id = Some(call_id.into());
        message
    }
}

/// The mutable execution record of one agent invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRuntime {
    #[serde(default = "super::default_schema_version")]
    pub schema_version: u32,

    pub runtime_id: Uuid,

    /// Agent snapshot this runtime was created from
    pub meta: AgentRuntimeMeta,

    /// The query that started this runtime
    pub query: String,

    pub status: RuntimeStatus,

    /// Conversation so far, in production order
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Tool calls so far, in the order they began
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,

    /// Failure details (failed runtimes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentRuntime {
    /// Create a pending runtime seeded with the system prompt and query
    pub fn new(meta: AgentRuntimeMeta, query: impl Into<String>) -> Self {
        let query = query.into();
        let mut messages = Vec::new();
        if let Some(prompt) = &meta.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.push(ChatMessage::user(query.clone()));

        Self {
            schema_version: super::SCHEMA_VERSION,
            runtime_id: Uuid::new_v4(),
            meta,
            query,
            status: RuntimeStatus::Pending,
            messages,
            tool_calls: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.meta.agent_id
    }

    /// Move to `next`, rejecting edges outside the state machine
    pub fn transition(&mut self, next: RuntimeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            RuntimeStatus::Executing => self.started_at = Some(now),
            RuntimeStatus::Completed | RuntimeStatus::Failed => self.ended_at = Some(now),
            RuntimeStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    /// Mark the runtime as executing
    pub fn mark_executing(&mut self) -> Result<()> {
        self.transition(RuntimeStatus::Executing)
    }

    /// Mark the runtime as completed
    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(RuntimeStatus::Completed)
    }

    /// Mark the runtime as failed, recording why
    pub fn mark_failed(&mut self, error: ErrorRecord) -> Result<()> {
        self.transition(RuntimeStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Append a message to the transcript
    pub fn push_message(&mut self, message: ChatMessage) -> Result<()> {
        self.ensure_open()?;
        self.messages.push(message);
        Ok(())
    }

    /// Register a tool call that has just begun
    pub fn begin_tool_call(&mut self, record: ToolCallRecord) -> Result<()> {
        self.ensure_open()?;
        if self.tool_call(&record.call_id).is_some() {
            return Err(Error::InvalidInput(format!(
                "duplicate tool call id {}",
                record.call_id
            )));
        }
        self.tool_calls.push(record);
        Ok(())
    }

    pub fn tool_call(&self, call_id: &str) -> Option<&ToolCallRecord> {
        self.tool_calls.iter().find(|r| r.call_id == call_id)
    }

    pub fn tool_call_mut(&mut self, call_id: &str) -> Option<&mut ToolCallRecord> {
        self.tool_calls.iter_mut().find(|r| r.call_id == call_id)
    }

    /// Last assistant message, the answer of a completed runtime
    pub fn final_message(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
    }

    /// Check if the runtime is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration from start to end, if both are known
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(started), Some(ended)) => {
                Some(ended.signed_duration_since(started).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "runtime {} is {} and can no longer change",
                self.runtime_id, self.status
            )));
        }
        Ok(())
    }
}

/// Summary of a runtime for listing purposes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSummary {
    pub runtime_id: Uuid,
    pub agent_id: String,
    pub status: RuntimeStatus,

    /// Truncated query (first 100 chars)
    pub query_preview: String,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tool_call_count: usize,
    pub error: Option<ErrorRecord>,
}

impl From<&AgentRuntime> for RuntimeSummary {
    fn from(runtime: &AgentRuntime) -> Self {
        let query_preview = if runtime.query.chars().count() > 100 {
            format!("{}...", runtime.query.chars().take(100).collect::<String>())
        } else {
            runtime.query.clone()
        };

        Self {
            runtime_id: runtime.runtime_id,
            agent_id: runtime.meta.agent_id.clone(),
            status: runtime.status,
            query_preview,
            created_at: runtime.created_at,
            started_at: runtime.started_at,
            ended_at: runtime.ended_at,
            tool_call_count: runtime.tool_calls.len(),
            error: runtime.error.clone(),
        }
    }
}
