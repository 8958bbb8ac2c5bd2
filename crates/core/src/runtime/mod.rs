pub mod event;
pub mod meta;
mod model;
mod persistence;
mod tool_call;

pub use event::{ErrorOrigin, EventKind, EventPayload, RuntimeEvent};
pub use meta::{AgentRuntimeMeta, ModelSettings};
pub use model::{
    AgentRuntime, ChatMessage, ErrorRecord, MessageRole, RuntimeStatus, RuntimeSummary,
    ToolRequest,
};
pub use persistence::{is_valid_id, RuntimeRepository};
pub use tool_call::ToolCallRecord;

/// Version stamped into every persisted runtime document
pub const SCHEMA_VERSION: u32 = 1;

pub(crate) fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Read an output field so that an explicit `null` stays `Some(Null)`.
/// Paired with `skip_serializing_if = "Option::is_none"` so `None` is omitted.
pub(crate) fn present_value<'de, D>(
    deserializer: D,
) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <serde_json::Value as serde::Deserialize>::deserialize(deserializer).map(Some)
}
