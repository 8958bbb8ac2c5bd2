//! Agent identity and configuration captured when a runtime is created

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Model configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model identifier as understood by the model collaborator
    pub name: String,

    /// Free-form parameters (temperature, max tokens, ...)
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Immutable description of the agent behind a runtime.
///
/// Cloned into every runtime it creates, so later edits to the agent never
/// rewrite the history of earlier runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRuntimeMeta {
    /// Stable agent identifier, also the agent's storage directory name
    pub agent_id: String,

    /// Human readable agent name
    pub agent_name: String,

    /// Model configuration at creation time
    pub model: ModelSettings,

    /// System prompt prepended to every conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Symbolic tool names the agent may use
    #[serde(default)]
    pub tools: Vec<String>,

    /// When this snapshot was taken
    pub created_at: DateTime<Utc>,
}

impl AgentRuntimeMeta {
    pub fn new(agent_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            agent_name: agent_id.clone(),
            agent_id,
            model: ModelSettings {
                name: model_name.into(),
                parameters: serde_json::Value::Null,
            },
            system_prompt: None,
            tools: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.model.parameters = parameters;
        self
    }
}
