//! Interfaces to the language model and the tool retriever

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use runtime_core::runtime::{ChatMessage, ToolRequest};
use runtime_core::Result;

/// An invocable tool and the provider that serves it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub provider_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_id: provider_id.into(),
            description: String::new(),
            input_schema: Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// One model response: a message and any tool calls it asks for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub message: String,
    pub tool_requests: Vec<ToolRequest>,
}

impl ModelTurn {
    /// A final answer with no tool calls
    pub fn reply(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tool_requests: Vec::new(),
        }
    }

    pub fn with_tool_request(mut self, request: ToolRequest) -> Self {
        self.tool_requests.push(request);
        self
    }

    pub fn is_final(&self) -> bool {
        self.tool_requests.is_empty()
    }
}

/// The language model driving a runtime.
///
/// Errors are terminal for the runtime that made the call.
#[async_trait]
pub trait Model: Send + Sync {
    async fn invoke(&self, messages: &[ChatMessage], tools: &[ToolDescriptor]) -> Result<ModelTurn>;
}

/// Maps symbolic tool names to invocable descriptors
#[async_trait]
pub trait ToolRetriever: Send + Sync {
    /// Names with no known tool are left out of the result
    async fn resolve(&self, names: &[String]) -> Vec<ToolDescriptor>;
}

/// A fixed, in-memory tool catalog
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    pub fn with_tool(mut self, descriptor: ToolDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolRetriever for ToolRegistry {
    async fn resolve(&self, names: &[String]) -> Vec<ToolDescriptor> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name).cloned())
            .collect()
    }
}
