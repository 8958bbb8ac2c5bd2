//! Agent Runner - executes agent invocations against external tool providers
//!
//! This crate wires the runtime model from `runtime-core` to live
//! infrastructure: an [`EventBus`] for observers, a [`ToolSessionManager`]
//! owning provider connections, and the [`AgentRuntimeTracker`] that drives
//! each invocation and records it in a [`RuntimeRepository`].

mod collaborators;
mod config;
mod event_bus;
mod session;
mod tracker;

pub use collaborators::{Model, ModelTurn, ToolDescriptor, ToolRegistry, ToolRetriever};
pub use config::{ProviderConfig, ProviderTransport, ProvidersConfig, RuntimeConfig};
pub use event_bus::{EventBus, EventFilter, EventHandler, SubscriptionId};
pub use session::{
    HttpConnection, StdioConnection, ToolConnection, ToolConnector, ToolSession,
    ToolSessionManager, TransportConnector,
};
pub use tracker::{AgentRuntimeTracker, ExecutionResult};

pub use runtime_core::runtime::RuntimeRepository;
pub use runtime_core::{Error, ErrorKind, Result};
