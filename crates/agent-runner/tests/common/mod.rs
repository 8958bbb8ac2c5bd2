//! Scripted collaborators for tracker tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use agent_runner::{
    AgentRuntimeTracker, Error, EventBus, Model, ModelTurn, ProviderConfig, ProvidersConfig,
    Result, RuntimeConfig, RuntimeRepository, ToolConnection, ToolConnector, ToolDescriptor,
    ToolRegistry, ToolSessionManager,
};
use runtime_core::runtime::{AgentRuntimeMeta, ChatMessage, EventKind, RuntimeEvent};

pub const AGENT_ID: &str = "researcher";

/// Replays a fixed list of model turns, then answers "done"
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Result<ModelTurn>>>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Result<ModelTurn>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Model for ScriptedModel {
    async fn invoke(&self, _messages: &[ChatMessage], _tools: &[ToolDescriptor]) -> Result<ModelTurn> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.turns.lock().pop_front();
        next.unwrap_or_else(|| Ok(ModelTurn::reply("done")))
    }
}

#[derive(Default)]
pub struct ConnectorProbe {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub calls: AtomicUsize,
}

/// Connects to every provider except `down`.
///
/// Tools: `echo` returns its input as text, `slow` sleeps past any test
/// timeout, `explode` fails.
pub struct FakeConnector {
    pub probe: Arc<ConnectorProbe>,
}

struct FakeConnection {
    probe: Arc<ConnectorProbe>,
}

#[async_trait]
impl ToolConnector for FakeConnector {
    async fn connect(
        &self,
        provider_id: &str,
        _config: &ProviderConfig,
    ) -> Result<Box<dyn ToolConnection>> {
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        if provider_id == "down" {
            return Err(Error::connection_failed(provider_id, "connection refused"));
        }
        Ok(Box::new(FakeConnection {
            probe: Arc::clone(&self.probe),
        }))
    }
}

#[async_trait]
impl ToolConnection for FakeConnection {
    async fn call_tool(&mut self, tool: &str, input: Value) -> Result<Value> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        match tool {
            "echo" => {
                let text = input.as_str().map(str::to_string).unwrap_or_else(|| input.to_string());
                Ok(json!({ "content": [{ "type": "text", "text": text }] }))
            }
            "slow" => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("too late"))
            }
            "explode" => Err(Error::tool_failed(tool, "kaboom")),
            other => Err(Error::tool_failed(other, "unknown tool")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub tracker: Arc<AgentRuntimeTracker>,
    pub repository: Arc<RuntimeRepository>,
    pub model: Arc<ScriptedModel>,
    pub probe: Arc<ConnectorProbe>,
    pub recorded: Arc<Mutex<Vec<RuntimeEvent>>>,
    pub data_dir: PathBuf,
    _temp: TempDir,
}

impl Harness {
    pub fn new(turns: Vec<Result<ModelTurn>>) -> Self {
        Self::with_config(turns, |_| {})
    }

    /// Build a harness, letting the caller adjust the config first.
    /// `data_dir` starts out as a fresh temporary directory.
    pub fn with_config(
        turns: Vec<Result<ModelTurn>>,
        configure: impl FnOnce(&mut RuntimeConfig),
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = RuntimeConfig {
            data_dir: temp.path().join("data"),
            tool_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(1),
            ..RuntimeConfig::default()
        };
        configure(&mut config);

        let providers = ProvidersConfig::new()
            .with_provider("local", ProviderConfig::stdio("local-tools", vec![]))
            .with_provider("down", ProviderConfig::http("http://127.0.0.1:9/rpc"));

        let registry = ToolRegistry::new()
            .with_tool(ToolDescriptor::new("echo", "local"))
            .with_tool(ToolDescriptor::new("slow", "local"))
            .with_tool(ToolDescriptor::new("explode", "local"))
            .with_tool(ToolDescriptor::new("remote_echo", "down"));

        let probe = Arc::new(ConnectorProbe::default());
        let connector = Arc::new(FakeConnector {
            probe: Arc::clone(&probe),
        });
        let sessions = Arc::new(ToolSessionManager::with_connector(providers, connector, &config));
        let repository = Arc::new(RuntimeRepository::new(&config.data_dir));
        let events = Arc::new(EventBus::new());
        let model = Arc::new(ScriptedModel::new(turns));

        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        events.subscribe_all(move |event: &RuntimeEvent| -> anyhow::Result<()> {
            sink.lock().push(event.clone());
            Ok(())
        });

        let tracker = Arc::new(AgentRuntimeTracker::new(
            model.clone(),
            Arc::new(registry),
            sessions,
            Arc::clone(&repository),
            events,
            &config,
        ));

        Self {
            tracker,
            repository,
            model,
            probe,
            recorded,
            data_dir: config.data_dir,
            _temp: temp,
        }
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.recorded.lock().clone()
    }

    /// Recorded event kinds, ignoring transcript updates
    pub fn milestones(&self) -> Vec<EventKind> {
        self.events()
            .iter()
            .map(RuntimeEvent::kind)
            .filter(|kind| *kind != EventKind::MessageAdded)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

pub fn meta() -> AgentRuntimeMeta {
    AgentRuntimeMeta::new(AGENT_ID, "test-model")
        .with_system_prompt("You are a careful researcher.")
        .with_tools(vec![
            "echo".to_string(),
            "slow".to_string(),
            "explode".to_string(),
            "remote_echo".to_string(),
            "missing".to_string(),
        ])
}
