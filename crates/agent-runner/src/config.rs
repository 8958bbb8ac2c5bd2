//! Runtime and provider configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use runtime_core::{Error, Result};

/// Configuration for the runtime tracker and session manager
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of the runtime repository
    pub data_dir: PathBuf,
    /// Upper bound on a provider handshake
    pub handshake_timeout: Duration,
    /// Default upper bound on a single tool call
    pub tool_timeout: Duration,
    /// How long a failed handshake is reported without retrying
    pub failure_cooldown: Duration,
    /// Maximum model turns per runtime
    pub max_turns: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".agent-data"),
            handshake_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(60),
            failure_cooldown: Duration::from_secs(5),
            max_turns: 16,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `AGENT_RT_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("AGENT_RT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_number(&lookup, "AGENT_RT_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(&lookup, "AGENT_RT_TOOL_TIMEOUT_MS") {
            config.tool_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(&lookup, "AGENT_RT_FAILURE_COOLDOWN_MS") {
            config.failure_cooldown = Duration::from_millis(ms);
        }
        if let Some(turns) = parse_number(&lookup, "AGENT_RT_MAX_TURNS") {
            config.max_turns = turns as usize;
        }

        config
    }
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}: {:?} is not a number", key, raw);
            None
        }
    }
}

/// How to reach a tool provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderTransport {
    /// Spawn a child process and speak JSON-RPC over its stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// POST JSON-RPC requests to an HTTP endpoint
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Connection parameters for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub transport: ProviderTransport,

    /// Overrides the runtime-wide handshake timeout
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
}

impl ProviderConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: ProviderTransport::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            },
            handshake_timeout_ms: None,
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            transport: ProviderTransport::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            handshake_timeout_ms: None,
        }
    }
}

/// The externally supplied `provider id -> connection parameters` mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvidersConfig {
    providers: HashMap<String, ProviderConfig>,
}

impl ProvidersConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>, config: ProviderConfig) -> Self {
        self.providers.insert(provider_id.into(), config);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn get(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider_id)
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
