//! Runtime persistence - Store runtimes, tool calls and events to disk
//!
//! Directory structure:
//! ```text
//! {data_dir}/
//!   agents/
//!     {agent_id}/
//!       agent.json             # Latest agent metadata
//!       {runtime_id}/
//!         runtime.json         # Runtime snapshot
//!         events.jsonl         # Event log (newline-delimited JSON)
//!         tool_calls/
//!           {call_id}.json     # One record per tool call
//! ```
//!
//! Snapshots and tool call records are written to a temporary file and
//! renamed into place, so readers never observe a partial document.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event::RuntimeEvent;
use super::meta::AgentRuntimeMeta;
use super::model::{AgentRuntime, RuntimeSummary};
use super::tool_call::ToolCallRecord;
use super::SCHEMA_VERSION;
use crate::{Error, Result};

const AGENT_FILE: &str = "agent.json";
const SNAPSHOT_FILE: &str = "runtime.json";
const EVENTS_FILE: &str = "events.jsonl";
const TOOL_CALLS_DIR: &str = "tool_calls";

/// File-based repository of runtime snapshots
#[derive(Debug, Clone)]
pub struct RuntimeRepository {
    /// Base directory holding one directory per agent
    base_dir: PathBuf,
}

impl RuntimeRepository {
    /// Create a new repository rooted at `data_dir`
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("agents"),
        }
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.base_dir.join(agent_id)
    }

    fn agent_meta_path(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join(AGENT_FILE)
    }

    fn runtime_dir(&self, agent_id: &str, runtime_id: Uuid) -> PathBuf {
        self.agent_dir(agent_id).join(runtime_id.to_string())
    }

    fn snapshot_path(&self, agent_id: &str, runtime_id: Uuid) -> PathBuf {
        self.runtime_dir(agent_id, runtime_id).join(SNAPSHOT_FILE)
    }

    fn events_path(&self, agent_id: &str, runtime_id: Uuid) -> PathBuf {
        self.runtime_dir(agent_id, runtime_id).join(EVENTS_FILE)
    }

    fn tool_calls_dir(&self, agent_id: &str, runtime_id: Uuid) -> PathBuf {
        self.runtime_dir(agent_id, runtime_id).join(TOOL_CALLS_DIR)
    }

    fn tool_call_path(&self, agent_id: &str, runtime_id: Uuid, call_id: &str) -> PathBuf {
        self.tool_calls_dir(agent_id, runtime_id)
            .join(format!("{}.json", call_id))
    }

    /// Save the full snapshot of a runtime.
    ///
    /// Safe to repeat: every call replaces the previous snapshot atomically.
    /// The first save of a runtime also refreshes the agent's metadata file.
    pub fn save(&self, runtime: &AgentRuntime) -> Result<()> {
        let agent_id = runtime.agent_id();
        validate_path_component("agent id", agent_id)?;

        let dir = self.runtime_dir(agent_id, runtime.runtime_id);
        create_dir(&dir)?;

        let path = self.snapshot_path(agent_id, runtime.runtime_id);
        let first_save = !path.exists();

        write_json_atomic(&path, runtime)?;

        if first_save {
            write_json_atomic(&self.agent_meta_path(agent_id), &runtime.meta)?;
        }

        debug!("Saved runtime snapshot: {}", path.display());
        Ok(())
    }

    /// Load a runtime, folding in any tool call records written after its
    /// last snapshot.
    pub fn load(&self, agent_id: &str, runtime_id: Uuid) -> Result<AgentRuntime> {
        validate_path_component("agent id", agent_id)?;
        let path = self.snapshot_path(agent_id, runtime_id);

        if !path.exists() {
            return Err(Error::NotFound(format!(
                "runtime {} for agent {}",
                runtime_id, agent_id
            )));
        }

        let mut runtime: AgentRuntime = read_json(&path)?;
        check_schema_version(runtime.schema_version, &path)?;

        let records = self.load_tool_calls(agent_id, runtime_id)?;
        merge_tool_calls(&mut runtime.tool_calls, records);

        Ok(runtime)
    }

    /// List the runtimes of an agent, oldest first
    pub fn list_by_agent(&self, agent_id: &str) -> Result<Vec<Uuid>> {
        Ok(self
            .list_summaries(agent_id)?
            .into_iter()
            .map(|summary| summary.runtime_id)
            .collect())
    }

    /// List runtime summaries of an agent, oldest first
    pub fn list_summaries(&self, agent_id: &str) -> Result<Vec<RuntimeSummary>> {
        validate_path_component("agent id", agent_id)?;
        let agent_dir = self.agent_dir(agent_id);

        if !agent_dir.exists() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();

        let entries = fs::read_dir(&agent_dir)
            .map_err(|e| Error::persistence_io(format!("Failed to read {}", agent_dir.display()), e))?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let runtime_id = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => match Uuid::parse_str(name) {
                    Ok(id) => id,
                    Err(_) => continue,
                },
                None => continue,
            };

            let snapshot = self.snapshot_path(agent_id, runtime_id);
            match read_json::<AgentRuntime>(&snapshot) {
                Ok(runtime) => summaries.push(RuntimeSummary::from(&runtime)),
                Err(e) => {
                    warn!("Failed to load runtime {}: {}", runtime_id, e);
                    continue;
                }
            }
        }

        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.runtime_id.cmp(&b.runtime_id))
        });

        Ok(summaries)
    }

    /// List every agent that has stored runtimes
    pub fn list_agents(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.base_dir).map_err(|e| {
            Error::persistence_io(format!("Failed to read {}", self.base_dir.display()), e)
        })?;

        let mut agents: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        agents.sort();

        Ok(agents)
    }

    /// Load the latest metadata recorded for an agent
    pub fn load_agent_meta(&self, agent_id: &str) -> Result<AgentRuntimeMeta> {
        validate_path_component("agent id", agent_id)?;
        let path = self.agent_meta_path(agent_id);

        if !path.exists() {
            return Err(Error::NotFound(format!("agent {}", agent_id)));
        }

        read_json(&path)
    }

    // ============ Tool Call Persistence ============

    /// Persist a single tool call record as its own file
    pub fn save_tool_call(
        &self,
        agent_id: &str,
        runtime_id: Uuid,
        record: &ToolCallRecord,
    ) -> Result<()> {
        validate_path_component("agent id", agent_id)?;
        validate_path_component("call id", &record.call_id)?;

        let dir = self.tool_calls_dir(agent_id, runtime_id);
        create_dir(&dir)?;

        let path = self.tool_call_path(agent_id, runtime_id, &record.call_id);
        write_json_atomic(&path, record)?;

        debug!("Saved tool call {} for runtime {}", record.call_id, runtime_id);
        Ok(())
    }

    /// Load all tool call records of a runtime, in start order
    pub fn load_tool_calls(&self, agent_id: &str, runtime_id: Uuid) -> Result<Vec<ToolCallRecord>> {
        validate_path_component("agent id", agent_id)?;
        let dir = self.tool_calls_dir(agent_id, runtime_id);

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir)
            .map_err(|e| Error::persistence_io(format!("Failed to read {}", dir.display()), e))?;

        let mut records = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(e) => e.path(),
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            match read_json::<ToolCallRecord>(&path) {
                Ok(record) => {
                    check_schema_version(record.schema_version, &path)?;
                    records.push(record);
                }
                Err(e) => warn!("Failed to load tool call {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.call_id.cmp(&b.call_id))
        });

        Ok(records)
    }

    // ============ Event Persistence ============

    /// Append an event to a runtime's event log
    pub fn append_event(&self, agent_id: &str, runtime_id: Uuid, event: &RuntimeEvent) -> Result<()> {
        validate_path_component("agent id", agent_id)?;
        let dir = self.runtime_dir(agent_id, runtime_id);
        create_dir(&dir)?;
        let path = self.events_path(agent_id, runtime_id);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::persistence_io(format!("Failed to open {}", path.display()), e))?;

        let mut writer = BufWriter::new(file);
        let json = serde_json::to_string(event)?;

        writeln!(writer, "{}", json)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::persistence_io(format!("Failed to append to {}", path.display()), e))?;

        Ok(())
    }

    /// Load all events for a runtime
    pub fn load_events(&self, agent_id: &str, runtime_id: Uuid) -> Result<Vec<RuntimeEvent>> {
        validate_path_component("agent id", agent_id)?;
        let path = self.events_path(agent_id, runtime_id);

        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .map_err(|e| Error::persistence_io(format!("Failed to open {}", path.display()), e))?;

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("Failed to read line {} in events file: {}", line_num, e);
                    continue;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<RuntimeEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        "Failed to parse event at line {} in {}: {}",
                        line_num,
                        path.display(),
                        e
                    );
                    continue;
                }
            }
        }

        Ok(events)
    }

    /// Delete a runtime and all its data
    pub fn delete_runtime(&self, agent_id: &str, runtime_id: Uuid) -> Result<()> {
        validate_path_component("agent id", agent_id)?;
        let dir = self.runtime_dir(agent_id, runtime_id);

        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| Error::persistence_io(format!("Failed to delete {}", dir.display()), e))?;
            info!("Deleted runtime: {}", dir.display());
        }

        Ok(())
    }
}

/// Whether `value` can name an agent or tool call directory entry
pub fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Reject ids that would escape or confuse the directory layout
fn validate_path_component(what: &str, value: &str) -> Result<()> {
    if is_valid_id(value) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid {}: {:?}", what, value)))
    }
}

fn check_schema_version(version: u32, path: &Path) -> Result<()> {
    if version > SCHEMA_VERSION {
        return Err(Error::persistence(format!(
            "{} has schema version {}, newest supported is {}",
            path.display(),
            version,
            SCHEMA_VERSION
        )));
    }
    Ok(())
}

/// Tool call files are written before the snapshot that contains them, so
/// they win unless they are stale (unfinished while the snapshot is not).
fn merge_tool_calls(snapshot: &mut Vec<ToolCallRecord>, records: Vec<ToolCallRecord>) {
    let mut extra = Vec::new();

    for record in records {
        match snapshot.iter_mut().find(|r| r.call_id == record.call_id) {
            Some(existing) => {
                if record.is_finished() || !existing.is_finished() {
                    *existing = record;
                }
            }
            None => extra.push(record),
        }
    }

    snapshot.extend(extra);
}

fn create_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .map_err(|e| Error::persistence_io(format!("Failed to create {}", dir.display()), e))?;
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| Error::persistence_io(format!("Failed to open {}", path.display()), e))?;

    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| {
        Error::persistence(format!("Failed to deserialize {}: {}", path.display(), e))
    })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4().as_hyphenated()));

    let written = File::create(&temp_path).and_then(|mut file| {
        file.write_all(&content)?;
        file.sync_all()
    });

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::persistence_io(
            format!("Failed to write temp file for {}", path.display()),
            err,
        ));
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::persistence_io(
            format!("Failed to finalize {}", path.display()),
            err,
        ));
    }

    Ok(())
}
