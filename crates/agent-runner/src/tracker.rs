//! Agent runtime tracker - drives one invocation from start to terminal state
//!
//! Every transition is persisted as a snapshot, every step is published on
//! the [`EventBus`] and appended to the runtime's event log. Persistence is
//! best-effort: a failed write is reported as an `ErrorOccurred` event and the
//! run carries on.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use runtime_core::runtime::{
    is_valid_id, AgentRuntime, AgentRuntimeMeta, ChatMessage, ErrorOrigin, ErrorRecord,
    EventPayload, RuntimeEvent, RuntimeRepository, RuntimeStatus, ToolCallRecord, ToolRequest,
};
use runtime_core::{Error, ErrorKind, Result};

use crate::collaborators::{Model, ToolDescriptor, ToolRetriever};
use crate::config::RuntimeConfig;
use crate::event_bus::EventBus;
use crate::session::ToolSessionManager;

/// Outcome of a finished runtime.
///
/// Failed runtimes are reported here too, with the partial transcript.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub runtime_id: Uuid,
    pub agent_id: String,
    pub status: RuntimeStatus,
    pub final_message: Option<String>,
    pub error: Option<ErrorRecord>,
    pub messages: Vec<ChatMessage>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == RuntimeStatus::Completed
    }
}

impl From<&AgentRuntime> for ExecutionResult {
    fn from(runtime: &AgentRuntime) -> Self {
        Self {
            runtime_id: runtime.runtime_id,
            agent_id: runtime.agent_id().to_string(),
            status: runtime.status,
            final_message: runtime.final_message().map(|m| m.content.clone()),
            error: runtime.error.clone(),
            messages: runtime.messages.clone(),
            tool_calls: runtime.tool_calls.clone(),
        }
    }
}

/// A runtime that has been started but not finished
struct TrackedRuntime {
    runtime: Mutex<AgentRuntime>,
    cancel: CancellationToken,
}

pub struct AgentRuntimeTracker {
    model: Arc<dyn Model>,
    retriever: Arc<dyn ToolRetriever>,
    sessions: Arc<ToolSessionManager>,
    repository: Arc<RuntimeRepository>,
    events: Arc<EventBus>,
    max_turns: usize,
    runtimes: RwLock<HashMap<Uuid, Arc<TrackedRuntime>>>,
}

impl AgentRuntimeTracker {
    pub fn new(
        model: Arc<dyn Model>,
        retriever: Arc<dyn ToolRetriever>,
        sessions: Arc<ToolSessionManager>,
        repository: Arc<RuntimeRepository>,
        events: Arc<EventBus>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            model,
            retriever,
            sessions,
            repository,
            events,
            max_turns: config.max_turns,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn repository(&self) -> &Arc<RuntimeRepository> {
        &self.repository
    }

    pub fn sessions(&self) -> &Arc<ToolSessionManager> {
        &self.sessions
    }

    /// Ids of runtimes started by this tracker that have not finished
    pub fn active_runtimes(&self) -> Vec<Uuid> {
        self.runtimes.read().keys().copied().collect()
    }

    /// Create a pending runtime and persist it
    pub fn start(&self, meta: AgentRuntimeMeta, query: impl Into<String>) -> Result<Uuid> {
        if !is_valid_id(&meta.agent_id) {
            return Err(Error::InvalidInput(format!(
                "invalid agent id: {:?}",
                meta.agent_id
            )));
        }

        let runtime = AgentRuntime::new(meta, query);
        let runtime_id = runtime.runtime_id;
        info!(
            "Created runtime {} for agent {}: {}",
            runtime_id,
            runtime.agent_id(),
            runtime.query.chars().take(100).collect::<String>()
        );

        self.persist_snapshot(&runtime);

        self.runtimes.write().insert(
            runtime_id,
            Arc::new(TrackedRuntime {
                runtime: Mutex::new(runtime),
                cancel: CancellationToken::new(),
            }),
        );

        Ok(runtime_id)
    }

    /// Drive a pending runtime to a terminal state.
    ///
    /// Returns `Err` only if the runtime is unknown, already running or not
    /// pending; a run that fails still returns `Ok` with `status == Failed`.
    pub async fn run(&self, runtime_id: Uuid) -> Result<ExecutionResult> {
        let tracked = self
            .runtimes
            .read()
            .get(&runtime_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("runtime {}", runtime_id)))?;

        let mut runtime = tracked.runtime.try_lock().map_err(|_| {
            Error::InvalidInput(format!("runtime {} is already running", runtime_id))
        })?;

        self.begin(&mut runtime)?;

        let outcome = self.drive(&mut runtime, &tracked.cancel).await;
        self.finish(&mut runtime, outcome);

        let result = ExecutionResult::from(&*runtime);
        drop(runtime);
        self.runtimes.write().remove(&runtime_id);

        Ok(result)
    }

    /// Start and run in one call
    pub async fn execute(
        &self,
        meta: AgentRuntimeMeta,
        query: impl Into<String>,
    ) -> Result<ExecutionResult> {
        let runtime_id = self.start(meta, query)?;
        self.run(runtime_id).await
    }

    /// Ask a runtime to stop at its next tool-call or model-turn boundary.
    ///
    /// In-flight model and tool calls are not interrupted. A runtime that
    /// was started but is not being run is finished as cancelled right away
    /// and can no longer be run.
    pub fn cancel(&self, runtime_id: Uuid) -> Result<()> {
        let tracked = self
            .runtimes
            .read()
            .get(&runtime_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("active runtime {}", runtime_id)))?;

        info!("Cancellation requested for runtime {}", runtime_id);
        tracked.cancel.cancel();

        let Ok(mut runtime) = tracked.runtime.try_lock() else {
            return Ok(());
        };
        if runtime.status != RuntimeStatus::Pending {
            return Ok(());
        }

        self.begin(&mut runtime)?;
        self.finish(&mut runtime, Err(Error::Cancelled));
        drop(runtime);
        self.runtimes.write().remove(&runtime_id);
        Ok(())
    }

    fn begin(&self, runtime: &mut AgentRuntime) -> Result<()> {
        runtime.mark_executing()?;
        info!("Runtime {} executing", runtime.runtime_id);
        self.persist_snapshot(runtime);
        self.emit(
            runtime,
            RuntimeEvent::before_invocation(
                runtime.runtime_id,
                runtime.agent_id(),
                runtime.query.clone(),
            ),
        );
        Ok(())
    }

    /// The model/tool loop
    async fn drive(&self, runtime: &mut AgentRuntime, cancel: &CancellationToken) -> Result<()> {
        let tools = self.retriever.resolve(&runtime.meta.tools).await;
        debug!(
            "Runtime {} resolved {} of {} tools",
            runtime.runtime_id,
            tools.len(),
            runtime.meta.tools.len()
        );

        for turn in 0..self.max_turns {
            check_cancelled(cancel)?;

            debug!("Runtime {} model turn {}", runtime.runtime_id, turn + 1);
            let reply = self
                .model
                .invoke(&runtime.messages, &tools)
                .await
                .map_err(|e| match e {
                    Error::ModelFailed(_) | Error::Cancelled => e,
                    other => Error::ModelFailed(other.to_string()),
                })?;

            let requests = reply.tool_requests;
            self.add_message(runtime, ChatMessage::assistant(reply.message, requests.clone()))?;
            self.persist_snapshot(runtime);

            if requests.is_empty() {
                return Ok(());
            }

            for request in requests {
                check_cancelled(cancel)?;
                self.call_tool(runtime, &tools, request).await?;
            }
        }

        Err(Error::ModelFailed(format!(
            "no final answer after {} model turns",
            self.max_turns
        )))
    }

    /// Run one tool call and feed its result back into the transcript.
    ///
    /// Recoverable failures become the tool's answer; anything else ends the
    /// run.
    async fn call_tool(
        &self,
        runtime: &mut AgentRuntime,
        tools: &[ToolDescriptor],
        request: ToolRequest,
    ) -> Result<()> {
        let runtime_id = runtime.runtime_id;
        let call_id = request
            .call_id
            .filter(|id| is_valid_id(id) && runtime.tool_call(id).is_none())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let descriptor = tools.iter().find(|d| d.name == request.name);
        let provider_id = descriptor.map(|d| d.provider_id.clone());

        let record = ToolCallRecord::begin(
            runtime_id,
            call_id.clone(),
            request.name.clone(),
            provider_id.clone(),
            request.input.clone(),
        );
        runtime.begin_tool_call(record.clone())?;
        self.persist_tool_call(runtime, &record);
        self.emit(
            runtime,
            RuntimeEvent::new(
                runtime_id,
                runtime.agent_id(),
                EventPayload::ToolCalled {
                    call_id: call_id.clone(),
                    tool: request.name.clone(),
                    provider_id,
                    input: request.input.clone(),
                },
            ),
        );

        let outcome = match descriptor {
            Some(descriptor) => self.invoke_tool(descriptor, request.input).await,
            None => Err(Error::tool_failed(&request.name, "Tool is not available")),
        };

        match &outcome {
            Ok(_) => debug!("Tool call {} ({}) succeeded", call_id, request.name),
            Err(e) => warn!("Tool call {} ({}) failed: {}", call_id, request.name, e),
        }

        let record = {
            let record = runtime.tool_call_mut(&call_id).ok_or_else(|| {
                Error::NotFound(format!("tool call {} in runtime {}", call_id, runtime_id))
            })?;
            record.finish(&outcome)?;
            record.clone()
        };
        self.persist_tool_call(runtime, &record);
        self.emit(
            runtime,
            RuntimeEvent::new(
                runtime_id,
                runtime.agent_id(),
                EventPayload::ToolResult {
                    call_id: call_id.clone(),
                    tool: request.name.clone(),
                    output: record.output.clone(),
                    error: record.error.clone(),
                },
            ),
        );

        let content = match &outcome {
            Ok(output) => render_output(output),
            Err(e) if e.is_recoverable() => format!("Error: {}", e),
            Err(_) => {
                self.persist_snapshot(runtime);
                return outcome.map(|_| ());
            }
        };
        self.add_message(runtime, ChatMessage::tool(call_id, content))?;
        self.persist_snapshot(runtime);

        Ok(())
    }

    async fn invoke_tool(&self, descriptor: &ToolDescriptor, input: Value) -> Result<Value> {
        let session = self.sessions.ensure_session(&descriptor.provider_id).await?;
        self.sessions.invoke(&session, &descriptor.name, input).await
    }

    /// Move to the terminal state matching `outcome` and persist it
    fn finish(&self, runtime: &mut AgentRuntime, outcome: Result<()>) {
        let runtime_id = runtime.runtime_id;

        let transition = match outcome {
            Ok(()) => {
                info!("Runtime {} completed", runtime_id);
                runtime.mark_completed()
            }
            Err(e) => {
                if matches!(e, Error::Cancelled) {
                    info!("Runtime {} cancelled", runtime_id);
                } else {
                    error!("Runtime {} failed: {}", runtime_id, e);
                }
                let record = ErrorRecord::from(&e);
                let marked = runtime.mark_failed(record.clone());
                self.emit(
                    runtime,
                    RuntimeEvent::error_occurred(
                        runtime_id,
                        runtime.agent_id(),
                        record,
                        ErrorOrigin::Runtime,
                        None,
                    ),
                );
                marked
            }
        };

        if let Err(e) = transition {
            error!("Runtime {} could not reach a terminal state: {}", runtime_id, e);
        }

        self.persist_snapshot(runtime);
        self.emit(
            runtime,
            RuntimeEvent::after_invocation(
                runtime_id,
                runtime.agent_id(),
                runtime.status,
                runtime.final_message().map(|m| m.content.clone()),
                runtime.duration_ms(),
            ),
        );
    }

    fn add_message(&self, runtime: &mut AgentRuntime, message: ChatMessage) -> Result<()> {
        runtime.push_message(message.clone())?;
        self.emit(
            runtime,
            RuntimeEvent::message_added(runtime.runtime_id, runtime.agent_id(), message),
        );
        Ok(())
    }

    /// Log the event, then publish it. Handler failures raised while
    /// publishing are logged after it.
    fn emit(&self, runtime: &AgentRuntime, event: RuntimeEvent) {
        let logged = self
            .repository
            .append_event(runtime.agent_id(), runtime.runtime_id, &event);
        let handler_errors = self.events.publish(&event);

        if let Err(e) = logged {
            self.report_persistence_failure(runtime, e, event.call_id().map(str::to_string));
            return;
        }

        for error_event in &handler_errors {
            if let Err(e) =
                self.repository
                    .append_event(runtime.agent_id(), runtime.runtime_id, error_event)
            {
                warn!(
                    "Failed to log handler error {} for runtime {}: {}",
                    error_event.id, runtime.runtime_id, e
                );
            }
        }
    }

    fn persist_snapshot(&self, runtime: &AgentRuntime) {
        if let Err(e) = self.repository.save(runtime) {
            self.report_persistence_failure(runtime, e, None);
        }
    }

    fn persist_tool_call(&self, runtime: &AgentRuntime, record: &ToolCallRecord) {
        if let Err(e) =
            self.repository
                .save_tool_call(runtime.agent_id(), runtime.runtime_id, record)
        {
            self.report_persistence_failure(runtime, e, Some(record.call_id.clone()));
        }
    }

    /// Publish a durability failure. Neither it nor handler failures it
    /// triggers are written to the event log, which is likely failing too.
    fn report_persistence_failure(&self, runtime: &AgentRuntime, e: Error, call_id: Option<String>) {
        warn!("Persistence failed for runtime {}: {}", runtime.runtime_id, e);
        let event = RuntimeEvent::error_occurred(
            runtime.runtime_id,
            runtime.agent_id(),
            ErrorRecord::new(ErrorKind::PersistenceFailed, e.to_string()),
            ErrorOrigin::Persistence,
            call_id,
        );
        self.events.publish(&event);
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Text fed back to the model for a successful tool call.
///
/// Provider results carry a `content` list; its text parts are joined.
/// Anything else is passed through as JSON.
fn render_output(output: &Value) -> String {
    if let Value::String(text) = output {
        return text.clone();
    }

    let texts: Vec<&str> = output
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if texts.is_empty() {
        output.to_string()
    } else {
        texts.join("\n")
    }
}
