//! Tool call records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::ErrorRecord;
use crate::error::Error;
use crate::Result;

/// One request/response exchange with a tool.
///
/// Created with no outcome the moment the call begins. Exactly one of
/// `output`/`error` is set when it finishes, after which the record is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    #[serde(default = "super::default_schema_version")]
    pub schema_version: u32,

    pub call_id: String,

    /// Runtime this call belongs to
    pub runtime_id: Uuid,

    pub tool: String,

    /// Provider whose session served the call, if it was resolved
    #[serde(default)]
    pub provider_id: Option<String>,

    #[serde(default)]
    pub input: serde_json::Value,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "super::present_value"
    )]
    pub output: Option<serde_json::Value>,

    #[serde(default)]
    pub error: Option<ErrorRecord>,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ToolCallRecord {
    /// Start a new call record with an empty outcome
    pub fn begin(
        runtime_id: Uuid,
        call_id: impl Into<String>,
        tool: impl Into<String>,
        provider_id: Option<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            schema_version: super::SCHEMA_VERSION,
            call_id: call_id.into(),
            runtime_id,
            tool: tool.into(),
            provider_id,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.is_finished() && self.error.is_none()
    }

    /// Record a successful output
    pub fn complete(&mut self, output: serde_json::Value) -> Result<()> {
        self.ensure_unfinished()?;
        self.output = Some(output);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failure
    pub fn fail(&mut self, error: &Error) -> Result<()> {
        self.ensure_unfinished()?;
        self.error = Some(ErrorRecord::from(error));
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Finish with whichever outcome the invocation produced
    pub fn finish(&mut self, outcome: &Result<serde_json::Value>) -> Result<()> {
        match outcome {
            Ok(output) => self.complete(output.clone()),
            Err(error) => self.fail(error),
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at.map(|ended| {
            ended
                .signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64
        })
    }

    fn ensure_unfinished(&self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::ToolCallAlreadyFinished {
                call_id: self.call_id.clone(),
            });
        }
        Ok(())
    }
}
