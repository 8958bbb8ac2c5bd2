//! HTTP transport: JSON-RPC requests POSTed to a provider endpoint

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use runtime_core::{Error, Result};

use super::connection::ToolConnection;
use super::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse};

/// Header carrying the provider-assigned session id
const SESSION_HEADER: &str = "mcp-session-id";

pub struct HttpConnection {
    provider_id: String,
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: Option<String>,
    next_id: u64,
}

impl HttpConnection {
    /// Perform the handshake against `url`
    pub async fn connect(
        provider_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self> {
        info!("Connecting to provider {} at {}", provider_id, url);

        let client = Client::builder()
            .build()
            .map_err(|e| Error::connection_failed(provider_id, format!("HTTP client: {}", e)))?;

        let mut connection = Self {
            provider_id: provider_id.to_string(),
            client,
            url: url.to_string(),
            headers: headers.clone(),
            session_id: None,
            next_id: 0,
        };

        let response = connection
            .request(jsonrpc::METHOD_INITIALIZE, jsonrpc::initialize_params())
            .await?;
        response
            .into_result()
            .map_err(|message| Error::connection_failed(provider_id, message))?;

        connection
            .post(&JsonRpcRequest::notification(jsonrpc::METHOD_INITIALIZED))
            .await?;

        Ok(connection)
    }

    async fn post(&mut self, body: &JsonRpcRequest) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header("accept", "application/json, text/event-stream")
            .json(body);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id.as_str());
        }

        let response = request.send().await.map_err(|e| {
            Error::connection_failed(&self.provider_id, format!("Request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::connection_failed(
                &self.provider_id,
                format!("Provider returned {}: {}", status, text),
            ));
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if self.session_id.as_deref() != Some(session_id) {
                debug!("Provider {} assigned session {}", self.provider_id, session_id);
                self.session_id = Some(session_id.to_string());
            }
        }

        Ok(response)
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<JsonRpcResponse> {
        self.next_id += 1;
        let id = self.next_id;
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let is_stream = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let body = response.text().await.map_err(|e| {
            Error::connection_failed(&self.provider_id, format!("Failed to read body: {}", e))
        })?;

        let parsed = if is_stream {
            find_in_event_stream(&body, id)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body).ok()
        };

        parsed.ok_or_else(|| {
            Error::connection_failed(&self.provider_id, format!("No response for request {}", id))
        })
    }
}

/// Pick the response with `id` out of a `text/event-stream` body
fn find_in_event_stream(body: &str, id: u64) -> Option<JsonRpcResponse> {
    body.lines()
        .filter_map(|line| line.trim().strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
        .find(|response| response.has_id(id))
}

#[async_trait]
impl ToolConnection for HttpConnection {
    async fn call_tool(&mut self, tool: &str, input: Value) -> Result<Value> {
        let response = self
            .request(jsonrpc::METHOD_TOOLS_CALL, jsonrpc::tool_call_params(tool, input))
            .await?;
        jsonrpc::tool_output(tool, response)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };

        // Providers that do not track sessions may reject the DELETE
        match self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session_id.as_str())
            .send()
            .await
        {
            Ok(response) => {
                debug!("Provider {} session closed: {}", self.provider_id, response.status());
                Ok(())
            }
            Err(e) => Err(Error::connection_failed(
                &self.provider_id,
                format!("Failed to close session: {}", e),
            )),
        }
    }
}
