//! Child-process transport: newline-delimited JSON-RPC over stdin/stdout

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use runtime_core::{Error, Result};

use super::connection::ToolConnection;
use super::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse};

pub struct StdioConnection {
    provider_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioConnection {
    /// Spawn the provider process and complete the handshake
    pub async fn connect(
        provider_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        info!("Spawning provider {}: {} {:?}", provider_id, command, args);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::connection_failed(provider_id, format!("Failed to spawn {}: {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::connection_failed(provider_id, "Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::connection_failed(provider_id, "Failed to capture stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let provider = provider_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] stderr: {}", provider, line);
                }
            });
        }

        let mut connection = Self {
            provider_id: provider_id.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        };

        connection.handshake().await?;
        Ok(connection)
    }

    async fn handshake(&mut self) -> Result<()> {
        let response = self
            .request(jsonrpc::METHOD_INITIALIZE, jsonrpc::initialize_params())
            .await?;
        response
            .into_result()
            .map_err(|message| Error::connection_failed(&self.provider_id, message))?;

        self.send(&JsonRpcRequest::notification(jsonrpc::METHOD_INITIALIZED))
            .await
    }

    async fn send(&mut self, message: &JsonRpcRequest) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.write_failed(e))?;
        self.stdin.flush().await.map_err(|e| self.write_failed(e))
    }

    /// Send a request and read lines until its response arrives.
    ///
    /// Notifications and responses to abandoned requests are skipped.
    async fn request(&mut self, method: &str, params: Value) -> Result<JsonRpcResponse> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(&JsonRpcRequest::new(id, method, params)).await?;

        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| {
                    Error::connection_failed(&self.provider_id, format!("Read failed: {}", e))
                })?
                .ok_or_else(|| {
                    Error::connection_failed(&self.provider_id, "Provider closed its output")
                })?;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(response) if response.has_id(id) => return Ok(response),
                Ok(_) => debug!("[{}] skipping unrelated message", self.provider_id),
                Err(_) => debug!("[{}] skipping non-JSON line: {}", self.provider_id, trimmed),
            }
        }
    }

    fn write_failed(&self, e: std::io::Error) -> Error {
        Error::connection_failed(&self.provider_id, format!("Write failed: {}", e))
    }
}

#[async_trait]
impl ToolConnection for StdioConnection {
    async fn call_tool(&mut self, tool: &str, input: Value) -> Result<Value> {
        let response = self
            .request(jsonrpc::METHOD_TOOLS_CALL, jsonrpc::tool_call_params(tool, input))
            .await?;
        jsonrpc::tool_output(tool, response)
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.stdin.shutdown().await;

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Provider {} already exited: {}", self.provider_id, status);
                Ok(())
            }
            _ => self.child.kill().await.map_err(|e| {
                warn!("Failed to kill provider {}: {}", self.provider_id, e);
                Error::connection_failed(&self.provider_id, format!("Failed to stop process: {}", e))
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    /// A shell provider that answers the handshake, then echoes one tool result
    /// after emitting a notification and a response for a stale id.
    const SCRIPT: &str = r#"
read init
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
read initialized
read call
echo 'not json at all'
echo '{"jsonrpc":"2.0","method":"notifications/progress","params":{}}'
echo '{"jsonrpc":"2.0","id":99,"result":{}}'
echo '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"pong"}]}}'
read rest
"#;

    fn script_args() -> Vec<String> {
        vec!["-c".to_string(), SCRIPT.to_string()]
    }

    #[tokio::test]
    async fn test_handshake_and_call() {
        let mut conn = StdioConnection::connect("sh", "sh", &script_args(), &HashMap::new(), None)
            .await
            .unwrap();

        let output = conn.call_tool("ping", json!({})).await.unwrap();
        assert_eq!(output["content"][0]["text"], "pong");

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connection_failed() {
        let result = StdioConnection::connect(
            "missing",
            "definitely-not-a-real-binary-xyz",
            &[],
            &HashMap::new(),
            None,
        )
        .await;

        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_provider_exit_during_handshake() {
        let args = vec!["-c".to_string(), "exit 0".to_string()];
        let result = StdioConnection::connect("quitter", "sh", &args, &HashMap::new(), None).await;
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    }
}
