//! Transport seams between the session manager and tool providers

use async_trait::async_trait;
use serde_json::Value;

use runtime_core::Result;

use super::http::HttpConnection;
use super::stdio::StdioConnection;
use crate::config::{ProviderConfig, ProviderTransport};

/// An established, handshaken connection to one provider.
///
/// Calls take `&mut self`; the session manager serializes access.
#[async_trait]
pub trait ToolConnection: Send {
    /// Invoke a tool and return its raw output
    async fn call_tool(&mut self, tool: &str, input: Value) -> Result<Value>;

    /// Release the underlying transport
    async fn close(&mut self) -> Result<()>;
}

/// Opens connections to providers
#[async_trait]
pub trait ToolConnector: Send + Sync {
    /// Connect and complete the handshake.
    ///
    /// Failures should be reported as `Error::ConnectionFailed`.
    async fn connect(
        &self,
        provider_id: &str,
        config: &ProviderConfig,
    ) -> Result<Box<dyn ToolConnection>>;
}

/// Connector for the built-in stdio and HTTP transports
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportConnector;

#[async_trait]
impl ToolConnector for TransportConnector {
    async fn connect(
        &self,
        provider_id: &str,
        config: &ProviderConfig,
    ) -> Result<Box<dyn ToolConnection>> {
        match &config.transport {
            ProviderTransport::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let connection =
                    StdioConnection::connect(provider_id, command, args, env, cwd.as_deref())
                        .await?;
                Ok(Box::new(connection))
            }
            ProviderTransport::Http { url, headers } => {
                let connection = HttpConnection::connect(provider_id, url, headers).await?;
                Ok(Box::new(connection))
            }
        }
    }
}
