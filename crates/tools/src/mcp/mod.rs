//! Model Context Protocol support.
//!
//! A configured server is reached over stdio or TCP, initialized, asked for
//! its tools, and each tool is wrapped as an [`McpTool`] in the registry.
//! The [`McpConnector`] seam lets the registry be driven by in-process
//! sessions in tests.

mod client;
mod tool;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_config::McpServerConfig;
use kestrel_security::CommandPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use client::{MCP_PROTOCOL_VERSION, McpClient};
pub use tool::{McpApprovals, McpTool};
pub use transport::{LineTransport, McpTransport};

#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("command refused: {0}")]
    CommandDenied(String),

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("initialize handshake failed: {0}")]
    Handshake(String),

    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("server disconnected")]
    Disconnected,

    #[error("invalid response: {0}")]
    Protocol(String),

    #[error("request cancelled")]
    Cancelled,
}

/// Connection lifecycle of one configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpServerStatus {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for McpServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        })
    }
}

/// A tool as listed by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// One block of a `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpCallResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl McpCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Text blocks joined by newlines. Non-text blocks become a placeholder.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                McpContent::Text { text } => text.as_str(),
                McpContent::Other => "[non-text content omitted]",
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An initialized connection to one server.
#[async_trait]
pub trait McpSession: Send + Sync {
    fn server_name(&self) -> &str;

    fn status(&self) -> McpServerStatus;

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpCallResult, McpError>;

    async fn close(&self);
}

/// Opens sessions for configured servers.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(
        &self,
        server_name: &str,
        config: &McpServerConfig,
    ) -> Result<Arc<dyn McpSession>, McpError>;
}

/// Connects over stdio or TCP and performs the initialize handshake.
pub struct TransportConnector {
    policy: CommandPolicy,
}

impl TransportConnector {
    pub fn new(policy: CommandPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl McpConnector for TransportConnector {
    async fn connect(
        &self,
        server_name: &str,
        config: &McpServerConfig,
    ) -> Result<Arc<dyn McpSession>, McpError> {
        let transport = match (&config.command, &config.tcp) {
            (Some(_), _) => LineTransport::spawn_stdio(server_name, config, &self.policy)?,
            (None, Some(address)) => {
                LineTransport::connect_tcp(server_name, address, Duration::from_millis(config.timeout_ms))
                    .await?
            }
            (None, None) => {
                return Err(McpError::Connection(
                    "neither 'command' nor 'tcp' is configured".into(),
                ));
            }
        };

        let client = McpClient::new(server_name, Arc::new(transport));
        if let Err(e) = client.initialize().await {
            client.close().await;
            return Err(e);
        }
        Ok(Arc::new(client))
    }
}
