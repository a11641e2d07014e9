//! MCP client: handshake, tool listing and tool calls over a transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{McpCallResult, McpError, McpServerStatus, McpSession, McpToolInfo, McpTransport};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on `tools/list` pages followed.
const MAX_LIST_PAGES: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpToolInfo>,
    #[serde(default)]
    next_cursor: Option<String>,
}

pub struct McpClient {
    server_name: String,
    transport: Arc<dyn McpTransport>,
    status: Mutex<McpServerStatus>,
}

impl McpClient {
    pub fn new(server_name: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            server_name: server_name.into(),
            transport,
            status: Mutex::new(McpServerStatus::Disconnected),
        }
    }

    fn set_status(&self, status: McpServerStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    /// `initialize` followed by `notifications/initialized`.
    pub async fn initialize(&self) -> Result<(), McpError> {
        self.set_status(McpServerStatus::Connecting);
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "kestrel",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = match self
            .transport
            .request("initialize", Some(params), &CancellationToken::new())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.set_status(McpServerStatus::Disconnected);
                return Err(McpError::Handshake(e.to_string()));
            }
        };
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            self.set_status(McpServerStatus::Disconnected);
            McpError::Handshake(format!("malformed initialize result: {e}"))
        })?;

        if let Some(version) = &init.protocol_version
            && version != MCP_PROTOCOL_VERSION
        {
            warn!(server = %self.server_name, version = %version, "Server negotiated a different protocol version");
        }
        if let Some(info) = &init.server_info {
            info!(
                server = %self.server_name,
                name = %info.name,
                version = info.version.as_deref().unwrap_or("unknown"),
                "MCP server initialized"
            );
        }

        self.transport.notify("notifications/initialized", None).await?;
        self.set_status(McpServerStatus::Connected);
        Ok(())
    }
}

#[async_trait]
impl McpSession for McpClient {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn status(&self) -> McpServerStatus {
        if !self.transport.is_connected() {
            return McpServerStatus::Disconnected;
        }
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(McpServerStatus::Disconnected)
    }

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let cancel = CancellationToken::new();
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.transport.request("tools/list", params, &cancel).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| McpError::Protocol(format!("tools/list: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(server = %self.server_name, count = tools.len(), "Listed MCP tools");
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpCallResult, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.transport.request("tools/call", Some(params), cancel).await?;
        serde_json::from_value(result).map_err(|e| McpError::Protocol(format!("tools/call: {e}")))
    }

    async fn close(&self) {
        self.set_status(McpServerStatus::Closing);
        self.transport.close().await;
        self.set_status(McpServerStatus::Disconnected);
        debug!(server = %self.server_name, "MCP session closed");
    }
}
