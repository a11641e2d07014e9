//! A server tool exposed through the `Tool` trait.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kestrel_core::{
    ApprovalMode, ConfirmationDetails, ConfirmationKind, ConfirmationOutcome, Tool, ToolError,
    ToolKind, ToolResult,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{McpError, McpSession, McpToolInfo};

/// Session-wide MCP approvals, keyed `server` or `server.tool`.
#[derive(Debug, Default)]
pub struct McpApprovals(Mutex<HashSet<String>>);

impl McpApprovals {
    pub fn allows(&self, server: &str, tool: &str) -> bool {
        self.0
            .lock()
            .map(|set| set.contains(server) || set.contains(&format!("{server}.{tool}")))
            .unwrap_or(false)
    }

    pub fn allow_server(&self, server: &str) {
        if let Ok(mut set) = self.0.lock() {
            set.insert(server.to_string());
        }
    }

    pub fn allow_tool(&self, server: &str, tool: &str) {
        if let Ok(mut set) = self.0.lock() {
            set.insert(format!("{server}.{tool}"));
        }
    }
}

pub struct McpTool {
    /// Name the model sees; may differ from the server's after sanitizing.
    name: String,
    server_tool_name: String,
    description: String,
    schema: Value,
    session: Arc<dyn McpSession>,
    trusted: bool,
    approval_mode: ApprovalMode,
    approvals: Arc<McpApprovals>,
}

impl McpTool {
    pub fn new(
        name: impl Into<String>,
        info: McpToolInfo,
        session: Arc<dyn McpSession>,
        approvals: Arc<McpApprovals>,
    ) -> Self {
        Self {
            name: name.into(),
            description: info.description.unwrap_or_default(),
            server_tool_name: info.name,
            schema: info.input_schema,
            session,
            trusted: false,
            approval_mode: ApprovalMode::Default,
            approvals,
        }
    }

    pub fn trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn server_name(&self) -> &str {
        self.session.server_name()
    }

    pub fn server_tool_name(&self) -> &str {
        &self.server_tool_name
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.server_tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameter_schema(&self) -> Value {
        self.schema.clone()
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Mcp
    }

    fn get_description(&self, params: &Value) -> String {
        format!("{} ({} MCP server) {params}", self.server_tool_name, self.server_name())
    }

    async fn should_confirm_execute(
        &self,
        _params: &Value,
        _cancel: &CancellationToken,
    ) -> Result<Option<ConfirmationDetails>, ToolError> {
        if self.trusted
            || self.approval_mode == ApprovalMode::Yolo
            || self.approvals.allows(self.server_name(), &self.server_tool_name)
        {
            return Ok(None);
        }
        Ok(Some(ConfirmationDetails {
            title: "Confirm MCP Tool Execution".into(),
            kind: ConfirmationKind::Mcp {
                server_name: self.server_name().to_string(),
                tool_name: self.server_tool_name.clone(),
                tool_display_name: self.name.clone(),
            },
        }))
    }

    fn on_confirmed(&self, _params: &Value, outcome: ConfirmationOutcome) {
        match outcome {
            ConfirmationOutcome::ProceedAlwaysServer => self.approvals.allow_server(self.server_name()),
            ConfirmationOutcome::ProceedAlways | ConfirmationOutcome::ProceedAlwaysTool => {
                self.approvals.allow_tool(self.server_name(), &self.server_tool_name)
            }
            _ => {}
        }
    }

    async fn execute(&self, params: Value, cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(self.name.clone()));
        }
        debug!(server = %self.server_name(), tool = %self.server_tool_name, "Calling MCP tool");

        let result = self
            .session
            .call_tool(&self.server_tool_name, params, &cancel)
            .await
            .map_err(|e| match e {
                McpError::Cancelled => ToolError::Cancelled(self.name.clone()),
                McpError::Timeout { timeout_ms, .. } => ToolError::Timeout {
                    tool_name: self.name.clone(),
                    timeout_ms,
                },
                other => ToolError::Transport(format!("{}: {other}", self.server_name())),
            })?;

        let text = result.joined_text();
        if result.is_error {
            return Err(ToolError::failed(&self.name, text));
        }
        Ok(ToolResult::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{McpCallResult, McpServerStatus};
    use serde_json::json;

    struct FakeSession {
        reply: McpCallResult,
    }

    #[async_trait]
    impl McpSession for FakeSession {
        fn server_name(&self) -> &str {
            "docs"
        }
        fn status(&self) -> McpServerStatus {
            McpServerStatus::Connected
        }
        async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
            Ok(vec![])
        }
        async fn call_tool(
            &self,
            name: &str,
            arguments: Value,
            cancel: &CancellationToken,
        ) -> Result<McpCallResult, McpError> {
            if arguments["slow"] == true {
                cancel.cancelled().await;
                return Err(McpError::Cancelled);
            }
            assert_eq!(name, "search");
            Ok(self.reply.clone())
        }
        async fn close(&self) {}
    }

    fn tool(reply: McpCallResult, approvals: Arc<McpApprovals>) -> McpTool {
        let info = McpToolInfo {
            name: "search".into(),
            description: Some("Search docs".into()),
            input_schema: json!({ "type": "object" }),
        };
        McpTool::new("search", info, Arc::new(FakeSession { reply }), approvals)
    }

    #[tokio::test]
    async fn confirmation_and_always_approvals() {
        let approvals = Arc::new(McpApprovals::default());
        let t = tool(McpCallResult::text("ok"), approvals.clone());
        let cancel = CancellationToken::new();
        let details = t.should_confirm_execute(&json!({}), &cancel).await.unwrap().unwrap();
        assert!(matches!(details.kind, ConfirmationKind::Mcp { ref server_name, .. } if server_name == "docs"));

        t.on_confirmed(&json!({}), ConfirmationOutcome::ProceedOnce);
        assert!(t.should_confirm_execute(&json!({}), &cancel).await.unwrap().is_some());

        t.on_confirmed(&json!({}), ConfirmationOutcome::ProceedAlwaysServer);
        assert!(t.should_confirm_execute(&json!({}), &cancel).await.unwrap().is_none());
        assert!(approvals.allows("docs", "anything"));
    }

    #[tokio::test]
    async fn tool_level_approval_is_narrow() {
        let approvals = Arc::new(McpApprovals::default());
        let t = tool(McpCallResult::text("ok"), approvals.clone());
        t.on_confirmed(&json!({}), ConfirmationOutcome::ProceedAlwaysTool);
        assert!(approvals.allows("docs", "search"));
        assert!(!approvals.allows("docs", "delete"));
    }

    #[tokio::test]
    async fn trusted_server_skips_confirmation() {
        let t = tool(McpCallResult::text("ok"), Arc::default()).trusted(true);
        assert!(t.should_confirm_execute(&json!({}), &CancellationToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_results_become_failures() {
        let reply = McpCallResult { is_error: true, ..McpCallResult::text("bad query") };
        let err = tool(reply, Arc::default())
            .execute(json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad query"));
    }

    #[tokio::test]
    async fn cancellation_maps_to_cancelled() {
        let t = tool(McpCallResult::text("ok"), Arc::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = t.execute(json!({ "slow": true }), cancel).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled(_)));
    }
}
