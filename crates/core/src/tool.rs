//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the model the ability to act in the world: read and
//! write files, run shell commands, call discovered programs or MCP servers.
//! Every tool self-declares whether an invocation needs user confirmation;
//! the agent turn never executes a gated call before it is approved.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::generator::FunctionDeclaration;
use crate::schema;

/// Where a tool's implementation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Compiled into the binary.
    Native,
    /// Found by running the configured discovery command.
    Subprocess,
    /// Served by an MCP server.
    Mcp,
}

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Fed back to the model.
    pub llm_content: String,

    /// Shown to the user.
    pub return_display: String,
}

impl ToolResult {
    pub fn new(llm_content: impl Into<String>, return_display: impl Into<String>) -> Self {
        Self {
            llm_content: llm_content.into(),
            return_display: return_display.into(),
        }
    }

    /// A result that shows the user the same text the model receives.
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            return_display: content.clone(),
            llm_content: content,
        }
    }
}

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfirmationKind {
    /// Run a command line.
    Exec {
        command: String,
        root_command: String,
    },
    /// Modify a file.
    Edit {
        file_path: String,
        original: Option<String>,
        proposed: String,
    },
    /// Call a tool on an MCP server.
    Mcp {
        server_name: String,
        tool_name: String,
        tool_display_name: String,
    },
    /// Generic prompt.
    Info { prompt: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationDetails {
    pub title: String,
    pub kind: ConfirmationKind,
}

/// The user's answer to a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    ProceedOnce,
    /// Approve this kind of call for the rest of the session.
    ProceedAlways,
    /// Approve every tool of the same MCP server.
    ProceedAlwaysServer,
    /// Approve this MCP tool.
    ProceedAlwaysTool,
    Cancel,
}

impl ConfirmationOutcome {
    pub fn is_approved(self) -> bool {
        !matches!(self, Self::Cancel)
    }
}

/// Session-wide policy for confirmation prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Ask for every gated call.
    #[default]
    Default,
    /// File edits are pre-approved; everything else asks.
    AutoEdit,
    /// Never ask.
    Yolo,
}

/// The core Tool trait.
///
/// Native, subprocess and MCP tools all implement it; the registry and the
/// agent turn only ever see `Arc<dyn Tool>`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "read_file").
    fn name(&self) -> &str;

    /// A name for humans.
    fn display_name(&self) -> &str {
        self.name()
    }

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameter_schema(&self) -> Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Native
    }

    /// Check parameters before any confirmation or execution.
    ///
    /// The default checks the parameter schema. Tools with semantic rules
    /// (paths, ranges) override this and call [`schema::validate`] first.
    fn validate_params(&self, params: &Value) -> Result<(), ToolError> {
        schema::validate(&self.parameter_schema(), params).map_err(ToolError::InvalidArguments)
    }

    /// One-line summary of what an invocation will do.
    fn get_description(&self, params: &Value) -> String {
        format!("{} {}", self.display_name(), params)
    }

    /// `Some(details)` when the invocation must be approved first.
    async fn should_confirm_execute(
        &self,
        _params: &Value,
        _cancel: &CancellationToken,
    ) -> Result<Option<ConfirmationDetails>, ToolError> {
        Ok(None)
    }

    /// Record an approval so matching calls skip confirmation later.
    fn on_confirmed(&self, _params: &Value, _outcome: ConfirmationOutcome) {}

    /// Execute the tool. Returns `ToolError::Cancelled` without side effects
    /// when `cancel` has already fired.
    async fn execute(&self, params: Value, cancel: CancellationToken)
        -> Result<ToolResult, ToolError>;

    /// Convert this tool into a declaration for the model.
    fn to_declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: Some(self.parameter_schema()),
        }
    }
}
