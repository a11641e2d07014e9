//! Write file tool: create or overwrite a file inside the target dir.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kestrel_core::{
    ApprovalMode, ConfirmationDetails, ConfirmationKind, ConfirmationOutcome, Tool, ToolError,
    ToolResult, schema,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::ToolContext;

pub const WRITE_FILE_TOOL_NAME: &str = "write_file";

pub struct WriteFileTool {
    ctx: Arc<ToolContext>,
    always_approved: AtomicBool,
}

impl WriteFileTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self {
            ctx,
            always_approved: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        WRITE_FILE_TOOL_NAME
    }

    fn display_name(&self) -> &str {
        "WriteFile"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file (and missing parent directories) \
         if it doesn't exist, overwrites it if it does."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["file_path", "content"]
        })
    }

    fn validate_params(&self, params: &Value) -> Result<(), ToolError> {
        schema::validate(&self.parameter_schema(), params).map_err(ToolError::InvalidArguments)?;
        let path = self.ctx.check_path(params["file_path"].as_str().unwrap_or_default())?;
        if path.is_dir() {
            return Err(ToolError::InvalidArguments(format!(
                "'{}' is a directory",
                path.display()
            )));
        }
        Ok(())
    }

    fn get_description(&self, params: &Value) -> String {
        let path = params["file_path"].as_str().unwrap_or_default();
        format!("Writing to {}", self.ctx.display_path(std::path::Path::new(path)))
    }

    async fn should_confirm_execute(
        &self,
        params: &Value,
        _cancel: &CancellationToken,
    ) -> Result<Option<ConfirmationDetails>, ToolError> {
        if self.ctx.approval_mode != ApprovalMode::Default
            || self.always_approved.load(Ordering::Relaxed)
        {
            return Ok(None);
        }

        let path = self.ctx.check_path(params["file_path"].as_str().unwrap_or_default())?;
        let original = tokio::fs::read_to_string(&path).await.ok();
        Ok(Some(ConfirmationDetails {
            title: format!("Confirm Write: {}", self.ctx.display_path(&path)),
            kind: ConfirmationKind::Edit {
                file_path: path.to_string_lossy().into_owned(),
                original,
                proposed: params["content"].as_str().unwrap_or_default().to_string(),
            },
        }))
    }

    fn on_confirmed(&self, _params: &Value, outcome: ConfirmationOutcome) {
        if outcome == ConfirmationOutcome::ProceedAlways {
            self.always_approved.store(true, Ordering::Relaxed);
        }
    }

    async fn execute(&self, params: Value, cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(WRITE_FILE_TOOL_NAME.into()));
        }
        let path = params["file_path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'file_path' argument".into()))?;
        let content = params["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;
        let resolved = self.ctx.check_path(path)?;

        let existed = tokio::fs::try_exists(&resolved).await.unwrap_or(false);
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::failed(WRITE_FILE_TOOL_NAME, format!("failed to create directory: {e}"))
            })?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::failed(WRITE_FILE_TOOL_NAME, format!("failed to write file: {e}")))?;

        info!(path = %resolved.display(), bytes = content.len(), "File written");
        let llm_content = if existed {
            format!("Successfully overwrote file: {path}")
        } else {
            format!("Successfully created and wrote to new file: {path}")
        };
        Ok(ToolResult::new(
            llm_content,
            format!("Wrote {} bytes to {}", content.len(), self.ctx.display_path(&resolved)),
        ))
    }
}
