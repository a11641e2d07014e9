//! Read file tool: read file contents, optionally a line range.

use std::sync::Arc;

use async_trait::async_trait;
use kestrel_core::{Tool, ToolError, ToolResult, schema};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::ToolContext;

pub const READ_FILE_TOOL_NAME: &str = "read_file";

/// Files larger than this are refused.
const MAX_FILE_BYTES: u64 = 20 * 1024 * 1024;

pub struct ReadFileTool {
    ctx: Arc<ToolContext>,
}

impl ReadFileTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

fn non_negative(params: &Value, key: &str) -> Result<Option<usize>, ToolError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| ToolError::InvalidArguments(format!("{key} must be a non-negative integer"))),
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        READ_FILE_TOOL_NAME
    }

    fn display_name(&self) -> &str {
        "ReadFile"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. For text files a line range can be selected \
         with 'offset' (0-based first line) and 'limit' (number of lines)."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "absolute_path": {
                    "type": "string",
                    "description": "Absolute path of the file to read"
                },
                "offset": {
                    "type": "number",
                    "description": "0-based line number to start reading from"
                },
                "limit": {
                    "type": "number",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["absolute_path"]
        })
    }

    fn validate_params(&self, params: &Value) -> Result<(), ToolError> {
        schema::validate(&self.parameter_schema(), params).map_err(ToolError::InvalidArguments)?;
        non_negative(params, "offset")?;
        if non_negative(params, "limit")? == Some(0) {
            return Err(ToolError::InvalidArguments("limit must be greater than 0".into()));
        }
        let path = params["absolute_path"].as_str().unwrap_or_default();
        self.ctx.check_path(path)?;
        Ok(())
    }

    fn get_description(&self, params: &Value) -> String {
        let path = params["absolute_path"].as_str().unwrap_or_default();
        self.ctx.display_path(std::path::Path::new(path)).into_owned()
    }

    async fn execute(&self, params: Value, cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(READ_FILE_TOOL_NAME.into()));
        }
        let path = params["absolute_path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'absolute_path' argument".into()))?;
        let resolved = self.ctx.check_path(path)?;
        let offset = non_negative(&params, "offset")?.unwrap_or(0);
        let limit = non_negative(&params, "limit")?;

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| ToolError::failed(READ_FILE_TOOL_NAME, format!("cannot read '{path}': {e}")))?;
        if metadata.is_dir() {
            return Err(ToolError::failed(READ_FILE_TOOL_NAME, format!("'{path}' is a directory")));
        }
        if metadata.len() > MAX_FILE_BYTES {
            return Err(ToolError::failed(
                READ_FILE_TOOL_NAME,
                format!("'{path}' is larger than {MAX_FILE_BYTES} bytes"),
            ));
        }

        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| ToolError::failed(READ_FILE_TOOL_NAME, format!("cannot read '{path}': {e}")))?;
        let Ok(content) = String::from_utf8(bytes) else {
            return Ok(ToolResult::new(
                format!("Cannot display content of binary file: {path}"),
                "Skipped binary file",
            ));
        };

        if offset == 0 && limit.is_none() {
            let total = content.lines().count();
            debug!(path = %resolved.display(), lines = total, "Read file");
            return Ok(ToolResult::new(content, format!("Read {total} lines")));
        }

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        let start = offset.min(total);
        let end = limit.map_or(total, |l| (start + l).min(total));
        let selected = lines[start..end].join("\n");
        let llm_content = if start > 0 || end < total {
            format!(
                "[File content truncated: showing lines {}-{} of {total} total lines]\n{selected}",
                start + 1,
                end
            )
        } else {
            selected
        };
        Ok(ToolResult::new(
            llm_content,
            format!("Read lines {}-{} of {total}", start + 1, end),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, ReadFileTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(Arc::new(ToolContext::new(dir.path())));
        (dir, tool)
    }

    #[test]
    fn tool_definition() {
        let (_dir, tool) = setup();
        assert_eq!(tool.name(), "read_file");
        let schema = tool.parameter_schema();
        assert_eq!(schema["required"], json!(["absolute_path"]));
    }

    #[test]
    fn validation_rules() {
        let (dir, tool) = setup();
        let inside = dir.path().join("a.txt");
        let inside = inside.to_str().unwrap();
        assert!(tool.validate_params(&json!({ "absolute_path": inside })).is_ok());
        assert!(tool.validate_params(&json!({ "absolute_path": "a.txt" })).is_err());
        assert!(tool.validate_params(&json!({ "absolute_path": "/etc/passwd" })).is_err());
        assert!(tool.validate_params(&json!({ "absolute_path": inside, "offset": -1 })).is_err());
        assert!(tool.validate_params(&json!({ "absolute_path": inside, "limit": 0 })).is_err());
        assert!(tool.validate_params(&json!({})).is_err());
    }

    #[tokio::test]
    async fn read_existing_file() {
        let (dir, tool) = setup();
        let file_path = dir.path().join("test.txt");
        std::fs::write(&file_path, "Hello, world!\n").unwrap();

        let result = tool
            .execute(json!({ "absolute_path": file_path.to_str().unwrap() }), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.llm_content, "Hello, world!\n");
    }

    #[tokio::test]
    async fn read_line_range() {
        let (dir, tool) = setup();
        let file_path = dir.path().join("lines.txt");
        std::fs::write(&file_path, "one\ntwo\nthree\nfour\n").unwrap();

        let result = tool
            .execute(
                json!({ "absolute_path": file_path.to_str().unwrap(), "offset": 1, "limit": 2 }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.llm_content.ends_with("two\nthree"));
        assert!(result.llm_content.contains("lines 2-3 of 4"));
    }

    #[tokio::test]
    async fn read_nonexistent_file() {
        let (dir, tool) = setup();
        let missing = dir.path().join("missing.txt");
        let err = tool
            .execute(json!({ "absolute_path": missing.to_str().unwrap() }), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_blocked() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s3cret").unwrap();
        let (dir, tool) = setup();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(outside.path().join("secret"), &link).unwrap();

        let err = tool
            .execute(json!({ "absolute_path": link.to_str().unwrap() }), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
