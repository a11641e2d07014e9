//! Shell tool: execute a command line through `sh -c`.
//!
//! Every invocation asks for confirmation unless it is a single command whose
//! program was approved "always" earlier in the session, or the session runs
//! in yolo mode and the whole line passes the command policy.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kestrel_core::{
    ApprovalMode, ConfirmationDetails, ConfirmationKind, ConfirmationOutcome, Tool, ToolError,
    ToolResult, schema,
};
use kestrel_security::{CommandCheck, is_single_command, program_basename};
use serde_json::{Value, json};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::ToolContext;

pub const SHELL_TOOL_NAME: &str = "run_shell_command";

pub struct ShellTool {
    ctx: Arc<ToolContext>,
    /// Root programs approved for the rest of the session.
    always_allowed: Mutex<BTreeSet<String>>,
}

impl ShellTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self {
            ctx,
            always_allowed: Mutex::new(BTreeSet::new()),
        }
    }

    fn working_dir(&self, params: &Value) -> Result<PathBuf, ToolError> {
        match params["directory"].as_str() {
            None => Ok(self.ctx.target_dir.clone()),
            Some(dir) => {
                let joined = self.ctx.target_dir.join(dir);
                let resolved = self.ctx.check_path(&joined.to_string_lossy())?;
                if !resolved.is_dir() {
                    return Err(ToolError::InvalidArguments(format!(
                        "directory '{dir}' does not exist"
                    )));
                }
                Ok(resolved)
            }
        }
    }

    fn is_always_allowed(&self, root: &str) -> bool {
        self.always_allowed
            .lock()
            .map(|set| set.contains(root))
            .unwrap_or(false)
    }
}

/// The program a command line starts with, without its directory.
pub fn root_command(command: &str) -> Option<String> {
    let first = match shlex::split(command) {
        Some(argv) => argv.into_iter().next(),
        None => command.split_whitespace().next().map(str::to_string),
    }?;
    Some(program_basename(&first).to_string())
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        SHELL_TOOL_NAME
    }

    fn display_name(&self) -> &str {
        "Shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command with `sh -c` and return its stdout, stderr and exit code. \
         Use this for running programs, checking files, git operations, etc."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to execute"
                },
                "description": {
                    "type": "string",
                    "description": "Brief description of the command for the user"
                },
                "directory": {
                    "type": "string",
                    "description": "Directory to run in, relative to the project root"
                }
            },
            "required": ["command"]
        })
    }

    fn validate_params(&self, params: &Value) -> Result<(), ToolError> {
        schema::validate(&self.parameter_schema(), params).map_err(ToolError::InvalidArguments)?;
        let command = params["command"].as_str().unwrap_or_default();
        if command.trim().is_empty() {
            return Err(ToolError::InvalidArguments("command cannot be empty".into()));
        }
        if root_command(command).is_none() {
            return Err(ToolError::InvalidArguments(
                "could not identify the command's root program".into(),
            ));
        }
        if let Some(dir) = params["directory"].as_str()
            && std::path::Path::new(dir).is_absolute()
        {
            return Err(ToolError::InvalidArguments(
                "directory must be relative to the project root".into(),
            ));
        }
        Ok(())
    }

    fn get_description(&self, params: &Value) -> String {
        let command = params["command"].as_str().unwrap_or_default();
        let mut out = command.to_string();
        if let Some(dir) = params["directory"].as_str() {
            out.push_str(&format!(" [in {dir}]"));
        }
        if let Some(description) = params["description"].as_str() {
            out.push_str(&format!(" ({})", description.replace('\n', " ")));
        }
        out
    }

    async fn should_confirm_execute(
        &self,
        params: &Value,
        _cancel: &CancellationToken,
    ) -> Result<Option<ConfirmationDetails>, ToolError> {
        let command = params["command"].as_str().unwrap_or_default();
        let root = root_command(command).unwrap_or_default();

        // "always" covers the approved program, never a line chaining others
        if is_single_command(command) && self.is_always_allowed(&root) {
            return Ok(None);
        }
        if self.ctx.approval_mode == ApprovalMode::Yolo
            && matches!(self.ctx.policy.check(command), CommandCheck::Allowed { .. })
        {
            return Ok(None);
        }

        Ok(Some(ConfirmationDetails {
            title: "Confirm Shell Command".into(),
            kind: ConfirmationKind::Exec {
                command: command.to_string(),
                root_command: root,
            },
        }))
    }

    fn on_confirmed(&self, params: &Value, outcome: ConfirmationOutcome) {
        if outcome == ConfirmationOutcome::ProceedAlways
            && let Some(root) = params["command"].as_str().and_then(root_command)
            && let Ok(mut set) = self.always_allowed.lock()
        {
            set.insert(root);
        }
    }

    async fn execute(&self, params: Value, cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(SHELL_TOOL_NAME.into()));
        }
        let command = params["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;
        let cwd = self.working_dir(&params)?;

        debug!(command = %command, cwd = %cwd.display(), "Executing shell command");

        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::failed(SHELL_TOOL_NAME, e.to_string()))?;

        // Dropping the wait future kills the child.
        let output = tokio::select! {
            out = child.wait_with_output() => {
                out.map_err(|e| ToolError::failed(SHELL_TOOL_NAME, e.to_string()))?
            }
            _ = cancel.cancelled() => {
                warn!(command = %command, "Shell command cancelled");
                return Err(ToolError::Cancelled(SHELL_TOOL_NAME.into()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code();
        if !output.status.success() {
            warn!(command = %command, exit_code = ?exit_code, "Command failed");
        }

        let llm_content = format!(
            "Command: {command}\nDirectory: {}\nStdout: {}\nStderr: {}\nExit Code: {}",
            self.ctx.display_path(&cwd),
            if stdout.is_empty() { "(empty)" } else { &stdout },
            if stderr.is_empty() { "(empty)" } else { &stderr },
            exit_code.map_or_else(|| "(none)".to_string(), |c| c.to_string()),
        );
        let return_display = if !stdout.is_empty() {
            stdout
        } else if !stderr.is_empty() {
            stderr
        } else if output.status.success() {
            "Command completed with no output.".into()
        } else {
            format!("Command exited with code {}", exit_code.unwrap_or(-1))
        };
        Ok(ToolResult::new(llm_content, return_display))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(dir: &std::path::Path, mode: ApprovalMode) -> ShellTool {
        ShellTool::new(Arc::new(ToolContext::new(dir).with_approval_mode(mode)))
    }

    #[test]
    fn root_command_extraction() {
        assert_eq!(root_command("ls -la").as_deref(), Some("ls"));
        assert_eq!(root_command("/usr/bin/git status").as_deref(), Some("git"));
        assert_eq!(root_command("   ").as_deref(), None);
    }

    #[test]
    fn validation_rejects_empty_and_absolute_dir() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path(), ApprovalMode::Default);
        assert!(t.validate_params(&json!({ "command": "  " })).is_err());
        assert!(t.validate_params(&json!({ "command": "ls", "directory": "/etc" })).is_err());
        assert!(t.validate_params(&json!({ "command": "ls" })).is_ok());
    }

    #[tokio::test]
    async fn confirmation_required_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path(), ApprovalMode::Default);
        let details = t
            .should_confirm_execute(&json!({ "command": "git status" }), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        match details.kind {
            ConfirmationKind::Exec { root_command, .. } => assert_eq!(root_command, "git"),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[tokio::test]
    async fn yolo_skips_confirmation_only_for_policy_clean_lines() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path(), ApprovalMode::Yolo);
        let cancel = CancellationToken::new();
        assert!(t.should_confirm_execute(&json!({ "command": "ls -la" }), &cancel).await.unwrap().is_none());
        assert!(t.should_confirm_execute(&json!({ "command": "ls; rm -rf x" }), &cancel).await.unwrap().is_some());
        assert!(t.should_confirm_execute(&json!({ "command": "curl example.com" }), &cancel).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn always_approval_covers_root_program() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path(), ApprovalMode::Default);
        t.on_confirmed(&json!({ "command": "git status" }), ConfirmationOutcome::ProceedOnce);
        let cancel = CancellationToken::new();
        assert!(t.should_confirm_execute(&json!({ "command": "git log" }), &cancel).await.unwrap().is_some());
        t.on_confirmed(&json!({ "command": "git status" }), ConfirmationOutcome::ProceedAlways);
        assert!(t.should_confirm_execute(&json!({ "command": "git log" }), &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn always_approval_does_not_cover_chained_programs() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path(), ApprovalMode::Default);
        t.on_confirmed(&json!({ "command": "git status" }), ConfirmationOutcome::ProceedAlways);
        let cancel = CancellationToken::new();

        for line in [
            "git status; rm -rf ./important",
            "git status && rm -rf ./important",
            "git log | sh",
            "git $(rm -rf ./important)",
        ] {
            let details = t.should_confirm_execute(&json!({ "command": line }), &cancel).await.unwrap();
            match details.map(|d| d.kind) {
                Some(ConfirmationKind::Exec { command, .. }) => assert_eq!(command, line),
                other => panic!("expected an Exec confirmation for {line:?}, got {other:?}"),
            }
        }
        // quoted metacharacters are still one command
        assert!(t.should_confirm_execute(&json!({ "command": "git commit -m 'a; b'" }), &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execute_echo_in_target_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let t = tool(dir.path(), ApprovalMode::Default);
        let result = t
            .execute(json!({ "command": "echo hello && pwd", "directory": "sub" }), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.llm_content.contains("hello"));
        assert!(result.llm_content.contains("Exit Code: 0"));
        assert!(result.return_display.ends_with("sub"));
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path(), ApprovalMode::Default);
        let result = t
            .execute(json!({ "command": "echo oops >&2; exit 3" }), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.llm_content.contains("Stderr: oops"));
        assert!(result.llm_content.contains("Exit Code: 3"));
    }

    #[tokio::test]
    async fn cancellation_stops_long_command() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path(), ApprovalMode::Default);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = t.execute(json!({ "command": "sleep 5" }), cancel).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled(_)));
    }
}
