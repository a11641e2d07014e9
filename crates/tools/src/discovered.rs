//! Tools found by running a project's discovery command.
//!
//! The discovery command prints a JSON array of
//! `{"function_declarations": [...]}` wrappers. Each declaration becomes a
//! [`SubprocessTool`] that runs `<call_command> <tool_name>` with the JSON
//! arguments on stdin and returns its stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::{FunctionDeclaration, Tool, ToolError, ToolKind, ToolResult};
use kestrel_security::{CommandCheck, CommandPolicy};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Discovery commands that run longer than this are abandoned.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery command refused: {0}")]
    CommandDenied(String),

    #[error("failed to run discovery command '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("discovery command timed out after {0:?}")]
    Timeout(Duration),

    #[error("discovery command exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("invalid discovery output: {0}")]
    InvalidOutput(String),
}

/// One element of the discovery array. Unknown keys are an error.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiscoveryEntry {
    function_declarations: Vec<FunctionDeclaration>,
}

/// Parse discovery stdout into declarations.
pub fn parse_declarations(stdout: &str) -> Result<Vec<FunctionDeclaration>, DiscoveryError> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| DiscoveryError::InvalidOutput(format!("not JSON: {e}")))?;
    if !value.is_array() {
        return Err(DiscoveryError::InvalidOutput(
            "expected a JSON array of {\"function_declarations\": [...]} objects".into(),
        ));
    }
    let entries: Vec<DiscoveryEntry> = serde_json::from_value(value)
        .map_err(|e| DiscoveryError::InvalidOutput(e.to_string()))?;

    Ok(entries
        .into_iter()
        .flat_map(|entry| entry.function_declarations)
        .collect())
}

/// Vet a configured command line and split it into argv.
fn vet(policy: &CommandPolicy, command: &str) -> Result<Vec<String>, String> {
    match policy.check(command) {
        CommandCheck::Allowed { argv } => Ok(argv),
        CommandCheck::Denied { reason } => Err(reason),
    }
}

/// Run the discovery command and parse what it prints.
pub async fn run_discovery(
    command: &str,
    policy: &CommandPolicy,
    cwd: &std::path::Path,
    timeout: Duration,
) -> Result<Vec<FunctionDeclaration>, DiscoveryError> {
    let argv = vet(policy, command).map_err(DiscoveryError::CommandDenied)?;
    debug!(command = %command, "Running tool discovery");

    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DiscoveryError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| DiscoveryError::Timeout(timeout))?
        .map_err(|e| DiscoveryError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(DiscoveryError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let declarations = parse_declarations(&String::from_utf8_lossy(&output.stdout))?;
    info!(count = declarations.len(), "Discovered subprocess tools");
    Ok(declarations)
}

/// A declaration whose calls are served by the project's call command.
pub struct SubprocessTool {
    declaration: FunctionDeclaration,
    /// Vetted argv of the call command; the tool name is appended.
    call_argv: Vec<String>,
    cwd: PathBuf,
}

impl SubprocessTool {
    /// Fails when the call command does not pass `policy`.
    pub fn new(
        declaration: FunctionDeclaration,
        call_command: &str,
        policy: &CommandPolicy,
        cwd: impl Into<PathBuf>,
    ) -> Result<Self, String> {
        Ok(Self {
            declaration,
            call_argv: vet(policy, call_command)?,
            cwd: cwd.into(),
        })
    }
}

#[async_trait]
impl Tool for SubprocessTool {
    fn name(&self) -> &str {
        &self.declaration.name
    }

    fn description(&self) -> &str {
        &self.declaration.description
    }

    fn parameter_schema(&self) -> Value {
        self.declaration
            .parameters
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} }))
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Subprocess
    }

    async fn execute(&self, params: Value, cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        let name = self.name();
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(name.to_string()));
        }
        let input =
            serde_json::to_vec(&params).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let mut child = Command::new(&self.call_argv[0])
            .args(&self.call_argv[1..])
            .arg(name)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::failed(name, format!("failed to spawn call command: {e}")))?;

        // Feeding stdin runs alongside the wait so a child that never
        // drains the pipe cannot hold off cancellation.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin
                && let Err(e) = stdin.write_all(&input).await
            {
                debug!(tool = %name, error = %e, "Call command did not read stdin");
            }
        };
        let run = async {
            let ((), out) = tokio::join!(feed, child.wait_with_output());
            out
        };

        let output = tokio::select! {
            out = run => {
                out.map_err(|e| ToolError::failed(name, e.to_string()))?
            }
            _ = cancel.cancelled() => {
                warn!(tool = %name, "Subprocess tool cancelled");
                return Err(ToolError::Cancelled(name.to_string()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output
                .status
                .code()
                .map_or_else(|| "(none)".to_string(), |c| c.to_string());
            return Err(ToolError::failed(
                name,
                format!("Stderr: {stderr}\nExit Code: {code}"),
            ));
        }
        Ok(ToolResult::text(stdout))
    }
}
