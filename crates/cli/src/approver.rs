//! Terminal approval prompts for gated tool calls.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_agent::{Approver, PendingToolCall};
use kestrel_core::{ConfirmationKind, ConfirmationOutcome};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

/// Line source shared by the chat prompt and the approver, so both read
/// through one buffer.
pub struct LineInput<R> {
    lines: Mutex<Lines<R>>,
}

impl<R: AsyncBufRead + Unpin + Send> LineInput<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
        }
    }

    /// Next line, or `None` at end of input.
    pub async fn read_line(&self) -> Option<String> {
        match self.lines.lock().await.next_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read input");
                None
            }
        }
    }
}

pub type StdinInput = LineInput<BufReader<Stdin>>;

pub fn stdin_input() -> Arc<StdinInput> {
    Arc::new(LineInput::new(BufReader::new(tokio::io::stdin())))
}

/// Asks on stderr and reads the answer from a [`LineInput`].
pub struct PromptApprover<R> {
    input: Arc<LineInput<R>>,
}

impl<R> PromptApprover<R> {
    pub fn new(input: Arc<LineInput<R>>) -> Self {
        Self { input }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> Approver for PromptApprover<R> {
    async fn approve(&self, call: &PendingToolCall) -> ConfirmationOutcome {
        let kind = &call.details.kind;
        eprintln!();
        eprintln!("  ? {}", call.details.title);
        for line in describe(kind) {
            eprintln!("    {line}");
        }
        eprint!("  {} > ", choices(kind));
        let _ = std::io::stderr().flush();

        match self.input.read_line().await {
            Some(answer) => parse_answer(kind, &answer),
            None => ConfirmationOutcome::Cancel,
        }
    }
}

fn describe(kind: &ConfirmationKind) -> Vec<String> {
    match kind {
        ConfirmationKind::Exec { command, .. } => vec![format!("$ {command}")],
        ConfirmationKind::Edit {
            file_path,
            original,
            proposed,
        } => {
            let before = original.as_deref().map_or(0, |o| o.lines().count());
            let after = proposed.lines().count();
            match original {
                Some(_) => vec![format!("{file_path}: {before} → {after} lines")],
                None => vec![format!("{file_path}: new file, {after} lines")],
            }
        }
        ConfirmationKind::Mcp {
            server_name,
            tool_display_name,
            ..
        } => vec![format!("{tool_display_name} on MCP server \"{server_name}\"")],
        ConfirmationKind::Info { prompt } => vec![prompt.clone()],
    }
}

fn choices(kind: &ConfirmationKind) -> String {
    match kind {
        ConfirmationKind::Exec { root_command, .. } => {
            format!("[y]es once, [a]lways allow `{root_command}`, [n]o")
        }
        ConfirmationKind::Mcp {
            server_name,
            tool_name,
            ..
        } => format!("[y]es once, [t]rust tool `{tool_name}`, [s]erver `{server_name}`, [n]o"),
        _ => "[y]es once, [a]lways, [n]o".to_string(),
    }
}

/// Map a typed answer onto an outcome. Anything unrecognized denies.
pub fn parse_answer(kind: &ConfirmationKind, answer: &str) -> ConfirmationOutcome {
    let is_mcp = matches!(kind, ConfirmationKind::Mcp { .. });
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ConfirmationOutcome::ProceedOnce,
        "a" | "always" => ConfirmationOutcome::ProceedAlways,
        "t" | "tool" if is_mcp => ConfirmationOutcome::ProceedAlwaysTool,
        "s" | "server" if is_mcp => ConfirmationOutcome::ProceedAlwaysServer,
        _ => ConfirmationOutcome::Cancel,
    }
}
