//! End-to-end tests for the Kestrel agent runtime.
//!
//! These exercise the full pipeline from a user message to tool execution
//! and back to the model, with real discovery subprocesses and a scripted
//! model. The last group runs the `kestrel` binary itself.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kestrel_agent::{AutoApprover, Chat, DenyApprover, Session, TurnEvent};
use kestrel_config::AppConfig;
use kestrel_core::{
    ApprovalMode, Content, ContentGenerator, FunctionCall, GenerateContentRequest,
    GenerateContentResponse, Part, ProviderError, ResponseStream, ToolKind,
};
use kestrel_tools::ToolRegistry;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Scripted model ───────────────────────────────────────────────────────

/// Replies with one batch of parts per request, then "done".
struct ScriptedModel {
    replies: Mutex<VecDeque<Vec<Part>>>,
    requests: Mutex<Vec<GenerateContentRequest>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Vec<Part>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<GenerateContentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentGenerator for ScriptedModel {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn generate_content(
        &self,
        _request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        Err(ProviderError::NotImplemented("streaming only".into()))
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let parts = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Part::text("done")]);

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for part in parts {
                let chunk = GenerateContentResponse::from_content(Content::model(vec![part]));
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn call(id: &str, name: &str, args: Value) -> Part {
    Part::function_call(FunctionCall {
        id: Some(id.to_string()),
        name: name.to_string(),
        args,
    })
}

fn function_responses(request: &GenerateContentRequest) -> Vec<(String, Value)> {
    request
        .contents
        .last()
        .unwrap()
        .parts
        .iter()
        .filter_map(|p| p.function_response.as_ref())
        .map(|r| (r.name.clone(), r.response.clone()))
        .collect()
}

// ── Project fixture ──────────────────────────────────────────────────────

const DECLARATIONS: &str = r#"[
  {"function_declarations": [
    {"name": "lint", "description": "Lint the project",
     "parameters": {"type": "object", "properties": {"path": {"type": "string"}}}}
  ]}
]"#;

/// A project directory with a discovery manifest and a `lint` script body.
fn project() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::write(root.join("tools.json"), DECLARATIONS).unwrap();
    // `cat -` echoes the JSON arguments, then the file named after the tool
    std::fs::write(root.join("lint"), "lint ok\n").unwrap();
    std::fs::write(root.join("notes.txt"), "remember the milk\n").unwrap();
    (dir, root)
}

fn config_for(root: &Path, mode: ApprovalMode) -> AppConfig {
    let mut config = AppConfig::default();
    config.autonomy.target_dir = Some(root.display().to_string());
    config.autonomy.approval_mode = mode;
    config.tools.discovery_command = Some("cat tools.json".into());
    config.tools.call_command = Some("cat -".into());
    config
}

async fn discovered_registry(config: &AppConfig) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::from_config(config));
    assert_eq!(registry.discover_tools().await, 1);
    registry
}

// ── Session pipeline ─────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_discovered_and_native_tools_feed_back_in_order() {
    let (_dir, root) = project();
    let config = config_for(&root, ApprovalMode::Default);
    let registry = discovered_registry(&config).await;
    assert_eq!(registry.get_tool("lint").unwrap().kind(), ToolKind::Subprocess);

    let notes = root.join("notes.txt").display().to_string();
    let model = ScriptedModel::new(vec![
        vec![
            Part::text("Checking. "),
            call("c1", "lint", json!({ "path": "src" })),
            call("c2", "read_file", json!({ "absolute_path": notes })),
        ],
        vec![Part::text("All good.")],
    ]);
    let mut session = Session::new(
        Chat::new(model.clone(), "test-model"),
        Arc::clone(&registry),
        Arc::new(DenyApprover),
    );

    let mut text = String::new();
    let mut requested = Vec::new();
    let summary = session
        .send_message("lint and read my notes", &CancellationToken::new(), |event| match event {
            TurnEvent::Content(t) => text.push_str(t),
            TurnEvent::ToolCallRequest(r) => requested.push(r.call_id.clone()),
            _ => {}
        })
        .await
        .unwrap();

    assert_eq!(summary.turns, 2);
    assert_eq!(summary.tool_calls, 2);
    assert_eq!(text, "Checking. All good.");
    assert_eq!(requested, vec!["c1", "c2"]);

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    // the model saw every tool the registry published
    let names: Vec<_> = requests[0].tools.iter().map(|d| d.name.as_str()).collect();
    assert!(names.contains(&"lint"));
    assert!(names.contains(&"read_file"));

    let responses = function_responses(&requests[1]);
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].0, "lint");
    let lint_output = responses[0].1["output"].as_str().unwrap();
    assert!(lint_output.contains(r#""path":"src""#));
    assert!(lint_output.contains("lint ok"));
    assert_eq!(responses[1].0, "read_file");
    assert!(responses[1].1["output"].as_str().unwrap().contains("remember the milk"));

    registry.shutdown().await;
}

#[tokio::test]
async fn e2e_denied_write_never_touches_disk() {
    let (_dir, root) = project();
    let config = config_for(&root, ApprovalMode::Default);
    let registry = discovered_registry(&config).await;
    let target = root.join("out.txt");

    let model = ScriptedModel::new(vec![
        vec![call(
            "w1",
            "write_file",
            json!({ "file_path": target.display().to_string(), "content": "hello" }),
        )],
        vec![Part::text("Understood.")],
    ]);
    let mut session = Session::new(
        Chat::new(model.clone(), "test-model"),
        registry,
        Arc::new(DenyApprover),
    );
    session
        .send_message("write a file", &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(!target.exists());
    let responses = function_responses(&model.requests()[1]);
    assert_eq!(responses.len(), 1);
    assert!(responses[0].1.get("output").is_none());
    assert!(responses[0].1["error"].as_str().is_some());
}

#[tokio::test]
async fn e2e_approved_write_lands_inside_root() {
    let (_dir, root) = project();
    let config = config_for(&root, ApprovalMode::Default);
    let registry = discovered_registry(&config).await;
    let target = root.join("out.txt");

    let model = ScriptedModel::new(vec![
        vec![call(
            "w1",
            "write_file",
            json!({ "file_path": target.display().to_string(), "content": "hello" }),
        )],
        vec![Part::text("Written.")],
    ]);
    let mut session = Session::new(Chat::new(model, "test-model"), registry, Arc::new(AutoApprover));
    session
        .send_message("write a file", &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
}

#[tokio::test]
async fn e2e_yolo_still_asks_before_chained_shell_lines() {
    let (_dir, root) = project();
    let registry = discovered_registry(&config_for(&root, ApprovalMode::Yolo)).await;
    let planted = root.join("pwned");

    let model = ScriptedModel::new(vec![
        vec![call("s1", "run_shell_command", json!({ "command": "ls; touch pwned" }))],
        vec![Part::text("Stopped.")],
    ]);
    let mut session = Session::new(
        Chat::new(model.clone(), "test-model"),
        registry,
        Arc::new(DenyApprover),
    );

    let mut asked = Vec::new();
    session
        .send_message("list files", &CancellationToken::new(), |event| {
            if let TurnEvent::AwaitingConfirmation { request, .. } = event {
                asked.push(request.call_id.clone());
            }
        })
        .await
        .unwrap();

    assert_eq!(asked, vec!["s1"]);
    assert!(!planted.exists());
    let responses = function_responses(&model.requests()[1]);
    assert!(responses[0].1["error"].as_str().is_some());
}

#[tokio::test]
async fn e2e_unknown_tool_is_reported_to_model() {
    let (_dir, root) = project();
    let registry = discovered_registry(&config_for(&root, ApprovalMode::Yolo)).await;
    let model = ScriptedModel::new(vec![vec![call("x1", "no_such_tool", json!({}))]]);
    let mut session = Session::new(Chat::new(model.clone(), "test-model"), registry, Arc::new(AutoApprover));

    session
        .send_message("try it", &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    let responses = function_responses(&model.requests()[1]);
    assert_eq!(responses[0].0, "no_such_tool");
    assert!(responses[0].1["error"].as_str().unwrap().contains("no_such_tool"));
}

#[tokio::test]
async fn e2e_broken_discovery_leaves_natives_available() {
    let (_dir, root) = project();
    std::fs::write(root.join("tools.json"), "not json").unwrap();
    let registry = ToolRegistry::from_config(&config_for(&root, ApprovalMode::Default));

    assert_eq!(registry.discover_tools().await, 0);
    assert!(registry.get_tool("lint").is_none());
    assert!(registry.get_tool("read_file").is_some());
}

// ── Binary ───────────────────────────────────────────────────────────────

/// Run `kestrel` with an isolated home directory and config file.
fn kestrel(home: &Path, cwd: &Path, config: &str, args: &[&str]) -> std::process::Output {
    let config_dir = home.join(".kestrel");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("config.toml"), config).unwrap();

    Command::new(env!("CARGO_BIN_EXE_kestrel"))
        .args(args)
        .current_dir(cwd)
        .env("HOME", home)
        .env_remove("KESTREL_API_KEY")
        .env_remove("GEMINI_API_KEY")
        .env_remove("GOOGLE_API_KEY")
        .env_remove("KESTREL_TOOL_DISCOVERY_COMMAND")
        .env_remove("KESTREL_TOOL_CALL_COMMAND")
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn cli_tools_json_lists_discovered_declarations() {
    let (_dir, root) = project();
    let home = tempfile::tempdir().unwrap();
    let config = format!(
        r#"
[tools]
discovery_command = "cat tools.json"
call_command = "cat -"

[autonomy]
target_dir = "{}"
"#,
        root.display()
    );

    let output = kestrel(home.path(), &root, &config, &["tools", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let declarations: Vec<Value> = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<_> = declarations.iter().filter_map(|d| d["name"].as_str()).collect();
    for expected in ["lint", "read_file", "write_file", "run_shell_command"] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }
}

#[test]
fn cli_doctor_reports_invalid_config() {
    let home = tempfile::tempdir().unwrap();
    let output = kestrel(home.path(), home.path(), "model = [not toml", &["doctor"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration invalid"), "{stdout}");
}

#[test]
fn cli_mcp_without_servers_says_so() {
    let home = tempfile::tempdir().unwrap();
    let output = kestrel(home.path(), home.path(), "", &["mcp"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No MCP servers configured"));
}

#[test]
fn cli_chat_without_credentials_fails_cleanly() {
    let home = tempfile::tempdir().unwrap();
    let output = kestrel(home.path(), home.path(), "", &["chat", "-m", "hi"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No model backend available"));
}
