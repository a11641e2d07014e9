//! `kestrel chat`: interactive or single-message agent session.

use std::io::Write;
use std::sync::Arc;

use kestrel_agent::{Approver, Chat, Session, TurnError, TurnEvent};
use kestrel_config::AppConfig;
use kestrel_core::{ApprovalMode, DomainEvent, EventBus, GenerationConfig};
use kestrel_providers::router::{HybridGenerator, build_from_config};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::approver::{PromptApprover, StdinInput, stdin_input};

pub async fn run(message: Option<String>, yolo: bool) -> anyhow::Result<()> {
    let mut config = super::load_config()?;
    if yolo {
        config.autonomy.approval_mode = ApprovalMode::Yolo;
    }

    let router = build_from_config(&config);
    let generator = match HybridGenerator::from_router(&router) {
        Ok(generator) => Arc::new(generator),
        Err(e) => {
            eprintln!();
            eprintln!("  ERROR: {e}");
            eprintln!();
            eprintln!("  Set KESTREL_API_KEY (or GEMINI_API_KEY), or add a backend to");
            eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
            eprintln!();
            anyhow::bail!("No model backend available. See above for setup instructions.");
        }
    };

    let events = Arc::new(EventBus::default());
    spawn_event_logger(&events);
    let registry = super::discover(&config, Some(Arc::clone(&events))).await;

    let chat = Chat::new(generator.clone(), generator.chat_model())
        .with_system_instruction(config.system_instruction.clone())
        .with_generation_config(GenerationConfig {
            temperature: Some(config.temperature),
            max_output_tokens: config.max_output_tokens,
            ..GenerationConfig::default()
        });

    let input = stdin_input();
    // Yolo is applied by the tools themselves; whatever still asks gets a prompt
    let approver: Arc<dyn Approver> = Arc::new(PromptApprover::new(Arc::clone(&input)));
    let mut session = Session::new(chat, Arc::clone(&registry), approver)
        .with_max_turns(config.max_turns)
        .with_event_bus(events);

    let result = match message {
        Some(msg) => send(&mut session, &msg).await,
        None => interactive(&mut session, &config, &input).await,
    };

    registry.shutdown().await;
    result
}

async fn interactive(session: &mut Session, config: &AppConfig, input: &StdinInput) -> anyhow::Result<()> {
    println!();
    println!("  Kestrel, interactive mode");
    println!();
    println!("  Model:     {}", session.chat().model());
    println!("  Tools:     {}", session.registry().get_all_tools().len());
    println!("  Approval:  {:?}", config.autonomy.approval_mode);
    println!("  Root:      {}", config.target_dir().display());
    println!();
    println!("  Type your message and press Enter.");
    println!("  /clear resets the conversation, /tools lists tools, exit quits.");
    println!();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = input.read_line().await else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "/clear" => {
                session.clear();
                println!("  (conversation cleared)");
                continue;
            }
            "/tools" => {
                for tool in session.registry().get_all_tools() {
                    println!("  - {}", tool.display_name());
                }
                continue;
            }
            _ => {}
        }

        if let Err(e) = send(session, line).await {
            eprintln!("  [Error] {e}");
        }
        println!();
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Send one message; Ctrl+C cancels it without leaving the session.
async fn send(session: &mut Session, text: &str) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut printed_text = false;
    let result = session
        .send_message(text, &cancel, |event| {
            render(event, &mut printed_text);
        })
        .await;
    watcher.abort();
    if printed_text {
        println!();
    }

    match result {
        Ok(summary) => {
            debug!(turns = summary.turns, tool_calls = summary.tool_calls, "Message handled");
            if summary.hit_turn_limit {
                eprintln!("  [Stopped] turn limit reached; send another message to continue");
            }
            Ok(())
        }
        Err(TurnError::Cancelled) => {
            eprintln!("  [Cancelled]");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn render(event: &TurnEvent, printed_text: &mut bool) {
    match event {
        TurnEvent::Content(text) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
            *printed_text = true;
        }
        TurnEvent::ToolCallRequest(request) => {
            if *printed_text {
                println!();
                *printed_text = false;
            }
            eprintln!("  ⚙ {} {}", request.name, request.args);
        }
        TurnEvent::ToolCallResult(outcome) => match &outcome.result {
            Ok(result) => {
                let display = result.return_display.trim_end();
                eprintln!("  ✓ {} ({} ms)", outcome.name, outcome.duration_ms);
                for line in display.lines().take(20) {
                    eprintln!("    {line}");
                }
            }
            Err(e) => eprintln!("  ✗ {}: {e}", outcome.name),
        },
        TurnEvent::AwaitingConfirmation { request, .. } => {
            debug!(call_id = %request.call_id, tool = %request.name, "Awaiting approval");
        }
    }
}

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event logger lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event.as_ref() {
                DomainEvent::ErrorOccurred {
                    context,
                    error_message,
                    ..
                } => warn!(%context, error = %error_message, "Background failure"),
                other => debug!(event = ?other, "Domain event"),
            }
        }
    });
}
