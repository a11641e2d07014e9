//! Drives turns for one user message until the model stops calling tools.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kestrel_core::{ConfirmationOutcome, DomainEvent, EventBus, Part};
use kestrel_tools::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::Chat;
use crate::turn::{PendingToolCall, ToolCallOutcome, Turn, TurnError, TurnEvent};

pub const DEFAULT_MAX_TURNS: u32 = 25;

/// Decides whether a gated tool call may run.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, call: &PendingToolCall) -> ConfirmationOutcome;
}

/// Approves everything once, including calls that yolo mode still gates.
pub struct AutoApprover;

#[async_trait]
impl Approver for AutoApprover {
    async fn approve(&self, _call: &PendingToolCall) -> ConfirmationOutcome {
        ConfirmationOutcome::ProceedOnce
    }
}

/// Denies everything.
pub struct DenyApprover;

#[async_trait]
impl Approver for DenyApprover {
    async fn approve(&self, call: &PendingToolCall) -> ConfirmationOutcome {
        debug!(tool = %call.request.name, "Denying gated call");
        ConfirmationOutcome::Cancel
    }
}

/// What one `send_message` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    /// Model exchanges made.
    pub turns: u32,
    pub tool_calls: usize,
    /// The last exchange still requested tools when `max_turns` ran out.
    pub hit_turn_limit: bool,
}

pub struct Session {
    chat: Chat,
    registry: Arc<ToolRegistry>,
    approver: Arc<dyn Approver>,
    max_turns: u32,
    events: Option<Arc<EventBus>>,
    /// Function responses not yet sent, prepended to the next message.
    carry_over: Vec<Part>,
}

impl Session {
    pub fn new(chat: Chat, registry: Arc<ToolRegistry>, approver: Arc<dyn Approver>) -> Self {
        Self {
            chat,
            registry,
            approver,
            max_turns: DEFAULT_MAX_TURNS,
            events: None,
            carry_over: Vec::new(),
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Forget the conversation, including responses waiting to be sent.
    pub fn clear(&mut self) {
        self.chat.clear();
        self.carry_over.clear();
    }

    /// Send `text` and keep exchanging until no tool calls remain.
    pub async fn send_message<F>(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<SessionSummary, TurnError>
    where
        F: FnMut(&TurnEvent),
    {
        let mut parts = std::mem::take(&mut self.carry_over);
        parts.push(Part::text(text));
        let mut summary = SessionSummary::default();
        let events = self.events.clone();

        loop {
            summary.turns += 1;
            let mut turn = Turn::new(Arc::clone(&self.registry));

            let run_result = {
                let stream = turn.run(&mut self.chat, parts, cancel.clone());
                futures::pin_mut!(stream);
                let mut failure = None;
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) => {
                            if let TurnEvent::ToolCallResult(outcome) = &event {
                                tool_executed(events.as_deref(), outcome);
                            }
                            on_event(&event);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                failure.map_or(Ok(()), Err)
            };
            if let Err(e) = run_result {
                self.abandon(&mut turn);
                return Err(e);
            }
            summary.tool_calls += turn.requests().len();

            for call_id in turn.pending_call_ids() {
                let Some(pending) = turn.awaiting_confirmation_call(&call_id) else {
                    continue;
                };
                let decision = self.approver.approve(pending).await;
                if cancel.is_cancelled() {
                    self.abandon(&mut turn);
                    return Err(TurnError::Cancelled);
                }
                if let Some(outcome) = turn
                    .resolve_confirmation(&call_id, decision, cancel.clone())
                    .await
                {
                    tool_executed(events.as_deref(), &outcome);
                    on_event(&TurnEvent::ToolCallResult(outcome));
                }
            }

            if let Some(events) = &events {
                events.publish(DomainEvent::TurnCompleted {
                    function_calls: turn.requests().len(),
                    timestamp: Utc::now(),
                });
            }

            let responses = turn.function_responses();
            if responses.is_empty() {
                info!(turns = summary.turns, tool_calls = summary.tool_calls, "Message complete");
                return Ok(summary);
            }
            if summary.turns >= self.max_turns {
                warn!(max_turns = self.max_turns, "Turn limit reached with tool responses outstanding");
                self.carry_over = responses;
                summary.hit_turn_limit = true;
                return Ok(summary);
            }
            parts = responses;
        }
    }

    /// Keep history consistent after an aborted turn: calls the model made
    /// get cancelled responses on the next message.
    fn abandon(&mut self, turn: &mut Turn) {
        if turn.is_committed() {
            turn.cancel_pending();
            self.carry_over = turn.function_responses();
        }
    }
}

fn tool_executed(events: Option<&EventBus>, outcome: &ToolCallOutcome) {
    if let Some(events) = events {
        events.publish(DomainEvent::ToolExecuted {
            tool_name: outcome.name.clone(),
            success: outcome.is_success(),
            duration_ms: outcome.duration_ms,
            timestamp: Utc::now(),
        });
    }
}
