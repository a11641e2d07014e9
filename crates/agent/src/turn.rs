//! One model exchange: stream the reply, dispatch tool calls, collect
//! outcomes.
//!
//! Ordering guarantees:
//! - `Content` events follow model emission order.
//! - `ToolCallRequest` events follow the order calls appear in the reply.
//! - `ToolCallResult` events for immediate calls follow request order, not
//!   completion order.
//!
//! Calls whose tool asks for confirmation are parked in the pending map and
//! never run until [`Turn::resolve_confirmation`] approves them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::Stream;
use futures::future::join_all;
use kestrel_core::{
    ConfirmationDetails, ConfirmationOutcome, FunctionCall, FunctionResponse, Part, ProviderError,
    Tool, ToolError, ToolResult, UsageMetadata,
};
use kestrel_tools::ToolRegistry;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::Chat;

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Turn cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: Value,
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub name: String,
    pub result: Result<ToolResult, ToolError>,
    pub duration_ms: u64,
}

impl ToolCallOutcome {
    fn failed(request: &ToolCallRequest, error: ToolError) -> Self {
        Self {
            call_id: request.call_id.clone(),
            name: request.name.clone(),
            result: Err(error),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The function-response payload the model receives.
    pub fn response_payload(&self) -> Value {
        match &self.result {
            Ok(result) => json!({ "output": result.llm_content }),
            Err(e) => json!({ "error": format!("Tool execution failed: {e}") }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    Content(String),
    ToolCallRequest(ToolCallRequest),
    ToolCallResult(ToolCallOutcome),
    AwaitingConfirmation {
        request: ToolCallRequest,
        details: ConfirmationDetails,
    },
}

/// A gated call waiting for an approval signal.
#[derive(Clone)]
pub struct PendingToolCall {
    pub request: ToolCallRequest,
    pub tool: Arc<dyn Tool>,
    pub details: ConfirmationDetails,
}

impl std::fmt::Debug for PendingToolCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingToolCall")
            .field("request", &self.request)
            .field("tool", &self.tool.name())
            .field("details", &self.details)
            .finish()
    }
}

enum Dispatch {
    Immediate(Arc<dyn Tool>),
    Gated(PendingToolCall),
    Failed(ToolError),
}

pub struct Turn {
    registry: Arc<ToolRegistry>,
    /// Every call requested by the current exchange, in appearance order.
    requests: Vec<ToolCallRequest>,
    outcomes: HashMap<String, ToolCallOutcome>,
    pending: HashMap<String, PendingToolCall>,
    used_ids: HashSet<String>,
    committed: bool,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
}

impl Turn {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            requests: Vec::new(),
            outcomes: HashMap::new(),
            pending: HashMap::new(),
            used_ids: HashSet::new(),
            committed: false,
            finish_reason: None,
            usage: None,
        }
    }

    /// Run one exchange. Starting a new run discards the previous run's
    /// requests, outcomes and pending calls.
    pub fn run<'a>(
        &'a mut self,
        chat: &'a mut Chat,
        parts: Vec<Part>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<TurnEvent, TurnError>> + 'a {
        stream! {
            self.requests.clear();
            self.outcomes.clear();
            self.pending.clear();
            self.committed = false;
            self.finish_reason = None;
            self.usage = None;

            let declarations = self.registry.get_function_declarations();
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                opened = chat.send_message_stream(parts.clone(), declarations) => Some(opened),
            };
            let Some(opened) = opened else {
                yield Err(TurnError::Cancelled);
                return;
            };
            let mut rx = match opened {
                Ok(rx) => rx,
                Err(e) => {
                    yield Err(TurnError::Provider(e));
                    return;
                }
            };

            let mut model_parts: Vec<Part> = Vec::new();
            let mut immediate: Vec<(ToolCallRequest, Arc<dyn Tool>)> = Vec::new();

            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = rx.recv() => Some(item),
                };
                let Some(item) = received else {
                    yield Err(TurnError::Cancelled);
                    return;
                };
                let Some(item) = item else { break };
                let response = match item {
                    Ok(r) => r,
                    Err(e) => {
                        yield Err(TurnError::Provider(e));
                        return;
                    }
                };

                if let Some(usage) = response.usage_metadata {
                    self.usage = Some(usage);
                }
                let Some(candidate) = response.candidates.into_iter().next() else {
                    continue;
                };
                if candidate.finish_reason.is_some() {
                    self.finish_reason = candidate.finish_reason;
                }
                let Some(content) = candidate.content else { continue };

                for part in content.parts {
                    if part.is_thought() {
                        model_parts.push(part);
                        continue;
                    }
                    if let Some(text) = &part.text {
                        if !text.is_empty() {
                            yield Ok(TurnEvent::Content(text.clone()));
                        }
                        model_parts.push(part);
                        continue;
                    }
                    let Some(call) = part.function_call else { continue };

                    let call_id = self.assign_call_id(&call);
                    model_parts.push(Part::function_call(FunctionCall {
                        id: Some(call_id.clone()),
                        ..call.clone()
                    }));
                    let mut request = ToolCallRequest {
                        call_id,
                        name: call.name,
                        args: call.args,
                        requires_confirmation: false,
                    };

                    match self.dispatch(&request, &cancel).await {
                        Dispatch::Immediate(tool) => {
                            self.requests.push(request.clone());
                            yield Ok(TurnEvent::ToolCallRequest(request.clone()));
                            immediate.push((request, tool));
                        }
                        Dispatch::Failed(error) => {
                            debug!(tool = %request.name, error = %error, "Tool call rejected");
                            self.requests.push(request.clone());
                            self.outcomes.insert(
                                request.call_id.clone(),
                                ToolCallOutcome::failed(&request, error),
                            );
                            yield Ok(TurnEvent::ToolCallRequest(request));
                        }
                        Dispatch::Gated(mut pending) => {
                            request.requires_confirmation = true;
                            pending.request = request.clone();
                            self.requests.push(request.clone());
                            let details = pending.details.clone();
                            self.pending.insert(request.call_id.clone(), pending);
                            yield Ok(TurnEvent::ToolCallRequest(request.clone()));
                            yield Ok(TurnEvent::AwaitingConfirmation { request, details });
                        }
                    }
                }
            }

            chat.record_exchange(parts, model_parts);
            self.committed = true;

            // Dispatched executions always run to completion; tools that
            // honor the token return early on their own.
            let executions = immediate
                .into_iter()
                .map(|(request, tool)| execute_call(tool, request, cancel.clone()));
            for outcome in join_all(executions).await {
                self.outcomes.insert(outcome.call_id.clone(), outcome);
            }
            if cancel.is_cancelled() {
                yield Err(TurnError::Cancelled);
                return;
            }

            for request in &self.requests {
                if let Some(outcome) = self.outcomes.get(&request.call_id) {
                    yield Ok(TurnEvent::ToolCallResult(outcome.clone()));
                }
            }
            info!(
                calls = self.requests.len(),
                pending = self.pending.len(),
                "Turn exchange finished"
            );
        }
    }

    /// Model id when present and unused in this turn, a fresh one otherwise.
    fn assign_call_id(&mut self, call: &FunctionCall) -> String {
        let id = match &call.id {
            Some(id) if !id.is_empty() && !self.used_ids.contains(id) => id.clone(),
            _ => format!("{}-{}", call.name, Uuid::new_v4()),
        };
        self.used_ids.insert(id.clone());
        id
    }

    async fn dispatch(&self, request: &ToolCallRequest, cancel: &CancellationToken) -> Dispatch {
        let Some(tool) = self.registry.get_tool(&request.name) else {
            return Dispatch::Failed(ToolError::NotFound(request.name.clone()));
        };
        if let Err(e) = tool.validate_params(&request.args) {
            return Dispatch::Failed(e);
        }
        match tool.should_confirm_execute(&request.args, cancel).await {
            Ok(None) => Dispatch::Immediate(tool),
            Ok(Some(details)) => Dispatch::Gated(PendingToolCall {
                request: request.clone(),
                tool,
                details,
            }),
            Err(e) => Dispatch::Failed(e),
        }
    }

    pub fn awaiting_confirmation_call(&self, call_id: &str) -> Option<&PendingToolCall> {
        self.pending.get(call_id)
    }

    /// Drop a pending call without producing an outcome.
    pub fn clear_awaiting_confirmation_call(&mut self, call_id: &str) -> Option<PendingToolCall> {
        self.pending.remove(call_id)
    }

    /// Ids of calls awaiting confirmation, in request order.
    pub fn pending_call_ids(&self) -> Vec<String> {
        self.requests
            .iter()
            .filter(|r| self.pending.contains_key(&r.call_id))
            .map(|r| r.call_id.clone())
            .collect()
    }

    /// Approve or deny a pending call. Approval runs the tool; `Cancel`
    /// records a denial. `None` when `call_id` is not pending.
    pub async fn resolve_confirmation(
        &mut self,
        call_id: &str,
        outcome: ConfirmationOutcome,
        cancel: CancellationToken,
    ) -> Option<ToolCallOutcome> {
        let pending = self.pending.remove(call_id)?;
        let result = if outcome.is_approved() {
            pending.tool.on_confirmed(&pending.request.args, outcome);
            execute_call(pending.tool, pending.request, cancel).await
        } else {
            info!(tool = %pending.request.name, call_id, "Tool call denied");
            ToolCallOutcome::failed(
                &pending.request,
                ToolError::PermissionDenied {
                    tool_name: pending.request.name.clone(),
                    reason: "User did not allow the tool call".into(),
                },
            )
        };
        self.outcomes.insert(call_id.to_string(), result.clone());
        Some(result)
    }

    /// Turn every remaining pending call into a cancelled outcome.
    pub fn cancel_pending(&mut self) {
        for (call_id, pending) in self.pending.drain() {
            self.outcomes.insert(
                call_id,
                ToolCallOutcome::failed(&pending.request, ToolError::Cancelled(pending.request.name.clone())),
            );
        }
    }

    /// Function-response parts for every call with an outcome, in request order.
    pub fn function_responses(&self) -> Vec<Part> {
        self.requests
            .iter()
            .filter_map(|r| self.outcomes.get(&r.call_id))
            .map(|o| {
                Part::function_response(FunctionResponse {
                    id: Some(o.call_id.clone()),
                    name: o.name.clone(),
                    response: o.response_payload(),
                })
            })
            .collect()
    }

    pub fn requests(&self) -> &[ToolCallRequest] {
        &self.requests
    }

    /// Whether the last run's exchange reached chat history.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn usage(&self) -> Option<&UsageMetadata> {
        self.usage.as_ref()
    }
}

async fn execute_call(tool: Arc<dyn Tool>, request: ToolCallRequest, cancel: CancellationToken) -> ToolCallOutcome {
    let started = Instant::now();
    let result = tool.execute(request.args, cancel).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => debug!(tool = %request.name, duration_ms, "Tool executed"),
        Err(e) => warn!(tool = %request.name, error = %e, "Tool execution failed"),
    }
    ToolCallOutcome {
        call_id: request.call_id,
        name: request.name,
        result,
        duration_ms,
    }
}
