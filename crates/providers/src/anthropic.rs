//! Anthropic native generator implementation.
//!
//! Uses Anthropic's Messages API directly (not an OpenAI-compatible proxy).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System instruction as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via typed SSE events
//! - Extended thinking, surfaced as thought parts

use async_trait::async_trait;
use kestrel_core::{
    Candidate, Content, ContentGenerator, FunctionCall, FunctionDeclaration,
    GenerateContentRequest, GenerateContentResponse, Part, ProviderError, ResponseStream, Role,
    ToolChoice, UsageMetadata,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::http::{self, FrameDecoder};
use crate::sse::{Frame, FrameParser};

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic native Messages API generator.
pub struct AnthropicGenerator {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    /// Budget tokens for extended thinking, when enabled.
    thinking_budget: Option<u32>,
}

impl AnthropicGenerator {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: ANTHROPIC_BASE_URL.into(),
            api_key: api_key.into(),
            // Anthropic can be slow with thinking
            client: http::client(300),
            thinking_budget: None,
        }
    }

    /// Use a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_extended_thinking(mut self, budget_tokens: u32) -> Self {
        self.thinking_budget = Some(budget_tokens);
        self
    }

    /// Convert role-tagged content to Anthropic messages with content blocks.
    fn to_api_messages(contents: &[Content]) -> Vec<AnthropicMessage> {
        let mut result = Vec::new();

        for content in contents {
            let mut blocks = Vec::new();
            for part in &content.parts {
                if part.is_thought() {
                    continue;
                }
                if let Some(text) = part.text.as_ref().filter(|t| !t.is_empty()) {
                    blocks.push(ContentBlock::Text { text: text.clone() });
                }
                if let Some(call) = &part.function_call {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone().unwrap_or_else(|| call.name.clone()),
                        name: call.name.clone(),
                        input: if call.args.is_object() { call.args.clone() } else { json!({}) },
                    });
                }
                if let Some(response) = &part.function_response {
                    blocks.push(ContentBlock::ToolResult {
                        tool_use_id: response.id.clone().unwrap_or_else(|| response.name.clone()),
                        content: response.response.to_string(),
                    });
                }
            }
            if blocks.is_empty() {
                continue;
            }
            let role = match content.role {
                Role::User => "user",
                Role::Model => "assistant",
            };
            result.push(AnthropicMessage {
                role: role.into(),
                content: blocks,
            });
        }

        result
    }

    fn to_api_tools(tools: &[FunctionDeclaration]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            })
            .collect()
    }

    fn to_api_tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!({ "type": "auto" }),
            ToolChoice::Any => json!({ "type": "any" }),
            ToolChoice::None => json!({ "type": "none" }),
            ToolChoice::Functions(names) if names.len() == 1 => {
                json!({ "type": "tool", "name": names[0] })
            }
            ToolChoice::Functions(_) => json!({ "type": "any" }),
        }
    }

    fn body(&self, request: &GenerateContentRequest, stream: bool) -> Value {
        let config = &request.generation_config;
        let mut body = json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.contents),
            "max_tokens": config.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if stream {
            body["stream"] = json!(true);
        }
        if let Some(system) = &request.system_instruction {
            body["system"] = json!(system);
        }
        if let Some(t) = config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = config.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = config.top_k {
            body["top_k"] = json!(k);
        }
        if !config.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(config.stop_sequences);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(Self::to_api_tools(&request.tools));
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = Self::to_api_tool_choice(choice);
            }
        }
        if let Some(budget) = self.thinking_budget {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(http::network)?;
        http::check_status("anthropic", response).await
    }

    fn to_response(resp: AnthropicResponse) -> GenerateContentResponse {
        let parts = resp
            .content
            .into_iter()
            .map(|block| match block {
                ResponseContentBlock::Text { text } => Part::text(text),
                ResponseContentBlock::ToolUse { id, name, input } => {
                    Part::function_call(FunctionCall {
                        id: Some(id),
                        name,
                        args: input,
                    })
                }
                ResponseContentBlock::Thinking { thinking } => Part {
                    text: Some(thinking),
                    thought: Some(true),
                    ..Default::default()
                },
            })
            .collect();

        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                finish_reason: resp.stop_reason,
                index: Some(0),
            }],
            usage_metadata: Some(resp.usage.into()),
            model_version: Some(resp.model),
        }
    }
}

#[async_trait]
impl ContentGenerator for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        debug!(provider = "anthropic", model = %request.model, "Sending completion request");
        let response = self.post(&self.body(&request, false)).await?;
        let api_resp: AnthropicResponse = response.json().await.map_err(|e| {
            ProviderError::Protocol(format!("failed to parse Anthropic response: {e}"))
        })?;
        Ok(Self::to_response(api_resp))
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ProviderError> {
        debug!(provider = "anthropic", model = %request.model, "Sending streaming request");
        let response = self.post(&self.body(&request, true)).await?;
        Ok(http::spawn_stream(
            "anthropic".into(),
            response,
            FrameParser::lenient(),
            AnthropicDecoder::default(),
        ))
    }
}

/// Pending `tool_use` block.
struct ToolUseAccumulator {
    id: String,
    name: String,
    input_json: String,
}

impl ToolUseAccumulator {
    fn into_part(self) -> Part {
        let args = if self.input_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.input_json).unwrap_or_else(|e| {
                warn!(tool = %self.name, error = %e, "tool_use input is not valid JSON");
                json!({})
            })
        };
        Part::function_call(FunctionCall {
            id: Some(self.id),
            name: self.name,
            args,
        })
    }
}

/// Turns typed Messages API events into partial responses.
#[derive(Default)]
struct AnthropicDecoder {
    current: Option<ToolUseAccumulator>,
    input_tokens: u32,
    done: bool,
}

impl AnthropicDecoder {
    fn close_tool(&mut self) -> Option<GenerateContentResponse> {
        let part = self.current.take()?.into_part();
        Some(GenerateContentResponse::from_content(Content::model(vec![part])))
    }
}

impl FrameDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: Frame) -> Result<Vec<GenerateContentResponse>, ProviderError> {
        let event: Value = frame.json()?;
        let event_type = event["type"]
            .as_str()
            .or(frame.event.as_deref())
            .unwrap_or("");

        let mut out = Vec::new();
        match event_type {
            "message_start" => {
                if let Some(n) = event["message"]["usage"]["input_tokens"].as_u64() {
                    self.input_tokens = n as u32;
                }
            }
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    out.extend(self.close_tool());
                    self.current = Some(ToolUseAccumulator {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input_json: String::new(),
                    });
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(GenerateContentResponse::from_content(Content::model(
                                vec![Part::text(text)],
                            )));
                        }
                    }
                    "thinking_delta" => {
                        if let Some(thinking) = delta["thinking"].as_str() {
                            out.push(GenerateContentResponse::from_content(Content::model(
                                vec![Part {
                                    text: Some(thinking.to_string()),
                                    thought: Some(true),
                                    ..Default::default()
                                }],
                            )));
                        }
                    }
                    "input_json_delta" => {
                        if let (Some(acc), Some(partial)) =
                            (self.current.as_mut(), delta["partial_json"].as_str())
                        {
                            acc.input_json.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => out.extend(self.close_tool()),
            "message_delta" => {
                let output = event["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
                let mut response = GenerateContentResponse {
                    usage_metadata: Some(UsageMetadata {
                        prompt_token_count: self.input_tokens,
                        candidates_token_count: output,
                        total_token_count: self.input_tokens + output,
                    }),
                    ..Default::default()
                };
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    response.candidates.push(Candidate {
                        content: None,
                        finish_reason: Some(reason.to_string()),
                        index: Some(0),
                    });
                }
                out.push(response);
            }
            "message_stop" => {
                out.extend(self.close_tool());
                self.done = true;
            }
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error")
                    .to_string();
                return Err(ProviderError::StreamInterrupted(message));
            }
            _ => {}
        }
        Ok(out)
    }

    fn finish(&mut self) -> Vec<GenerateContentResponse> {
        self.close_tool().into_iter().collect()
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl From<AnthropicUsage> for UsageMetadata {
    fn from(u: AnthropicUsage) -> Self {
        Self {
            prompt_token_count: u.input_tokens,
            candidates_token_count: u.output_tokens,
            total_token_count: u.input_tokens + u.output_tokens,
        }
    }
}
