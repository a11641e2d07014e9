//! OpenAI-compatible generator implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, Fireworks AI,
//! and any endpoint exposing `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling with incremental argument deltas
//! - Embeddings via `/embeddings`

use std::collections::BTreeMap;

use async_trait::async_trait;
use kestrel_core::{
    Candidate, Content, ContentGenerator, EmbedContentRequest, EmbedContentResponse,
    FunctionCall, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse, Part,
    ProviderError, ResponseStream, Role, ToolChoice, UsageMetadata,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::http::{self, FrameDecoder};
use crate::sse::{Frame, FrameParser};

/// An OpenAI-compatible generator.
pub struct OpenAiCompatGenerator {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatGenerator {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http::client(120),
        }
    }

    /// Create an OpenAI generator (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama generator (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// Convert role-tagged content to chat messages.
    ///
    /// Function responses become `tool` messages; a call without a backend id
    /// is keyed by its function name on both sides.
    fn to_api_messages(system: Option<&str>, contents: &[Content]) -> Vec<ApiMessage> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ApiMessage::text("system", system));
        }

        for content in contents {
            match content.role {
                Role::User => {
                    for response in content.parts.iter().filter_map(|p| p.function_response.as_ref()) {
                        messages.push(ApiMessage {
                            role: "tool".into(),
                            content: Some(response.response.to_string()),
                            tool_calls: None,
                            tool_call_id: Some(response.id.clone().unwrap_or_else(|| response.name.clone())),
                        });
                    }
                    let text = content.text();
                    if !text.is_empty() {
                        messages.push(ApiMessage::text("user", text));
                    }
                }
                Role::Model => {
                    let calls: Vec<ApiToolCall> = content
                        .function_calls()
                        .map(|call| ApiToolCall {
                            id: call.id.clone().unwrap_or_else(|| call.name.clone()),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: call.name.clone(),
                                arguments: call.args.to_string(),
                            },
                        })
                        .collect();
                    let text = content.text();
                    messages.push(ApiMessage {
                        role: "assistant".into(),
                        content: (!text.is_empty()).then_some(text),
                        tool_calls: (!calls.is_empty()).then_some(calls),
                        tool_call_id: None,
                    });
                }
            }
        }
        messages
    }

    /// Convert function declarations to OpenAI tool definitions.
    fn to_api_tools(tools: &[FunctionDeclaration]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t
                        .parameters
                        .clone()
                        .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                },
            })
            .collect()
    }

    fn to_api_tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Functions(names) if names.len() == 1 => {
                json!({ "type": "function", "function": { "name": names[0] } })
            }
            ToolChoice::Functions(_) => json!("required"),
        }
    }

    fn body(request: &GenerateContentRequest, stream: bool) -> Value {
        let config = &request.generation_config;
        let mut body = json!({
            "model": request.model,
            "messages": Self::to_api_messages(request.system_instruction.as_deref(), &request.contents),
            "stream": stream,
        });

        if let Some(t) = config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = config.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(n) = config.candidate_count {
            body["n"] = json!(n);
        }
        if let Some(max_tokens) = config.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !config.stop_sequences.is_empty() {
            body["stop"] = json!(config.stop_sequences);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(Self::to_api_tools(&request.tools));
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = Self::to_api_tool_choice(choice);
            }
        }
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(http::network)?;
        http::check_status(&self.name, response).await
    }
}

#[async_trait]
impl ContentGenerator for OpenAiCompatGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending completion request");
        let response = self.post("/chat/completions", &Self::body(&request, false)).await?;

        let api_response: ApiResponse = response.json().await.map_err(|e| {
            ProviderError::Protocol(format!("failed to parse completion response: {e}"))
        })?;

        let candidates = api_response
            .choices
            .into_iter()
            .enumerate()
            .map(|(i, choice)| Candidate {
                content: Some(message_to_content(choice.message)),
                finish_reason: choice.finish_reason,
                index: Some(i as u32),
            })
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Err(ProviderError::Protocol("no choices in response".into()));
        }

        Ok(GenerateContentResponse {
            candidates,
            usage_metadata: api_response.usage.map(UsageMetadata::from),
            model_version: api_response.model,
        })
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");
        let response = self.post("/chat/completions", &Self::body(&request, true)).await?;
        Ok(http::spawn_stream(
            self.name.clone(),
            response,
            FrameParser::lenient(),
            OpenAiDecoder::default(),
        ))
    }

    async fn embed_content(
        &self,
        request: EmbedContentRequest,
    ) -> Result<EmbedContentResponse, ProviderError> {
        let body = json!({
            "model": request.model,
            "input": request.texts,
            "encoding_format": "float",
        });

        debug!(
            provider = %self.name,
            model = %request.model,
            count = request.texts.len(),
            "Sending embedding request"
        );

        let response = self.post("/embeddings", &body).await?;
        let mut api_resp: EmbeddingApiResponse = response.json().await.map_err(|e| {
            ProviderError::Protocol(format!("failed to parse embedding response: {e}"))
        })?;
        api_resp.data.sort_by_key(|d| d.index);

        Ok(EmbedContentResponse {
            embeddings: api_resp.data.into_iter().map(|d| d.embedding).collect(),
        })
    }
}

fn message_to_content(message: ApiMessage) -> Content {
    let mut parts = Vec::new();
    if let Some(text) = message.content.filter(|t| !t.is_empty()) {
        parts.push(Part::text(text));
    }
    for call in message.tool_calls.unwrap_or_default() {
        parts.push(Part::function_call(FunctionCall {
            args: parse_arguments(&call.function.name, &call.function.arguments),
            id: Some(call.id).filter(|id| !id.is_empty()),
            name: call.function.name,
        }));
    }
    Content::model(parts)
}

/// Arguments arrive as a JSON string; an empty string means no arguments.
fn parse_arguments(tool: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(tool, error = %e, "Tool call arguments are not valid JSON");
        Value::String(raw.to_string())
    })
}

/// Assembles streamed chat-completion deltas.
#[derive(Default)]
struct OpenAiDecoder {
    accumulators: BTreeMap<u32, ToolCallAccumulator>,
    done: bool,
}

impl OpenAiDecoder {
    fn flush_calls(&mut self, finish_reason: Option<String>) -> Option<GenerateContentResponse> {
        if self.accumulators.is_empty() {
            return None;
        }
        let parts = std::mem::take(&mut self.accumulators)
            .into_values()
            .map(|acc| Part::function_call(acc.into_call()))
            .collect();
        let mut response = GenerateContentResponse::from_content(Content::model(parts));
        response.candidates[0].finish_reason = finish_reason;
        Some(response)
    }
}

impl FrameDecoder for OpenAiDecoder {
    fn decode(&mut self, frame: Frame) -> Result<Vec<GenerateContentResponse>, ProviderError> {
        // "[DONE]" signals end of stream
        if frame.data == "[DONE]" {
            self.done = true;
            return Ok(self.flush_calls(None).into_iter().collect());
        }

        let chunk: StreamResponse = frame.json()?;

        let mut out = Vec::new();
        if let Some(choice) = chunk.choices.into_iter().next() {
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let acc = self.accumulators.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    acc.id = id;
                }
                if let Some(func) = delta.function {
                    if let Some(name) = func.name {
                        acc.name = name;
                    }
                    if let Some(args) = func.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }

            if let Some(text) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(GenerateContentResponse::from_content(Content::model(vec![
                    Part::text(text),
                ])));
            }

            if choice.finish_reason.is_some() {
                out.extend(self.flush_calls(choice.finish_reason));
            }
        }

        if let Some(usage) = chunk.usage {
            out.push(GenerateContentResponse {
                usage_metadata: Some(usage.into()),
                ..Default::default()
            });
        }
        Ok(out)
    }

    fn finish(&mut self) -> Vec<GenerateContentResponse> {
        self.flush_calls(None).into_iter().collect()
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Accumulates incremental tool call deltas into a complete call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_call(self) -> FunctionCall {
        FunctionCall {
            args: parse_arguments(&self.name, &self.arguments),
            id: Some(self.id).filter(|id| !id.is_empty()),
            name: self.name,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<ApiUsage> for UsageMetadata {
    fn from(u: ApiUsage) -> Self {
        Self {
            prompt_token_count: u.prompt_tokens,
            candidates_token_count: u.completion_tokens,
            total_token_count: u.total_tokens,
        }
    }
}

// --- Embedding API types ---

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta: arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use kestrel_core::FunctionResponse;

    fn frame(data: &str) -> Frame {
        Frame {
            event: None,
            data: data.into(),
        }
    }

    #[test]
    fn ollama_constructor() {
        let generator = OpenAiCompatGenerator::ollama(None);
        assert_eq!(generator.name(), "ollama");
        assert!(generator.base_url.contains("localhost:11434"));
    }

    #[test]
    fn content_conversion_round_trip_of_a_tool_exchange() {
        let contents = vec![
            Content::user_text("list /tmp"),
            Content::model(vec![
                Part::text("Sure."),
                Part::function_call(FunctionCall {
                    id: Some("call_1".into()),
                    name: "ls".into(),
                    args: json!({ "path": "/tmp" }),
                }),
            ]),
            Content::user(vec![Part::function_response(FunctionResponse {
                id: Some("call_1".into()),
                name: "ls".into(),
                response: json!({ "output": "a b" }),
            })]),
        ];
        let msgs = OpenAiCompatGenerator::to_api_messages(Some("be brief"), &contents);
        let roles: Vec<_> = msgs.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);

        let call = &msgs[2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.function.arguments, r#"{"path":"/tmp"}"#);
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("call_1"));
        assert!(msgs[3].content.as_ref().unwrap().contains("a b"));
    }

    #[test]
    fn call_without_id_is_keyed_by_name() {
        let contents = vec![
            Content::model(vec![Part::function_call(FunctionCall {
                id: None,
                name: "pwd".into(),
                args: json!({}),
            })]),
            Content::user(vec![Part::function_response(FunctionResponse {
                id: None,
                name: "pwd".into(),
                response: json!({ "output": "/" }),
            })]),
        ];
        let msgs = OpenAiCompatGenerator::to_api_messages(None, &contents);
        assert_eq!(msgs[0].tool_calls.as_ref().unwrap()[0].id, "pwd");
        assert_eq!(msgs[1].tool_call_id.as_deref(), Some("pwd"));
    }

    #[test]
    fn tool_choice_mapping() {
        assert_eq!(OpenAiCompatGenerator::to_api_tool_choice(&ToolChoice::Any), json!("required"));
        assert_eq!(
            OpenAiCompatGenerator::to_api_tool_choice(&ToolChoice::Functions(vec!["ls".into()]))["function"]["name"],
            "ls"
        );
    }

    #[test]
    fn body_carries_sampling_and_tools() {
        let req = GenerateContentRequest::new("gpt-4o", vec![Content::user_text("hi")])
            .with_generation_config(kestrel_core::GenerationConfig {
                temperature: Some(0.2),
                max_output_tokens: Some(100),
                stop_sequences: vec!["END".into()],
                ..Default::default()
            })
            .with_tools(vec![FunctionDeclaration {
                name: "now".into(),
                description: "time".into(),
                parameters: None,
            }])
            .with_tool_choice(ToolChoice::Auto);
        let body = OpenAiCompatGenerator::body(&req, true);
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["stop"][0], "END");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn decoder_assembles_tool_call_deltas() {
        let mut decoder = OpenAiDecoder::default();
        let mut out = Vec::new();
        for data in [
            r#"{"choices":[{"delta":{"content":"Let me check"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"search","arguments":""}},{"index":1,"id":"call_b","function":{"name":"calc","arguments":"{\"e\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"\"2+2\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            "[DONE]",
        ] {
            out.extend(decoder.decode(frame(data)).unwrap());
        }
        assert!(decoder.is_done());

        assert_eq!(out[0].text().as_deref(), Some("Let me check"));
        let calls = out[1].function_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].args, json!({}));
        assert_eq!(calls[1].id.as_deref(), Some("call_b"));
        assert_eq!(calls[1].args, json!({ "e": "2+2" }));
        assert_eq!(out[1].candidates[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(out[2].usage_metadata.as_ref().unwrap().total_token_count, 15);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn decoder_flushes_calls_at_end_without_done() {
        let mut decoder = OpenAiDecoder::default();
        decoder
            .decode(frame(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"x","function":{"name":"pwd","arguments":""}}]}}]}"#))
            .unwrap();
        let tail = decoder.finish();
        assert_eq!(tail[0].function_calls()[0].name, "pwd");
    }

    #[test]
    fn unparseable_chunk_is_a_protocol_error() {
        let mut decoder = OpenAiDecoder::default();
        let err = decoder.decode(frame("{garbage")).unwrap_err();
        assert!(matches!(err, ProviderError::Protocol(_)));
    }

    #[tokio::test]
    async fn malformed_chunk_ends_stream_with_error() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;
        let g = OpenAiCompatGenerator::new("test", server.uri(), "k");

        let mut rx = g
            .generate_content_stream(GenerateContentRequest::new("gpt-4o", vec![Content::user_text("hi")]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().text().as_deref(), Some("Hi"));
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, ProviderError::Protocol(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn completion_maps_tool_calls() {
        let body = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{ "id": "c1", "type": "function",
                                     "function": { "name": "ls", "arguments": "{\"path\":\".\"}" } }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7 }
        });
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;
        let g = OpenAiCompatGenerator::new("test", server.uri(), "sk-test");

        let resp = g
            .generate_content(GenerateContentRequest::new("gpt-4o", vec![Content::user_text("ls")]))
            .await
            .unwrap();
        let calls = resp.function_calls();
        assert_eq!(calls[0].id.as_deref(), Some("c1"));
        assert_eq!(calls[0].args["path"], ".");
        assert_eq!(resp.usage_metadata.unwrap().candidates_token_count, 4);
    }

    #[tokio::test]
    async fn embeddings_sorted_by_index() {
        let body = json!({
            "data": [
                { "embedding": [0.4], "index": 1 },
                { "embedding": [0.1], "index": 0 }
            ],
            "model": "text-embedding-3-small"
        });
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        let g = OpenAiCompatGenerator::new("test", server.uri(), "k");
        let resp = g
            .embed_content(EmbedContentRequest {
                model: "text-embedding-3-small".into(),
                texts: vec!["a".into(), "b".into()],
            })
            .await
            .unwrap();
        assert_eq!(resp.embeddings, vec![vec![0.1], vec![0.4]]);
    }
}
