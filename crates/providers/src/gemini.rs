//! Direct hosted-API generator (generative language API, Vertex AI express).
//!
//! Supports:
//! - `generateContent` and `streamGenerateContent?alt=sse`
//! - `countTokens`
//! - `batchEmbedContents`
//! - function declarations and function-calling modes

use async_trait::async_trait;
use kestrel_core::{
    Content, ContentGenerator, CountTokensRequest, CountTokensResponse, EmbedContentRequest,
    EmbedContentResponse, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, ProviderError, ResponseStream, ToolChoice,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::http::{self, FrameDecoder};
use crate::sse::{Frame, FrameParser};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const VERTEX_EXPRESS_BASE_URL: &str = "https://aiplatform.googleapis.com/v1/publishers/google";

/// Generator for the hosted API, authenticated with an API key.
pub struct GeminiGenerator {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiGenerator {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "gemini".into(),
            base_url: GEMINI_BASE_URL.into(),
            api_key: api_key.into(),
            client: http::client(300),
        }
    }

    /// Vertex AI express mode (API key, publisher model paths).
    pub fn vertex_express(api_key: impl Into<String>) -> Self {
        Self::new(api_key)
            .with_name("vertex-ai")
            .with_base_url(VERTEX_EXPRESS_BASE_URL)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{model}:{method}", self.base_url)
    }

    async fn post(&self, url: &str, body: &impl Serialize) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(http::network)?;
        http::check_status(&self.name, response).await
    }
}

#[async_trait]
impl ContentGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending generateContent");
        let url = self.url(&request.model, "generateContent");
        let response = self.post(&url, &WireRequest::from(&request)).await?;
        response.json().await.map_err(|e| {
            ProviderError::Protocol(format!("failed to parse generateContent response: {e}"))
        })
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending streamGenerateContent");
        let url = format!("{}?alt=sse", self.url(&request.model, "streamGenerateContent"));
        let response = self.post(&url, &WireRequest::from(&request)).await?;
        Ok(http::spawn_stream(
            self.name.clone(),
            response,
            FrameParser::strict(),
            GeminiDecoder,
        ))
    }

    async fn count_tokens(
        &self,
        request: CountTokensRequest,
    ) -> Result<CountTokensResponse, ProviderError> {
        let url = self.url(&request.model, "countTokens");
        let response = self.post(&url, &json!({ "contents": request.contents })).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("failed to parse countTokens response: {e}")))
    }

    async fn embed_content(
        &self,
        request: EmbedContentRequest,
    ) -> Result<EmbedContentResponse, ProviderError> {
        let model = request.model.strip_prefix("models/").unwrap_or(&request.model);
        let body = json!({
            "requests": request.texts.iter().map(|text| json!({
                "model": format!("models/{model}"),
                "content": { "parts": [{ "text": text }] },
            })).collect::<Vec<_>>()
        });

        debug!(provider = %self.name, model, count = request.texts.len(), "Sending batchEmbedContents");
        let url = self.url(model, "batchEmbedContents");
        let response = self.post(&url, &body).await?;
        let parsed: BatchEmbedResponse = response.json().await.map_err(|e| {
            ProviderError::Protocol(format!("failed to parse embedding response: {e}"))
        })?;

        if parsed.embeddings.len() != request.texts.len() {
            return Err(ProviderError::Protocol(format!(
                "expected {} embeddings, got {}",
                request.texts.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(EmbedContentResponse {
            embeddings: parsed.embeddings.into_iter().map(|e| e.values).collect(),
        })
    }
}

/// Each frame is one partial `GenerateContentResponse`.
pub(crate) struct GeminiDecoder;

impl FrameDecoder for GeminiDecoder {
    fn decode(&mut self, frame: Frame) -> Result<Vec<GenerateContentResponse>, ProviderError> {
        Ok(vec![frame.json()?])
    }
}

// --- Wire types (shared with the Code Assist adapter) ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<WireToolConfig>,
    generation_config: &'a GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool<'a> {
    function_declarations: &'a [FunctionDeclaration],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireToolConfig {
    function_calling_config: WireFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireFunctionCallingConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_function_names: Option<Vec<String>>,
}

impl<'a> From<&'a GenerateContentRequest> for WireRequest<'a> {
    fn from(req: &'a GenerateContentRequest) -> Self {
        let tools = if req.tools.is_empty() {
            Vec::new()
        } else {
            vec![WireTool {
                function_declarations: &req.tools,
            }]
        };
        let tool_config = req.tool_choice.as_ref().map(|choice| {
            let (mode, allowed_function_names) = match choice {
                ToolChoice::Auto => ("AUTO", None),
                ToolChoice::Any => ("ANY", None),
                ToolChoice::None => ("NONE", None),
                ToolChoice::Functions(names) => ("ANY", Some(names.clone())),
            };
            WireToolConfig {
                function_calling_config: WireFunctionCallingConfig {
                    mode,
                    allowed_function_names,
                },
            }
        });

        Self {
            contents: &req.contents,
            system_instruction: req
                .system_instruction
                .as_ref()
                .map(|s| json!({ "parts": [{ "text": s }] })),
            tools,
            tool_config,
            generation_config: &req.generation_config,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{FunctionCall, Part};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sse_server(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/event-stream"))
            .mount(&server)
            .await;
        server
    }

    fn request() -> GenerateContentRequest {
        GenerateContentRequest::new(
            "gemini-2.5-flash",
            vec![Content::user_text("list files")],
        )
        .with_system_instruction("be brief")
        .with_tools(vec![FunctionDeclaration {
            name: "ls".into(),
            description: "List a directory".into(),
            parameters: Some(json!({ "type": "object", "properties": {} })),
        }])
        .with_tool_choice(ToolChoice::Functions(vec!["ls".into()]))
        .with_generation_config(GenerationConfig {
            temperature: Some(0.0),
            max_output_tokens: Some(256),
            ..Default::default()
        })
    }

    #[test]
    fn wire_request_shape() {
        let req = request();
        let wire = serde_json::to_value(WireRequest::from(&req)).unwrap();
        assert_eq!(wire["contents"][0]["role"], "user");
        assert_eq!(wire["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(wire["tools"][0]["functionDeclarations"][0]["name"], "ls");
        assert_eq!(wire["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
        assert_eq!(
            wire["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"][0],
            "ls"
        );
        assert_eq!(wire["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn wire_request_omits_empty_tools() {
        let req = GenerateContentRequest::new("m", vec![]);
        let wire = serde_json::to_value(WireRequest::from(&req)).unwrap();
        assert!(wire.get("tools").is_none());
        assert!(wire.get("toolConfig").is_none());
        assert!(wire.get("systemInstruction").is_none());
    }

    #[test]
    fn urls_strip_model_prefix() {
        let g = GeminiGenerator::new("k");
        assert_eq!(
            g.url("models/gemini-2.5-pro", "countTokens"),
            format!("{GEMINI_BASE_URL}/models/gemini-2.5-pro:countTokens")
        );
        let v = GeminiGenerator::vertex_express("k");
        assert!(v.url("gemini-2.5-pro", "generateContent").contains("/publishers/google/models/"));
        assert_eq!(v.name(), "vertex-ai");
    }

    #[tokio::test]
    async fn streams_frames_from_server() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"},",
            "{\"functionCall\":{\"name\":\"ls\",\"args\":{\"path\":\"/\"}}}]}}]}\r\n\r\n",
        );
        let server = sse_server(body).await;
        let g = GeminiGenerator::new("secret").with_base_url(server.uri());

        let mut rx = g.generate_content_stream(request()).await.unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());

        assert_eq!(first.text().as_deref(), Some("Hel"));
        assert_eq!(second.text().as_deref(), Some("lo"));
        assert_eq!(
            second.function_calls(),
            vec![FunctionCall {
                id: None,
                name: "ls".into(),
                args: json!({ "path": "/" })
            }]
        );

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].headers.get("x-goog-api-key").unwrap(), "secret");
        let sent: serde_json::Value = requests[0].body_json().unwrap();
        assert_eq!(sent["contents"][0]["parts"][0]["text"], "list files");
    }

    #[tokio::test]
    async fn malformed_stream_line_is_fatal() {
        let body = "data: {\"candidates\":[]}\n\nthis is not sse\n\ndata: {}\n\n";
        let server = sse_server(body).await;
        let g = GeminiGenerator::new("k").with_base_url(server.uri());

        let mut rx = g.generate_content_stream(request()).await.unwrap();
        assert!(rx.recv().await.unwrap().is_ok());
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, ProviderError::Protocol(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn auth_failure_maps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-goog-api-key", "bad"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({})))
            .mount(&server)
            .await;
        let g = GeminiGenerator::new("bad").with_base_url(server.uri());
        let err = g.generate_content(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn unknown_model_maps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-9:generateContent"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({ "error": { "message": "models/gemini-9 is not found" } })),
            )
            .mount(&server)
            .await;
        let g = GeminiGenerator::new("k").with_base_url(server.uri());
        let err = g
            .generate_content(GenerateContentRequest::new("gemini-9", vec![Content::user_text("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ModelNotFound(m) if m.contains("gemini-9 is not found")));
    }

    #[tokio::test]
    async fn embeddings_in_input_order() {
        let body = json!({ "embeddings": [{ "values": [0.1, 0.2] }, { "values": [0.3] }] });
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-embedding-001:batchEmbedContents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        let g = GeminiGenerator::new("k").with_base_url(server.uri());

        let resp = g
            .embed_content(EmbedContentRequest {
                model: "gemini-embedding-001".into(),
                texts: vec!["a".into(), "b".into()],
            })
            .await
            .unwrap();
        assert_eq!(resp.embeddings, vec![vec![0.1, 0.2], vec![0.3]]);

        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = requests[0].body_json().unwrap();
        assert_eq!(sent["requests"][1]["content"]["parts"][0]["text"], "b");
        assert_eq!(sent["requests"][0]["model"], "models/gemini-embedding-001");
    }

    #[test]
    fn decoder_parses_each_frame() {
        let frame = Frame {
            event: None,
            data: serde_json::to_string(&GenerateContentResponse::from_content(Content::model(
                vec![Part::text("x")],
            )))
            .unwrap(),
        };
        let out = GeminiDecoder.decode(frame).unwrap();
        assert_eq!(out[0].text().as_deref(), Some("x"));
    }
}
