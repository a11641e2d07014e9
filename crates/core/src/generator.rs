//! ContentGenerator trait: the abstraction over model backends.
//!
//! A generator knows how to send role-tagged content plus tool declarations
//! to a model and get a response back, either whole or as a stream of
//! partial responses.
//!
//! Implementations: direct hosted API, OAuth-proxied Code Assist,
//! OpenAI-compatible endpoints, Anthropic Messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::content::{Content, FunctionCall};
use crate::error::ProviderError;

/// A tool declaration sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// How the model may use the declared tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// The model must call some tool.
    Any,
    /// Tools are declared but must not be called.
    None,
    /// The model must call one of the named tools.
    Functions(Vec<String>),
}

/// Sampling parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

/// A generation request. Every adapter accepts the same shape.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateContentRequest {
    pub model: String,
    pub contents: Vec<Content>,
    pub system_instruction: Option<String>,
    pub generation_config: GenerationConfig,
    pub tools: Vec<FunctionDeclaration>,
    pub tool_choice: Option<ToolChoice>,
}

impl GenerateContentRequest {
    pub fn new(model: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            model: model.into(),
            contents,
            system_instruction: None,
            generation_config: GenerationConfig::default(),
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = config;
        self
    }

    pub fn with_tools(mut self, tools: Vec<FunctionDeclaration>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,

    #[serde(default)]
    pub candidates_token_count: u32,

    #[serde(default)]
    pub total_token_count: u32,
}

/// A complete response, or one partial response of a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl GenerateContentResponse {
    /// A single-candidate model response.
    pub fn from_content(content: Content) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Some(content),
                finish_reason: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: None,
        }
    }

    /// Content of the first candidate.
    pub fn content(&self) -> Option<&Content> {
        self.candidates.first().and_then(|c| c.content.as_ref())
    }

    /// Text of the first candidate, if it has any.
    pub fn text(&self) -> Option<String> {
        let text = self.content()?.text();
        if text.is_empty() { None } else { Some(text) }
    }

    /// Function calls of the first candidate, in appearance order.
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.content()
            .map(|c| c.function_calls().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountTokensRequest {
    pub model: String,
    pub contents: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountTokensResponse {
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedContentRequest {
    pub model: String,
    pub texts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedContentResponse {
    /// One vector per input text, in input order.
    pub embeddings: Vec<Vec<f32>>,
}

/// A finite, non-restartable sequence of partial responses. Dropping the
/// receiver stops the producer.
pub type ResponseStream = mpsc::Receiver<Result<GenerateContentResponse, ProviderError>>;

/// The core ContentGenerator trait.
///
/// The agent loop calls `generate_content_stream()` without knowing which
/// backend is in use. Each call re-sends the full history.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// A human-readable name for this backend (e.g., "gemini", "code-assist").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError>;

    /// Send a request and get a stream of partial responses.
    ///
    /// Default implementation calls `generate_content()` and yields the
    /// result as a single item.
    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let response = self.generate_content(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(response)).await;
        Ok(rx)
    }

    /// Count the tokens a request would consume.
    ///
    /// Default implementation estimates four characters per token.
    async fn count_tokens(
        &self,
        request: CountTokensRequest,
    ) -> Result<CountTokensResponse, ProviderError> {
        Ok(CountTokensResponse {
            total_tokens: estimate_tokens(&request.contents),
        })
    }

    /// Generate one embedding per input text.
    async fn embed_content(
        &self,
        _request: EmbedContentRequest,
    ) -> Result<EmbedContentResponse, ProviderError> {
        Err(ProviderError::NotImplemented(format!(
            "'{}' does not support embeddings",
            self.name()
        )))
    }
}

/// Rough token estimate: four characters of text or serialized call data per token.
pub fn estimate_tokens(contents: &[Content]) -> u32 {
    let chars: usize = contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .map(|p| {
            let text = p.text.as_ref().map_or(0, String::len);
            let call = p
                .function_call
                .as_ref()
                .map_or(0, |f| f.name.len() + f.args.to_string().len());
            let response = p
                .function_response
                .as_ref()
                .map_or(0, |f| f.name.len() + f.response.to_string().len());
            text + call + response
        })
        .sum();
    (chars / 4) as u32
}
