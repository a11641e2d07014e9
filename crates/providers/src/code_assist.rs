//! OAuth-proxied Code Assist generator.
//!
//! Requests go to `{endpoint}/v1internal:{method}` with a bearer token from
//! the cached OAuth credentials. The generation request is wrapped as
//! `{model, project, request}` and every response (streamed or not) arrives
//! wrapped as `{response}`. Streaming uses `alt=sse` with strict framing.

use std::sync::Arc;

use async_trait::async_trait;
use kestrel_core::{
    ContentGenerator, CountTokensRequest, CountTokensResponse, GenerateContentRequest,
    GenerateContentResponse, ProviderError, ResponseStream,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::gemini::WireRequest;
use crate::http::{self, FrameDecoder};
use crate::oauth::OAuthTokenSource;
use crate::sse::{Frame, FrameParser};

const API_VERSION: &str = "v1internal";

pub struct CodeAssistGenerator {
    endpoint: String,
    project: Option<String>,
    tokens: Arc<OAuthTokenSource>,
    client: reqwest::Client,
}

impl CodeAssistGenerator {
    pub fn new(endpoint: impl Into<String>, tokens: Arc<OAuthTokenSource>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project: None,
            tokens,
            client: http::client(300),
        }
    }

    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{API_VERSION}:{method}", self.endpoint)
    }

    fn wrap<'a>(&'a self, request: &'a GenerateContentRequest) -> CaRequest<'a> {
        CaRequest {
            model: &request.model,
            project: self.project.as_deref(),
            request: WireRequest::from(request),
        }
    }

    async fn post(&self, url: &str, body: &impl Serialize) -> Result<reqwest::Response, ProviderError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(http::network)?;
        http::check_status("code-assist", response).await
    }
}

#[async_trait]
impl ContentGenerator for CodeAssistGenerator {
    fn name(&self) -> &str {
        "code-assist"
    }

    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        debug!(model = %request.model, "Code Assist generateContent");
        let response = self
            .post(&self.method_url("generateContent"), &self.wrap(&request))
            .await?;
        let wrapped: CaResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("failed to parse response: {e}")))?;
        Ok(wrapped.response)
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ProviderError> {
        debug!(model = %request.model, "Code Assist streamGenerateContent");
        let url = format!("{}?alt=sse", self.method_url("streamGenerateContent"));
        let response = self.post(&url, &self.wrap(&request)).await?;
        Ok(http::spawn_stream(
            "code-assist".into(),
            response,
            FrameParser::strict(),
            CodeAssistDecoder,
        ))
    }

    async fn count_tokens(
        &self,
        request: CountTokensRequest,
    ) -> Result<CountTokensResponse, ProviderError> {
        let model = request.model.strip_prefix("models/").unwrap_or(&request.model);
        let body = json!({
            "request": {
                "model": format!("models/{model}"),
                "contents": request.contents,
            }
        });
        let response = self.post(&self.method_url("countTokens"), &body).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("failed to parse countTokens response: {e}")))
    }
}

struct CodeAssistDecoder;

impl FrameDecoder for CodeAssistDecoder {
    fn decode(&mut self, frame: Frame) -> Result<Vec<GenerateContentResponse>, ProviderError> {
        let wrapped: CaResponse = frame.json()?;
        Ok(vec![wrapped.response])
    }
}

#[derive(Serialize)]
struct CaRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
    request: WireRequest<'a>,
}

#[derive(Deserialize)]
struct CaResponse {
    #[serde(default)]
    response: GenerateContentResponse,
}
