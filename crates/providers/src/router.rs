//! Generator router: selects a backend and model per task category.
//!
//! The default backend comes from the configured auth type. Named backends
//! from `[providers.*]` can take over individual categories via `[routing]`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_config::{AppConfig, AuthType, ProviderConfig, ProviderKind};
use kestrel_core::{
    ContentGenerator, CountTokensRequest, CountTokensResponse, EmbedContentRequest,
    EmbedContentResponse, GenerateContentRequest, GenerateContentResponse, ProviderError,
    ResponseStream,
};
use tracing::{debug, info};

use crate::anthropic::AnthropicGenerator;
use crate::code_assist::CodeAssistGenerator;
use crate::gemini::GeminiGenerator;
use crate::oauth::OAuthTokenSource;
use crate::openai_compat::OpenAiCompatGenerator;

/// Name under which the auth-selected backend is registered.
pub const DEFAULT_PROVIDER: &str = "default";

/// Kinds of work that can be served by different backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskCategory {
    Chat,
    Fast,
    Embedding,
    Code,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 4] = [Self::Chat, Self::Fast, Self::Embedding, Self::Code];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Fast => "fast",
            Self::Embedding => "embedding",
            Self::Code => "code",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ProviderError::NotConfigured(format!("unknown task category '{s}'")))
    }
}

/// A backend and the model to ask it for.
#[derive(Clone)]
pub struct Route {
    pub generator: Arc<dyn ContentGenerator>,
    pub model: String,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("generator", &self.generator.name())
            .field("model", &self.model)
            .finish()
    }
}

/// Routes task categories to registered generators.
pub struct GeneratorRouter {
    generators: HashMap<String, Arc<dyn ContentGenerator>>,
    routes: HashMap<TaskCategory, (String, String)>,
    default_model: String,
    embedding_model: String,
}

impl GeneratorRouter {
    pub fn new(default_model: impl Into<String>, embedding_model: impl Into<String>) -> Self {
        Self {
            generators: HashMap::new(),
            routes: HashMap::new(),
            default_model: default_model.into(),
            embedding_model: embedding_model.into(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, generator: Arc<dyn ContentGenerator>) {
        self.generators.insert(name.into(), generator);
    }

    /// Send `category` to a registered generator, optionally with its own model.
    pub fn route(&mut self, category: TaskCategory, provider: impl Into<String>, model: impl Into<String>) {
        self.routes.insert(category, (provider.into(), model.into()));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ContentGenerator>> {
        self.generators.get(name).cloned()
    }

    /// Resolve the backend for a category. Unrouted categories use the
    /// default backend.
    pub fn resolve(&self, category: TaskCategory) -> Result<Route, ProviderError> {
        let (provider, model) = match self.routes.get(&category) {
            Some((provider, model)) => (provider.as_str(), model.clone()),
            None => {
                let model = match category {
                    TaskCategory::Embedding => self.embedding_model.clone(),
                    _ => self.default_model.clone(),
                };
                (DEFAULT_PROVIDER, model)
            }
        };
        let generator = self.get(provider).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "no backend '{provider}' available for {category} requests"
            ))
        })?;
        Ok(Route { generator, model })
    }

    /// List all registered generator names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.generators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Build the router from configuration.
///
/// Named providers are always registered. The default backend is registered
/// when its credentials are present; otherwise only categories routed to
/// named providers resolve.
pub fn build_from_config(config: &AppConfig) -> GeneratorRouter {
    let mut router = GeneratorRouter::new(&config.model, &config.embedding_model);

    for (name, provider) in &config.providers {
        router.register(name.clone(), build_named(name, provider, config));
    }

    match build_default(config) {
        Ok(generator) => {
            info!(auth = ?config.auth, backend = generator.name(), "Default backend ready");
            router.register(DEFAULT_PROVIDER, generator);
        }
        Err(e) => debug!(error = %e, "Default backend unavailable"),
    }

    for (category, route) in &config.routing {
        let Ok(category) = category.parse::<TaskCategory>() else {
            continue;
        };
        let model = route
            .model
            .clone()
            .or_else(|| {
                config
                    .providers
                    .get(&route.provider)
                    .and_then(|p| p.default_model.clone())
            })
            .unwrap_or_else(|| match category {
                TaskCategory::Embedding => config.embedding_model.clone(),
                _ => config.model.clone(),
            });
        router.route(category, route.provider.clone(), model);
    }

    router
}

/// The backend selected by `auth`.
pub fn build_default(config: &AppConfig) -> Result<Arc<dyn ContentGenerator>, ProviderError> {
    let require_key = || {
        config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "auth type {:?} needs an API key (set KESTREL_API_KEY or GEMINI_API_KEY)",
                config.auth
            ))
        })
    };

    let generator: Arc<dyn ContentGenerator> = match config.auth {
        AuthType::GeminiApiKey => Arc::new(GeminiGenerator::new(require_key()?)),
        // Only express mode is supported; it authenticates with an API key.
        AuthType::VertexAi => Arc::new(GeminiGenerator::vertex_express(require_key()?)),
        AuthType::OauthPersonal => {
            let tokens = OAuthTokenSource::new(
                config.oauth_credentials_path(),
                config.oauth.client_id.clone(),
                config.oauth.client_secret.clone(),
            );
            Arc::new(
                CodeAssistGenerator::new(&config.code_assist_endpoint, Arc::new(tokens))
                    .with_project(config.project.clone()),
            )
        }
        AuthType::OpenaiCompatible => Arc::new(OpenAiCompatGenerator::new(
            "openai",
            default_base_url("openai"),
            require_key()?,
        )),
        AuthType::Anthropic => Arc::new(AnthropicGenerator::new(require_key()?)),
    };
    Ok(generator)
}

fn build_named(name: &str, provider: &ProviderConfig, config: &AppConfig) -> Arc<dyn ContentGenerator> {
    let api_key = provider
        .api_key
        .clone()
        .or_else(|| config.api_key.clone())
        .unwrap_or_default();

    match provider.kind {
        ProviderKind::Gemini => {
            let mut g = GeminiGenerator::new(api_key).with_name(name);
            if let Some(url) = &provider.api_url {
                g = g.with_base_url(url);
            }
            Arc::new(g)
        }
        ProviderKind::Anthropic => {
            let mut g = AnthropicGenerator::new(api_key);
            if let Some(url) = &provider.api_url {
                g = g.with_base_url(url);
            }
            Arc::new(g)
        }
        ProviderKind::OpenaiCompatible => {
            let base_url = provider
                .api_url
                .clone()
                .unwrap_or_else(|| default_base_url(name));
            Arc::new(OpenAiCompatGenerator::new(name, base_url, api_key))
        }
    }
}

/// Get the default base URL for well-known OpenAI-compatible providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => "http://localhost:8080/v1".into(),
    }
}

/// A generator that sends generation to the chat backend and embeddings to
/// the embedding backend. Requests with an empty model get the route's model.
pub struct HybridGenerator {
    chat: Route,
    embedding: Route,
}

impl HybridGenerator {
    pub fn new(chat: Route, embedding: Route) -> Self {
        Self { chat, embedding }
    }

    pub fn from_router(router: &GeneratorRouter) -> Result<Self, ProviderError> {
        Ok(Self::new(
            router.resolve(TaskCategory::Chat)?,
            router.resolve(TaskCategory::Embedding)?,
        ))
    }

    pub fn chat_model(&self) -> &str {
        &self.chat.model
    }

    fn with_chat_model(&self, mut request: GenerateContentRequest) -> GenerateContentRequest {
        if request.model.is_empty() {
            request.model = self.chat.model.clone();
        }
        request
    }
}

#[async_trait]
impl ContentGenerator for HybridGenerator {
    fn name(&self) -> &str {
        self.chat.generator.name()
    }

    async fn generate_content(
        &self,
        request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        self.chat
            .generator
            .generate_content(self.with_chat_model(request))
            .await
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ProviderError> {
        self.chat
            .generator
            .generate_content_stream(self.with_chat_model(request))
            .await
    }

    async fn count_tokens(
        &self,
        mut request: CountTokensRequest,
    ) -> Result<CountTokensResponse, ProviderError> {
        if request.model.is_empty() {
            request.model = self.chat.model.clone();
        }
        self.chat.generator.count_tokens(request).await
    }

    async fn embed_content(
        &self,
        mut request: EmbedContentRequest,
    ) -> Result<EmbedContentResponse, ProviderError> {
        if request.model.is_empty() {
            request.model = self.embedding.model.clone();
        }
        self.embedding.generator.embed_content(request).await
    }
}
