//! Configuration loading, validation, and management for Kestrel.
//!
//! Loads configuration from `~/.kestrel/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use kestrel_core::ApprovalMode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Task categories that can be routed to different backends.
pub const TASK_CATEGORIES: &[&str] = &["chat", "fast", "embedding", "code"];

/// How Kestrel authenticates to its default backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    /// Direct hosted API with an API key.
    #[default]
    GeminiApiKey,
    /// Vertex AI express mode (API key) or project/location endpoints.
    VertexAi,
    /// OAuth-proxied Code Assist endpoint using cached personal credentials.
    OauthPersonal,
    /// Any OpenAI-compatible chat completions endpoint.
    OpenaiCompatible,
    /// Anthropic Messages API.
    Anthropic,
}

impl std::str::FromStr for AuthType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gemini-api-key" => Ok(Self::GeminiApiKey),
            "vertex-ai" => Ok(Self::VertexAi),
            "oauth-personal" => Ok(Self::OauthPersonal),
            "openai-compatible" => Ok(Self::OpenaiCompatible),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(ConfigError::ValidationError(format!(
                "unknown auth type '{other}'"
            ))),
        }
    }
}

/// The root configuration structure.
///
/// Maps directly to `~/.kestrel/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub auth: AuthType,

    /// API key for the default backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Cloud project (Vertex AI, Code Assist)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Cloud location (Vertex AI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default = "default_code_assist_endpoint")]
    pub code_assist_endpoint: String,

    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Default model
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,

    /// Upper bound on model exchanges per user message
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Additional named backends
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Task category → backend route
    #[serde(default)]
    pub routing: BTreeMap<String, RouteConfig>,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,

    /// Approval and filesystem settings
    #[serde(default)]
    pub autonomy: AutonomyConfig,
}

fn default_code_assist_endpoint() -> String {
    "https://cloudcode-pa.googleapis.com".into()
}
fn default_model() -> String {
    "gemini-2.5-pro".into()
}
fn default_embedding_model() -> String {
    "gemini-embedding-001".into()
}
fn default_max_turns() -> u32 {
    25
}
fn default_mcp_timeout_ms() -> u64 {
    600_000
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("auth", &self.auth)
            .field("api_key", &redact(&self.api_key))
            .field("project", &self.project)
            .field("location", &self.location)
            .field("code_assist_endpoint", &self.code_assist_endpoint)
            .field("oauth", &self.oauth)
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("max_turns", &self.max_turns)
            .field("providers", &self.providers)
            .field("routing", &self.routing)
            .field("tools", &self.tools)
            .field("mcp_servers", &self.mcp_servers)
            .field("autonomy", &self.autonomy)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Cached credential file (default: ~/.kestrel/oauth_creds.json)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("credentials_path", &self.credentials_path)
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .finish()
    }
}

/// Backend flavor of a named provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Gemini,
    OpenaiCompatible,
    Anthropic,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Which backend and model serve a task category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// A key of `providers`, or "default" for the configured auth backend
    pub provider: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// If non-empty, only these built-in tools are registered
    #[serde(default)]
    pub core: Vec<String>,

    /// Tools never registered, whatever their source
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Prints a JSON array of function declarations on stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_command: Option<String>,

    /// Invoked as `<call_command> <tool_name>` with JSON arguments on stdin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_command: Option<String>,

    /// Programs allowed in addition to the built-in allowlist
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Program for a stdio server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// `host:port` of a socket server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,

    #[serde(default = "default_mcp_timeout_ms")]
    pub timeout_ms: u64,

    /// Skip confirmation for every tool of this server
    #[serde(default)]
    pub trust: bool,
}

impl std::fmt::Debug for McpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env: Vec<&String> = self.env.keys().collect();
        f.debug_struct("McpServerConfig")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &env)
            .field("cwd", &self.cwd)
            .field("tcp", &self.tcp)
            .field("timeout_ms", &self.timeout_ms)
            .field("trust", &self.trust)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyConfig {
    #[serde(default)]
    pub approval_mode: ApprovalMode,

    /// Root that file tools are confined to (default: current directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_dir: Option<String>,

    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,
}

fn default_forbidden_paths() -> Vec<String> {
    vec!["~/.ssh".into(), "~/.gnupg".into(), "~/.aws".into()]
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Default,
            target_dir: None,
            forbidden_paths: default_forbidden_paths(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.kestrel/config.toml).
    ///
    /// Environment overrides:
    /// - `KESTREL_API_KEY`, then `GEMINI_API_KEY`, then `GOOGLE_API_KEY`
    /// - `KESTREL_AUTH`, `KESTREL_MODEL`
    /// - `GOOGLE_CLOUD_PROJECT`, `GOOGLE_CLOUD_LOCATION`
    /// - `KESTREL_TOOL_DISCOVERY_COMMAND`, `KESTREL_TOOL_CALL_COMMAND`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(key) = var("KESTREL_API_KEY")
            .or_else(|| var("GEMINI_API_KEY"))
            .or_else(|| var("GOOGLE_API_KEY"))
        {
            self.api_key = Some(key);
        }
        if let Some(auth) = var("KESTREL_AUTH") {
            self.auth = auth.parse()?;
        }
        if let Some(model) = var("KESTREL_MODEL") {
            self.model = model;
        }
        if let Some(project) = var("GOOGLE_CLOUD_PROJECT") {
            self.project = Some(project);
        }
        if let Some(location) = var("GOOGLE_CLOUD_LOCATION") {
            self.location = Some(location);
        }
        if let Some(cmd) = var("KESTREL_TOOL_DISCOVERY_COMMAND") {
            self.tools.discovery_command = Some(cmd);
        }
        if let Some(cmd) = var("KESTREL_TOOL_CALL_COMMAND") {
            self.tools.call_command = Some(cmd);
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".kestrel")
    }

    /// The root file tools are confined to.
    pub fn target_dir(&self) -> PathBuf {
        match &self.autonomy.target_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Cached OAuth credential file.
    pub fn oauth_credentials_path(&self) -> PathBuf {
        match &self.oauth.credentials_path {
            Some(p) => PathBuf::from(p),
            None => Self::config_dir().join("oauth_creds.json"),
        }
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.max_turns == 0 {
            return Err(ConfigError::ValidationError("max_turns must be > 0".into()));
        }

        for (category, route) in &self.routing {
            if !TASK_CATEGORIES.contains(&category.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "unknown routing category '{category}' (expected one of {})",
                    TASK_CATEGORIES.join(", ")
                )));
            }
            if route.provider != "default" && !self.providers.contains_key(&route.provider) {
                return Err(ConfigError::ValidationError(format!(
                    "routing.{category} references unknown provider '{}'",
                    route.provider
                )));
            }
        }

        for (name, server) in &self.mcp_servers {
            match (&server.command, &server.tcp) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "mcp_servers.{name} needs exactly one of `command` or `tcp`"
                    )));
                }
            }
            if server.timeout_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "mcp_servers.{name}.timeout_ms must be > 0"
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auth: AuthType::default(),
            api_key: None,
            project: None,
            location: None,
            code_assist_endpoint: default_code_assist_endpoint(),
            oauth: OAuthConfig::default(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            temperature: 0.0,
            max_output_tokens: None,
            system_instruction: None,
            max_turns: default_max_turns(),
            providers: HashMap::new(),
            routing: BTreeMap::new(),
            tools: ToolsConfig::default(),
            mcp_servers: BTreeMap::new(),
            autonomy: AutonomyConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
