//! Model backend implementations for Kestrel.
//!
//! All backends implement the `kestrel_core::ContentGenerator` trait.
//! The router selects a backend per task category based on configuration.

pub mod anthropic;
pub mod code_assist;
pub mod gemini;
mod http;
pub mod oauth;
pub mod openai_compat;
pub mod router;
pub mod sse;

pub use anthropic::AnthropicGenerator;
pub use code_assist::CodeAssistGenerator;
pub use gemini::GeminiGenerator;
pub use oauth::{OAuthCredentials, OAuthTokenSource};
pub use openai_compat::OpenAiCompatGenerator;
pub use router::{
    GeneratorRouter, HybridGenerator, Route, TaskCategory, build_default, build_from_config,
};
pub use sse::{Frame, FrameParser};
