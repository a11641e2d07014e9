//! # Kestrel Core
//!
//! Domain types, traits, and error definitions for the Kestrel agentic CLI
//! runtime. This crate has **no transport dependencies**: it defines the
//! model-facing content shapes, the content-generator contract and the tool
//! contract that every other crate implements against.
//!
//! ## Layout
//!
//! - [`content`]: role-tagged conversation content made of parts
//! - [`generator`]: the `ContentGenerator` trait and its request/response shapes
//! - [`tool`]: the `Tool` trait, results, confirmation details and outcomes
//! - [`schema`]: the JSON-schema subset used for parameter validation
//! - [`event`]: domain events broadcast between subsystems

pub mod content;
pub mod error;
pub mod event;
pub mod generator;
pub mod schema;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use content::{Content, FunctionCall, FunctionResponse, Part, Role};
pub use error::{Error, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use generator::{
    Candidate, ContentGenerator, CountTokensRequest, CountTokensResponse, EmbedContentRequest,
    EmbedContentResponse, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, ResponseStream, ToolChoice, UsageMetadata,
};
pub use tool::{
    ApprovalMode, ConfirmationDetails, ConfirmationKind, ConfirmationOutcome, Tool, ToolKind,
    ToolResult,
};
