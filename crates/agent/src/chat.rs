//! Conversation history and request building for one generator.

use std::sync::Arc;

use kestrel_core::{
    Content, ContentGenerator, FunctionDeclaration, GenerateContentRequest, GenerationConfig, Part,
    ProviderError, ResponseStream,
};
use tracing::debug;

/// A conversation with a content generator.
///
/// History holds only completed exchanges: the user's parts and the model's
/// reply are appended together once the reply has fully streamed.
pub struct Chat {
    generator: Arc<dyn ContentGenerator>,
    model: String,
    system_instruction: Option<String>,
    generation_config: GenerationConfig,
    history: Vec<Content>,
}

impl Chat {
    pub fn new(generator: Arc<dyn ContentGenerator>, model: impl Into<String>) -> Self {
        Self {
            generator,
            model: model.into(),
            system_instruction: None,
            generation_config: GenerationConfig::default(),
            history: Vec::new(),
        }
    }

    pub fn with_system_instruction(mut self, instruction: Option<String>) -> Self {
        self.system_instruction = instruction;
        self
    }

    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = config;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn generator(&self) -> &Arc<dyn ContentGenerator> {
        &self.generator
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    pub fn add_history(&mut self, content: Content) {
        self.history.push(content);
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// History plus a new user turn made of `parts`.
    pub fn build_request(&self, parts: Vec<Part>, tools: Vec<FunctionDeclaration>) -> GenerateContentRequest {
        let mut contents = self.history.clone();
        contents.push(Content::user(parts));

        let mut request = GenerateContentRequest::new(self.model.clone(), contents)
            .with_generation_config(self.generation_config.clone())
            .with_tools(tools);
        if let Some(instruction) = &self.system_instruction {
            request = request.with_system_instruction(instruction.clone());
        }
        request
    }

    pub async fn send_message_stream(
        &self,
        parts: Vec<Part>,
        tools: Vec<FunctionDeclaration>,
    ) -> Result<ResponseStream, ProviderError> {
        let request = self.build_request(parts, tools);
        debug!(
            generator = %self.generator.name(),
            model = %request.model,
            contents = request.contents.len(),
            tools = request.tools.len(),
            "Sending chat request"
        );
        self.generator.generate_content_stream(request).await
    }

    /// Commit one exchange. Thought parts are dropped and adjacent text
    /// chunks are merged into one part.
    pub fn record_exchange(&mut self, user_parts: Vec<Part>, model_parts: Vec<Part>) {
        self.history.push(Content::user(user_parts));

        let mut merged: Vec<Part> = Vec::with_capacity(model_parts.len());
        for part in model_parts.into_iter().filter(|p| !p.is_thought()) {
            if let (Some(text), Some(last)) = (part.text.as_deref(), merged.last_mut())
                && last.function_call.is_none()
                && let Some(existing) = last.text.as_mut()
            {
                existing.push_str(text);
                continue;
            }
            merged.push(part);
        }
        if !merged.is_empty() {
            self.history.push(Content::model(merged));
        }
    }
}
