//! Conversation content: role-tagged turns made of parts.
//!
//! The shapes mirror the generative-language wire format (camelCase JSON), so
//! the hosted adapters can serialize them directly. Other adapters translate
//! from these types into their own message formats.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user, including function responses fed back to the model.
    User,
    /// The model.
    Model,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,

    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self { role: Role::User, parts }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self { role: Role::Model, parts }
    }

    /// A user turn holding a single text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::text(text)])
    }

    /// Concatenated text of all non-thought text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| !p.is_thought())
            .filter_map(|p| p.text.as_deref())
            .collect()
    }

    /// Function calls in the order they appear.
    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(|p| p.function_call.as_ref())
    }
}

/// A single unit of content.
///
/// Exactly one of the payload fields is expected to be set. Unknown fields
/// sent by a backend are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Set by some models on reasoning text that should not be shown as output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn function_call(call: FunctionCall) -> Self {
        Self {
            function_call: Some(call),
            ..Default::default()
        }
    }

    pub fn function_response(response: FunctionResponse) -> Self {
        Self {
            function_response: Some(response),
            ..Default::default()
        }
    }

    pub fn is_thought(&self) -> bool {
        self.thought.unwrap_or(false)
    }
}

/// A model request to invoke a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Backend-assigned call id. Not every backend supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub args: Value,
}

/// The result of a tool invocation, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    pub response: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_format_with_unknown_fields() {
        let raw = json!({
            "role": "model",
            "parts": [
                { "text": "thinking...", "thought": true },
                { "text": "Hello" },
                { "functionCall": { "name": "read_file", "args": { "absolute_path": "/tmp/a" } },
                  "thoughtSignature": "opaque" }
            ]
        });
        let content: Content = serde_json::from_value(raw).unwrap();
        assert_eq!(content.role, Role::Model);
        assert_eq!(content.text(), "Hello");

        let calls: Vec<_> = content.function_calls().collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert!(calls[0].id.is_none());
    }

    #[test]
    fn serializes_function_response_camel_case() {
        let part = Part::function_response(FunctionResponse {
            id: Some("c1".into()),
            name: "ls".into(),
            response: json!({ "output": "a\nb" }),
        });
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["functionResponse"]["name"], "ls");
        assert!(value.get("text").is_none());
    }

    #[test]
    fn user_text_builds_single_part() {
        let content = Content::user_text("hi");
        assert_eq!(content.role, Role::User);
        assert_eq!(content.parts, vec![Part::text("hi")]);
    }
}
