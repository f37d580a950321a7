use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    /// Retry budget exhausted against the provider. Upper layers map this to
    /// their own unavailable/degraded handling.
    #[error("llm unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },

    /// Provider answered with a non-retryable error (auth, bad request).
    #[error("llm provider error: {0}")]
    Provider(String),

    /// Provider answered 2xx but the body was not usable.
    #[error("malformed llm response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A plain chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A schema-guided completion request. `schema` is a JSON Schema document
/// (typically generated via `schemars`).
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub messages: Vec<Message>,
    pub schema_name: String,
    pub schema: serde_json::Value,
    pub temperature: Option<f32>,
}

// --- Wire types (OpenAI-compatible) ---

#[derive(Debug, Serialize)]
pub(crate) struct WireChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChatResponse {
    pub choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChoice {
    pub message: WireAssistantMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAssistantMessage {
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireEmbeddingRequest<'a> {
    pub model: &'a str,
    pub input: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireEmbeddingResponse {
    pub data: Vec<WireEmbedding>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireEmbedding {
    pub index: usize,
    pub embedding: Vec<f32>,
}
