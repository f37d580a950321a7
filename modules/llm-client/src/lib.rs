pub mod client;
pub mod mock;
pub mod retry;
pub mod types;

pub use client::LlmHttpClient;
pub use mock::{MockChat, MockEmbed};
pub use retry::RetryPolicy;
pub use types::{ChatRequest, LlmError, Message, MessageRole, StructuredRequest};

use async_trait::async_trait;

/// Chat-completion capability. One implementation per provider plus the
/// deterministic mock.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Plain completion: returns the assistant message text.
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError>;

    /// Schema-guided completion: the provider is constrained to emit JSON
    /// matching `request.schema`. Returns the raw JSON string; callers
    /// deserialize into their own response types.
    async fn complete_structured(&self, request: StructuredRequest) -> Result<String, LlmError>;
}

/// Text-embedding capability.
#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Identifier of the embedding model. Stores tag their collections with
    /// this and refuse cross-model reads.
    fn model_id(&self) -> &str;
}
