use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::types::*;
use crate::{ChatModel, EmbedModel};

/// HTTP client for any provider speaking the OpenAI wire format
/// (`/chat/completions`, `/embeddings`). Owns the retry budget; callers see
/// either a result or `LlmError::Unavailable` after exhaustion.
pub struct LlmHttpClient {
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl LlmHttpClient {
    pub fn new(api_key: &str, base_url: &str, chat_model: &str, embedding_model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_model: chat_model.to_string(),
            embedding_model: embedding_model.to_string(),
            http: reqwest::Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| LlmError::Provider(format!("bad api key header: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// POST with the retry budget. 5xx and transport failures retry;
    /// 4xx fails immediately as a provider error.
    async fn post_with_retry<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<serde_json::Value, LlmError> {
        let url = format!("{}{path}", self.base_url);
        let mut last_reason = String::new();

        for attempt in 0..self.retry.total_attempts() {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
            }

            let response = match self
                .http
                .post(&url)
                .headers(self.headers()?)
                .json(body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_reason = format!("transport: {e}");
                    warn!(target: "llm_client", attempt, error = %e, "provider unreachable");
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| LlmError::MalformedResponse(e.to_string()));
            }

            let text = response.text().await.unwrap_or_default();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                last_reason = format!("{status}: {text}");
                warn!(target: "llm_client", attempt, %status, "provider error, will retry");
                continue;
            }
            return Err(LlmError::Provider(format!("{status}: {text}")));
        }

        Err(LlmError::Unavailable {
            attempts: self.retry.total_attempts(),
            reason: last_reason,
        })
    }

    fn first_choice(value: serde_json::Value) -> Result<String, LlmError> {
        let response: WireChatResponse = serde_json::from_value(value)
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("no assistant message in response".into()))
    }
}

#[async_trait]
impl ChatModel for LlmHttpClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        debug!(target: "llm_client", model = %self.chat_model, "chat request");
        let body = WireChatRequest {
            model: &self.chat_model,
            messages: &request.messages,
            temperature: request.temperature,
            response_format: None,
        };
        let value = self.post_with_retry("/chat/completions", &body).await?;
        Self::first_choice(value)
    }

    async fn complete_structured(&self, request: StructuredRequest) -> Result<String, LlmError> {
        debug!(
            target: "llm_client",
            model = %self.chat_model,
            schema = %request.schema_name,
            "structured chat request"
        );
        let response_format = serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": request.schema_name,
                "schema": request.schema,
                "strict": true,
            }
        });
        let body = WireChatRequest {
            model: &self.chat_model,
            messages: &request.messages,
            temperature: request.temperature,
            response_format: Some(response_format),
        };
        let value = self.post_with_retry("/chat/completions", &body).await?;
        Self::first_choice(value)
    }
}

#[async_trait]
impl EmbedModel for LlmHttpClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = WireEmbeddingRequest {
            model: &self.embedding_model,
            input: serde_json::Value::String(text.to_string()),
        };
        let value = self.post_with_retry("/embeddings", &body).await?;
        let response: WireEmbeddingResponse = serde_json::from_value(value)
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::MalformedResponse("no embedding in response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = WireEmbeddingRequest {
            model: &self.embedding_model,
            input: serde_json::Value::Array(
                texts
                    .iter()
                    .map(|t| serde_json::Value::String(t.clone()))
                    .collect(),
            ),
        };
        let value = self.post_with_retry("/embeddings", &body).await?;
        let mut response: WireEmbeddingResponse = serde_json::from_value(value)
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        // Providers are allowed to reorder; indices are authoritative.
        response.data.sort_by_key(|d| d.index);
        if response.data.len() != texts.len() {
            return Err(LlmError::MalformedResponse(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                response.data.len()
            )));
        }
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_id(&self) -> &str {
        &self.embedding_model
    }
}
