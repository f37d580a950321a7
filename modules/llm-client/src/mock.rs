use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::types::{ChatRequest, LlmError, StructuredRequest};
use crate::{ChatModel, EmbedModel};

/// Deterministic chat mock: fixed responses for fixed inputs. A response is
/// selected by the first registered key found as a substring of the request's
/// user content; unmatched requests return the default response or an
/// `Unavailable` error when forced down.
///
/// Builder pattern: `.on()`, `.with_default()`, `.forced_down()`.
pub struct MockChat {
    responses: Vec<(String, String)>,
    default: Option<String>,
    down: bool,
    calls: AtomicU32,
    /// Errors to emit before answering normally; lets tests script
    /// fail-once-then-recover providers.
    fail_first: Mutex<u32>,
}

impl MockChat {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
            default: None,
            down: false,
            calls: AtomicU32::new(0),
            fail_first: Mutex::new(0),
        }
    }

    pub fn on(mut self, key: &str, response: &str) -> Self {
        self.responses.push((key.to_string(), response.to_string()));
        self
    }

    pub fn with_default(mut self, response: &str) -> Self {
        self.default = Some(response.to_string());
        self
    }

    /// Every call fails with `Unavailable`, as if the retry budget were
    /// already exhausted.
    pub fn forced_down(mut self) -> Self {
        self.down = true;
        self
    }

    pub fn failing_first(self, n: u32) -> Self {
        *self.fail_first.lock().unwrap() = n;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, user_content: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down {
            return Err(LlmError::Unavailable {
                attempts: 1,
                reason: "mock forced down".into(),
            });
        }
        {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LlmError::Unavailable {
                    attempts: 1,
                    reason: "mock scripted failure".into(),
                });
            }
        }
        for (key, response) in &self.responses {
            if user_content.contains(key.as_str()) {
                return Ok(response.clone());
            }
        }
        self.default.clone().ok_or_else(|| {
            LlmError::MalformedResponse(format!(
                "MockChat: no response registered matching {user_content:?}"
            ))
        })
    }
}

impl Default for MockChat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for MockChat {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        let user = request
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::types::MessageRole::User))
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        self.answer(user)
    }

    async fn complete_structured(&self, request: StructuredRequest) -> Result<String, LlmError> {
        let user = request
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::types::MessageRole::User))
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        self.answer(user)
    }
}

/// Deterministic embedding mock: unit-normalized vectors derived from a
/// SHA-256 of the text, so equal texts embed equally and distinct texts are
/// (almost surely) distinct. No similarity semantics beyond equality.
pub struct MockEmbed {
    dim: usize,
    model_id: String,
}

impl MockEmbed {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            model_id: "mock-embed".to_string(),
        }
    }

    pub fn with_model_id(mut self, id: &str) -> Self {
        self.model_id = id.to_string();
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim);
        let mut counter: u32 = 0;
        while out.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_be_bytes());
            let digest = hasher.finalize();
            for pair in digest.chunks(2) {
                if out.len() >= self.dim {
                    break;
                }
                let raw = u16::from_be_bytes([pair[0], pair[1]]) as f32;
                out.push(raw / u16::MAX as f32 - 0.5);
            }
            counter += 1;
        }
        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);
        out.iter().map(|v| v / norm).collect()
    }
}

#[async_trait]
impl EmbedModel for MockEmbed {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[tokio::test]
    async fn mock_chat_matches_by_substring() {
        let chat = MockChat::new()
            .on("classify", r#"{"strategy":"semantic"}"#)
            .with_default("fallback");
        let got = chat
            .complete(ChatRequest::new(vec![Message::user("please classify this")]))
            .await
            .unwrap();
        assert_eq!(got, r#"{"strategy":"semantic"}"#);

        let got = chat
            .complete(ChatRequest::new(vec![Message::user("something else")]))
            .await
            .unwrap();
        assert_eq!(got, "fallback");
    }

    #[tokio::test]
    async fn mock_chat_forced_down_is_unavailable() {
        let chat = MockChat::new().forced_down();
        let err = chat
            .complete(ChatRequest::new(vec![Message::user("anything")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn mock_chat_fail_first_then_recovers() {
        let chat = MockChat::new().with_default("ok").failing_first(1);
        assert!(chat
            .complete(ChatRequest::new(vec![Message::user("x")]))
            .await
            .is_err());
        assert_eq!(
            chat.complete(ChatRequest::new(vec![Message::user("x")]))
                .await
                .unwrap(),
            "ok"
        );
    }

    #[tokio::test]
    async fn mock_embed_is_deterministic_and_normalized() {
        let embed = MockEmbed::new(64);
        let a = embed.embed("power requirements").await.unwrap();
        let b = embed.embed("power requirements").await.unwrap();
        let c = embed.embed("mechanical enclosure").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }
}
