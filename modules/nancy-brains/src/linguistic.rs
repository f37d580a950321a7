use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use tracing::debug;

use llm_client::{ChatModel, ChatRequest, Message, StructuredRequest};
use nancy_common::{EvidenceBundle, ExtractedEntity, Intent};

use crate::error::BrainError;
use crate::traits::LinguisticBrain;

/// How many evidence items per bundle make it into the synthesis prompt.
const MAX_ITEMS_PER_BUNDLE: usize = 10;

/// Bound on the classify cache. Queries repeat in interactive use; the
/// cache is cleared wholesale when full rather than tracking recency.
const INTENT_CACHE_CAP: usize = 256;

#[derive(Debug, Deserialize, JsonSchema)]
struct EntityExtractionResponse {
    entities: Vec<ExtractedEntity>,
}

/// Linguistic brain backed by an LLM provider through `llm-client`.
/// Stateless apart from the bounded intent cache; retry/backoff against the
/// provider lives in the client.
pub struct LlmLinguistic {
    chat: Arc<dyn ChatModel>,
    intent_cache: Mutex<HashMap<String, Intent>>,
}

impl LlmLinguistic {
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self {
            chat,
            intent_cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_get(&self, query: &str) -> Option<Intent> {
        self.intent_cache.lock().ok()?.get(query).cloned()
    }

    fn cache_put(&self, query: &str, intent: &Intent) {
        if let Ok(mut cache) = self.intent_cache.lock() {
            if cache.len() >= INTENT_CACHE_CAP {
                cache.clear();
            }
            cache.insert(query.to_string(), intent.clone());
        }
    }
}

fn classify_prompt(query: &str) -> Vec<Message> {
    vec![
        Message::system(
            "You classify natural-language questions against a knowledge base \
             backed by three stores: vector (semantic text search), analytical \
             (structured metadata), graph (entities and relationships). \
             Respond with the intent as structured JSON. Extract salient \
             noun-phrases into entities and any author/tag/date constraints \
             into filters. Dates become RFC 3339 UTC instants.",
        ),
        Message::user(format!("Classify this query: {query}")),
    ]
}

fn synthesis_prompt(query: &str, evidence: &[EvidenceBundle]) -> Vec<Message> {
    let mut evidence_lines = Vec::new();
    for bundle in evidence {
        evidence_lines.push(format!("From the {} store ({}):", bundle.source, bundle.note));
        for item in bundle.items.iter().take(MAX_ITEMS_PER_BUNDLE) {
            evidence_lines.push(format!(
                "- [{}] {}: {} (packet: {})",
                bundle.source, item.label, item.snippet, item.packet_id
            ));
        }
    }
    let evidence_block = if evidence_lines.is_empty() {
        "No evidence was found.".to_string()
    } else {
        evidence_lines.join("\n")
    };

    vec![
        Message::system(
            "You answer questions about a project knowledge base. Ground every \
             claim in the evidence provided and cite packet ids inline as \
             [packet_id]. If the evidence is empty or irrelevant, say briefly \
             that nothing relevant was found. Never invent content.",
        ),
        Message::user(format!(
            "Question: {query}\n\nEvidence:\n{evidence_block}\n\nAnswer:"
        )),
    ]
}

#[async_trait]
impl LinguisticBrain for LlmLinguistic {
    async fn classify_intent(&self, query: &str) -> Result<Intent, BrainError> {
        if let Some(cached) = self.cache_get(query) {
            return Ok(cached);
        }
        let schema = serde_json::to_value(schema_for!(Intent))
            .map_err(|e| BrainError::Permanent(format!("intent schema: {e}")))?;
        let raw = self
            .chat
            .complete_structured(StructuredRequest {
                messages: classify_prompt(query),
                schema_name: "intent".into(),
                schema,
                temperature: Some(0.0),
            })
            .await?;
        let intent: Intent = serde_json::from_str(&raw)
            .map_err(|e| BrainError::Permanent(format!("intent parse: {e}: {raw}")))?;
        debug!(strategy = %intent.strategy, "Classified query intent");
        self.cache_put(query, &intent);
        Ok(intent)
    }

    async fn synthesize(
        &self,
        query: &str,
        evidence: &[EvidenceBundle],
    ) -> Result<String, BrainError> {
        let answer = self
            .chat
            .complete(ChatRequest::new(synthesis_prompt(query, evidence)).with_temperature(0.3))
            .await?;
        Ok(answer)
    }

    async fn extract_entities(&self, text: &str) -> Result<Vec<ExtractedEntity>, BrainError> {
        let schema = serde_json::to_value(schema_for!(EntityExtractionResponse))
            .map_err(|e| BrainError::Permanent(format!("extraction schema: {e}")))?;
        let raw = self
            .chat
            .complete_structured(StructuredRequest {
                messages: vec![
                    Message::system(
                        "Extract named entities (people, decisions, meetings, \
                         components, documents) from the text as structured \
                         JSON. Include a name property for each.",
                    ),
                    Message::user(text.to_string()),
                ],
                schema_name: "entity_extraction".into(),
                schema,
                temperature: Some(0.0),
            })
            .await?;
        let response: EntityExtractionResponse = serde_json::from_str(&raw)
            .map_err(|e| BrainError::Permanent(format!("extraction parse: {e}")))?;
        Ok(response.entities)
    }
}
