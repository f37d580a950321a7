// Trait abstractions for the four brains.
//
// The router and planner only ever see these traits; the Postgres, bolt,
// and LLM-provider implementations live behind them. The in-memory
// implementations in `testing` make the whole pipeline runnable with no
// network, no database, no Docker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use nancy_common::{
    BrainKind, Chunk, ColumnSpec, Entity, EvidenceBundle, ExtractedEntity, Intent,
    KnowledgePacket, Relationship,
};

use crate::error::BrainError;
use crate::predicate::Predicate;

// ---------------------------------------------------------------------------
// Shared result types
// ---------------------------------------------------------------------------

/// One semantic-search result. `distance` is normalized across backends:
/// `[0, ∞)`, lower = closer.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub packet_id: String,
    pub ordinal: u32,
    pub text: String,
    pub distance: f64,
}

/// The per-packet index row of record in the analytical store.
#[derive(Debug, Clone)]
pub struct PacketIndexRow {
    pub packet_id: String,
    pub plugin: String,
    pub content_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub tags: Vec<String>,
    /// Flattened metadata for predicate evaluation and display.
    pub metadata: BTreeMap<String, Value>,
}

impl PacketIndexRow {
    /// Flatten a packet into its index row: identity, source fields, and
    /// metadata, one namespace.
    pub fn from_packet(packet: &KnowledgePacket) -> Self {
        let mut metadata: BTreeMap<String, Value> = packet
            .metadata
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        metadata.insert(
            "packet_id".into(),
            Value::String(packet.packet_id.clone()),
        );
        metadata.insert(
            "plugin".into(),
            Value::String(packet.source.plugin_name.clone()),
        );
        metadata.insert(
            "content_type".into(),
            Value::String(packet.source.content_type.to_string()),
        );
        metadata.insert(
            "origin_locator".into(),
            Value::String(packet.source.origin_locator.clone()),
        );
        if let Some(title) = &packet.metadata.title {
            metadata.insert("title".into(), Value::String(title.clone()));
        }
        if let Some(author) = &packet.metadata.author {
            metadata.insert("author".into(), Value::String(author.clone()));
        }
        if let Some(created_at) = &packet.metadata.created_at {
            metadata.insert("created_at".into(), Value::String(created_at.to_rfc3339()));
        }
        if !packet.metadata.tags.is_empty() {
            metadata.insert(
                "tags".into(),
                Value::Array(
                    packet
                        .metadata
                        .tags
                        .iter()
                        .map(|t| Value::String(t.clone()))
                        .collect(),
                ),
            );
        }
        Self {
            packet_id: packet.packet_id.clone(),
            plugin: packet.source.plugin_name.clone(),
            content_type: packet.source.content_type.to_string(),
            created_at: packet.metadata.created_at,
            title: packet.metadata.title.clone(),
            author: packet.metadata.author.clone(),
            tags: packet.metadata.tags.clone(),
            metadata,
        }
    }
}

/// A compensation marker: the packet still owes writes to `adapters`.
#[derive(Debug, Clone)]
pub struct CompensationRow {
    pub packet_id: String,
    pub adapters: Vec<BrainKind>,
    pub first_failed_at: DateTime<Utc>,
    pub attempts: u32,
}

/// A node in the property graph. `fqid` is `kp://<packet_id>/<entity_id>`
/// for plugin-emitted entities.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub fqid: String,
    pub node_type: String,
    pub properties: BTreeMap<String, Value>,
    /// Packet that owns the node, parsed from the fqid for placeholders.
    pub packet_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub edge_type: String,
    pub properties: BTreeMap<String, Value>,
    pub packet_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone)]
pub struct GraphPath {
    pub nodes: Vec<GraphNode>,
}

// ---------------------------------------------------------------------------
// TextEmbedder
// ---------------------------------------------------------------------------

/// Process-wide embedding function. Configured once at startup; the vector
/// brain tags its collection with `model_id` and refuses cross-model reads.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BrainError>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BrainError>;
    fn model_id(&self) -> &str;
}

// ---------------------------------------------------------------------------
// The four brains
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VectorBrain: Send + Sync {
    /// Idempotent on `(packet_id, ordinal)`. Re-ingesting a packet replaces
    /// its chunks rather than growing the store.
    async fn upsert_chunks(
        &self,
        packet_id: &str,
        chunks: &[Chunk],
        metadata: &BTreeMap<String, Value>,
    ) -> Result<(), BrainError>;

    /// `filter` is a conjunction of metadata equality/range predicates;
    /// other predicate shapes are a caller bug and evaluate to no matches.
    async fn semantic_search(
        &self,
        query_text: &str,
        k: usize,
        filter: Option<&Predicate>,
    ) -> Result<Vec<SearchHit>, BrainError>;

    async fn delete(&self, packet_id: &str) -> Result<(), BrainError>;
}

#[async_trait]
pub trait AnalyticalBrain: Send + Sync {
    /// Upsert the per-packet index row of record, keyed on `packet_id`.
    /// The full packet document rides along so the compensation sweeper can
    /// replay writes without the producing plugin.
    async fn upsert_packet_row(
        &self,
        row: &PacketIndexRow,
        packet: &KnowledgePacket,
    ) -> Result<(), BrainError>;

    /// Load the stored packet document back out of the index of record.
    async fn load_packet(&self, packet_id: &str)
        -> Result<Option<KnowledgePacket>, BrainError>;

    /// Upsert a named tabular payload keyed on `(packet_id, table_name)`.
    async fn upsert_table(
        &self,
        packet_id: &str,
        table_name: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<Value>],
    ) -> Result<(), BrainError>;

    async fn run_structured_query(
        &self,
        predicate: &Predicate,
    ) -> Result<Vec<PacketIndexRow>, BrainError>;

    async fn count(&self, predicate: &Predicate) -> Result<u64, BrainError>;

    async fn delete(&self, packet_id: &str) -> Result<(), BrainError>;

    // --- Compensation bookkeeping (this store is the source of truth) ---

    async fn record_compensation(
        &self,
        packet_id: &str,
        failed: &[BrainKind],
    ) -> Result<(), BrainError>;

    async fn clear_compensation(&self, packet_id: &str) -> Result<(), BrainError>;

    async fn bump_compensation_attempt(&self, packet_id: &str) -> Result<(), BrainError>;

    async fn pending_compensation(&self) -> Result<Vec<CompensationRow>, BrainError>;
}

#[async_trait]
pub trait GraphBrain: Send + Sync {
    /// Idempotent on fqid. Upgrades `unresolved` placeholders in place.
    async fn upsert_entities(
        &self,
        packet_id: &str,
        entities: &[Entity],
    ) -> Result<(), BrainError>;

    /// Idempotent on `(source, target, type)`, properties merged. Endpoints
    /// referencing absent nodes materialize `unresolved` placeholders.
    async fn upsert_relationships(
        &self,
        packet_id: &str,
        relationships: &[Relationship],
    ) -> Result<(), BrainError>;

    async fn neighborhood(
        &self,
        node_id: &str,
        depth: u32,
        edge_types: Option<&[String]>,
    ) -> Result<Subgraph, BrainError>;

    async fn find_by_type(
        &self,
        entity_type: &str,
        properties: Option<&BTreeMap<String, Value>>,
    ) -> Result<Vec<GraphNode>, BrainError>;

    async fn shortest_paths(
        &self,
        src: &str,
        dst: &str,
        max_len: u32,
    ) -> Result<Vec<GraphPath>, BrainError>;

    /// Cascade delete of everything tagged with the packet.
    async fn delete(&self, packet_id: &str) -> Result<(), BrainError>;
}

/// The four brains wired together, as the router and planner consume them.
#[derive(Clone)]
pub struct BrainSet {
    pub vector: std::sync::Arc<dyn VectorBrain>,
    pub analytical: std::sync::Arc<dyn AnalyticalBrain>,
    pub graph: std::sync::Arc<dyn GraphBrain>,
    pub linguistic: std::sync::Arc<dyn LinguisticBrain>,
}

#[async_trait]
pub trait LinguisticBrain: Send + Sync {
    async fn classify_intent(&self, query: &str) -> Result<Intent, BrainError>;

    /// Ground an answer in the provided bundles, citing their packet ids.
    /// Must return a short response for empty evidence, not fabricate.
    async fn synthesize(
        &self,
        query: &str,
        evidence: &[EvidenceBundle],
    ) -> Result<String, BrainError>;

    /// Entity extraction from free text. Used by the router when a packet
    /// arrives graph-empty but text-rich with `priority_brain == graph`.
    async fn extract_entities(&self, text: &str) -> Result<Vec<ExtractedEntity>, BrainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use nancy_common::{ContentType, PacketContent, PacketMetadata, PacketSource, PACKET_VERSION};

    #[test]
    fn packet_index_row_flattens_source_and_metadata() {
        let packet = KnowledgePacket {
            packet_version: PACKET_VERSION.into(),
            packet_id: "abc".into(),
            timestamp: Utc::now(),
            source: PacketSource {
                plugin_name: "sheets".into(),
                plugin_version: "1".into(),
                origin_locator: "budget.xlsx#Sheet1".into(),
                content_type: ContentType::SpreadsheetSheet,
            },
            metadata: PacketMetadata {
                title: Some("Power Budget".into()),
                author: Some("Mike".into()),
                tags: vec!["power".into()],
                created_at: None,
                extra: [("sheet_rows".to_string(), serde_json::json!(42))]
                    .into_iter()
                    .collect(),
            },
            content: PacketContent::default(),
            hints: None,
        };
        let row = PacketIndexRow::from_packet(&packet);
        assert_eq!(row.packet_id, "abc");
        assert_eq!(row.metadata["plugin"], serde_json::json!("sheets"));
        assert_eq!(
            row.metadata["content_type"],
            serde_json::json!("spreadsheet_sheet")
        );
        assert_eq!(row.metadata["title"], serde_json::json!("Power Budget"));
        assert_eq!(row.metadata["sheet_rows"], serde_json::json!(42));
    }
}
