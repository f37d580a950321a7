use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The only packet version this host accepts.
pub const PACKET_VERSION: &str = "1.0";

/// Scheme prefix for cross-packet entity references.
pub const KP_SCHEME: &str = "kp://";

// --- Source & content classification ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Document,
    SpreadsheetRow,
    SpreadsheetSheet,
    CodeFile,
    CodeSymbol,
    Other,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Document => write!(f, "document"),
            ContentType::SpreadsheetRow => write!(f, "spreadsheet_row"),
            ContentType::SpreadsheetSheet => write!(f, "spreadsheet_sheet"),
            ContentType::CodeFile => write!(f, "code_file"),
            ContentType::CodeSymbol => write!(f, "code_symbol"),
            ContentType::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "document" => Ok(Self::Document),
            "spreadsheet_row" => Ok(Self::SpreadsheetRow),
            "spreadsheet_sheet" => Ok(Self::SpreadsheetSheet),
            "code_file" => Ok(Self::CodeFile),
            "code_symbol" => Ok(Self::CodeSymbol),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown ContentType: {other}")),
        }
    }
}

/// Which brain a plugin wants served first for this packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PriorityBrain {
    Vector,
    Analytical,
    Graph,
    None,
}

impl std::fmt::Display for PriorityBrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriorityBrain::Vector => write!(f, "vector"),
            PriorityBrain::Analytical => write!(f, "analytical"),
            PriorityBrain::Graph => write!(f, "graph"),
            PriorityBrain::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for PriorityBrain {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "vector" => Ok(Self::Vector),
            "analytical" => Ok(Self::Analytical),
            "graph" => Ok(Self::Graph),
            "none" => Ok(Self::None),
            other => Err(format!("unknown PriorityBrain: {other}")),
        }
    }
}

/// One of the four stores a packet can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BrainKind {
    Vector,
    Analytical,
    Graph,
    Linguistic,
}

impl std::fmt::Display for BrainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrainKind::Vector => write!(f, "vector"),
            BrainKind::Analytical => write!(f, "analytical"),
            BrainKind::Graph => write!(f, "graph"),
            BrainKind::Linguistic => write!(f, "linguistic"),
        }
    }
}

impl std::str::FromStr for BrainKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "vector" => Ok(Self::Vector),
            "analytical" => Ok(Self::Analytical),
            "graph" => Ok(Self::Graph),
            "linguistic" => Ok(Self::Linguistic),
            other => Err(format!("unknown BrainKind: {other}")),
        }
    }
}

// --- Packet lifecycle ---

/// Terminal and in-flight states of a packet moving through ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PacketState {
    Pending,
    InFlight,
    Committed,
    PartiallyCommitted,
    Rejected,
}

impl std::fmt::Display for PacketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketState::Pending => write!(f, "pending"),
            PacketState::InFlight => write!(f, "in_flight"),
            PacketState::Committed => write!(f, "committed"),
            PacketState::PartiallyCommitted => write!(f, "partially_committed"),
            PacketState::Rejected => write!(f, "rejected"),
        }
    }
}

// --- Knowledge Packet ---

/// Producer identity and origin of a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PacketSource {
    pub plugin_name: String,
    pub plugin_version: String,
    /// Where the content came from: a path, URL, sheet coordinate, symbol path.
    pub origin_locator: String,
    pub content_type: ContentType,
}

/// Small typed metadata fields, plus plugin-specific extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PacketMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Plugin-specific keys. BTreeMap keeps canonical serialization stable.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A single text chunk destined for the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Chunk {
    pub text: String,
    pub ordinal: u32,
}

/// Content section for the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VectorContent {
    pub chunks: Vec<Chunk>,
    /// Model the plugin assumed when chunking. The adapter re-embeds with the
    /// process-wide model and rejects searches under a different one.
    pub embedding_model: String,
    pub chunk_strategy: String,
}

/// Closed set of column types for analytical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl ColumnType {
    /// Whether a JSON cell value is admissible under this column type.
    /// Null is admissible everywhere.
    pub fn admits(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::String, Value::String(_)) => true,
            (ColumnType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Timestamp, Value::String(s)) => {
                DateTime::parse_from_rfc3339(s).is_ok()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Optional tabular payload for spreadsheet-like sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalyticalTable {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Content section for the analytical store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalyticalContent {
    /// name → typed scalar.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<AnalyticalTable>,
}

impl AnalyticalContent {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.table.is_none()
    }
}

/// An entity node emitted by a plugin. `id` is packet-local; the graph store
/// fully qualifies it as `kp://<packet_id>/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// A relationship edge. Endpoints are packet-local entity ids or canonical
/// `kp://<packet_id>/<entity_id>` cross-packet references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Content section for the graph store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GraphContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
}

impl GraphContent {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// The three optional store-facing sections. At least one must be non-empty
/// for a packet to validate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PacketContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytical: Option<AnalyticalContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphContent>,
}

/// Routing and quality hints from the producing plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoutingHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_brain: Option<PriorityBrain>,
    /// In [0, 1]. How much semantic search should trust this packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_weight: Option<f32>,
    /// In [0, 1]. Plugin's confidence in its own extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_confidence: Option<f32>,
}

/// The canonical unit crossing plugin↔host and host↔router. Immutable once
/// created; `packet_id` is the SHA-256 of the canonical serialization of
/// every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KnowledgePacket {
    pub packet_version: String,
    pub packet_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: PacketSource,
    #[serde(default)]
    pub metadata: PacketMetadata,
    #[serde(default)]
    pub content: PacketContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<RoutingHints>,
}

impl KnowledgePacket {
    /// The brains this packet's content sections address, in the router's
    /// fixed order. Empty sections do not count.
    pub fn content_brains(&self) -> Vec<BrainKind> {
        let mut brains = Vec::new();
        if self
            .content
            .vector
            .as_ref()
            .is_some_and(|v| !v.chunks.is_empty())
        {
            brains.push(BrainKind::Vector);
        }
        if self
            .content
            .analytical
            .as_ref()
            .is_some_and(|a| !a.is_empty())
        {
            brains.push(BrainKind::Analytical);
        }
        if self.content.graph.as_ref().is_some_and(|g| !g.is_empty()) {
            brains.push(BrainKind::Graph);
        }
        brains
    }

    pub fn priority_brain(&self) -> Option<BrainKind> {
        match self.hints.as_ref().and_then(|h| h.priority_brain) {
            Some(PriorityBrain::Vector) => Some(BrainKind::Vector),
            Some(PriorityBrain::Analytical) => Some(BrainKind::Analytical),
            Some(PriorityBrain::Graph) => Some(BrainKind::Graph),
            _ => None,
        }
    }
}

// --- Cross-packet references ---

/// Build the fully-qualified graph id for an entity in a packet.
pub fn fq_entity_id(packet_id: &str, entity_id: &str) -> String {
    format!("{KP_SCHEME}{packet_id}/{entity_id}")
}

/// Parse a `kp://<packet_id>/<entity_id>` reference.
/// Returns `None` for anything that isn't a well-formed reference.
pub fn parse_kp_ref(value: &str) -> Option<(&str, &str)> {
    let rest = value.strip_prefix(KP_SCHEME)?;
    let (packet_id, entity_id) = rest.split_once('/')?;
    if packet_id.is_empty() || entity_id.is_empty() {
        return None;
    }
    Some((packet_id, entity_id))
}
