// Test doubles for the four brain traits.
//
// - MemoryVectorBrain / MemoryAnalyticalBrain / MemoryGraphBrain — stateful
//   in-memory stores with the same idempotence and placeholder semantics as
//   the production adapters
// - FixedEmbedder (TextEmbedder) — deterministic bag-of-words vectors
// - ScriptedLinguistic (LinguisticBrain) — fixed outputs for fixed inputs
//
// Every brain supports `fail_next(err)`: the next trait-method call on it
// consumes the scripted error. These make the whole pipeline testable with
// no network, no database, no Docker.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use nancy_common::{
    fq_entity_id, parse_kp_ref, BrainKind, Chunk, ColumnSpec, Entity, EvidenceBundle,
    ExtractedEntity, Intent, Relationship,
};

use crate::error::BrainError;
use crate::graph::{props_match, sanitize_rel_type};
use crate::predicate::Predicate;
use crate::traits::{
    AnalyticalBrain, CompensationRow, GraphBrain, GraphEdge, GraphNode, GraphPath,
    LinguisticBrain, PacketIndexRow, SearchHit, Subgraph, TextEmbedder, VectorBrain,
};

/// Standard embedding dimension for test vectors.
pub const TEST_EMBEDDING_DIM: usize = 64;

// ---------------------------------------------------------------------------
// Failure scripting
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FailureScript {
    queue: Mutex<VecDeque<BrainError>>,
}

impl FailureScript {
    fn push(&self, err: BrainError) {
        self.queue.lock().unwrap().push_back(err);
    }

    fn take(&self) -> Result<(), BrainError> {
        match self.queue.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// FixedEmbedder
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embedder: each lowercased token hashes to a
/// dimension and sign, vectors are summed and unit-normalized. Texts sharing
/// words land closer together, which is all the ranking tests need.
pub struct FixedEmbedder {
    dim: usize,
    model_id: String,
}

impl FixedEmbedder {
    pub fn new() -> Self {
        Self {
            dim: TEST_EMBEDDING_DIM,
            model_id: "fixed-embed".into(),
        }
    }

    pub fn with_model_id(mut self, id: &str) -> Self {
        self.model_id = id.to_string();
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let slot = u16::from_be_bytes([digest[0], digest[1]]) as usize % self.dim;
            let sign = if digest[2] % 2 == 0 { 1.0 } else { -1.0 };
            out[slot] += sign;
        }
        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            out.iter_mut().for_each(|v| *v /= norm);
        }
        out
    }
}

impl Default for FixedEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BrainError> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BrainError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------------------------
// MemoryVectorBrain
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct StoredChunk {
    text: String,
    embedding: Vec<f32>,
    metadata: BTreeMap<String, serde_json::Value>,
}

pub struct MemoryVectorBrain {
    embedder: FixedEmbedder,
    chunks: Mutex<HashMap<(String, u32), StoredChunk>>,
    model_tag: Mutex<Option<String>>,
    failures: FailureScript,
}

impl MemoryVectorBrain {
    pub fn new() -> Self {
        Self {
            embedder: FixedEmbedder::new(),
            chunks: Mutex::new(HashMap::new()),
            model_tag: Mutex::new(None),
            failures: FailureScript::default(),
        }
    }

    pub fn with_embedder(mut self, embedder: FixedEmbedder) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn fail_next(&self, err: BrainError) {
        self.failures.push(err);
    }

    pub fn chunk_count(&self, packet_id: &str) -> usize {
        self.chunks
            .lock()
            .unwrap()
            .keys()
            .filter(|(pid, _)| pid == packet_id)
            .count()
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    fn check_model(&self) -> Result<(), BrainError> {
        let tag = self.model_tag.lock().unwrap();
        match tag.as_deref() {
            Some(stored) if stored != self.embedder.model_id() => {
                Err(BrainError::ModelMismatch {
                    stored: stored.to_string(),
                    configured: self.embedder.model_id().to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl Default for MemoryVectorBrain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorBrain for MemoryVectorBrain {
    async fn upsert_chunks(
        &self,
        packet_id: &str,
        chunks: &[Chunk],
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), BrainError> {
        self.failures.take()?;
        self.model_tag
            .lock()
            .unwrap()
            .get_or_insert_with(|| self.embedder.model_id().to_string());
        let mut store = self.chunks.lock().unwrap();
        store.retain(|(pid, _), _| pid != packet_id);
        for chunk in chunks {
            store.insert(
                (packet_id.to_string(), chunk.ordinal),
                StoredChunk {
                    text: chunk.text.clone(),
                    embedding: self.embedder.vector_for(&chunk.text),
                    metadata: metadata.clone(),
                },
            );
        }
        Ok(())
    }

    async fn semantic_search(
        &self,
        query_text: &str,
        k: usize,
        filter: Option<&Predicate>,
    ) -> Result<Vec<SearchHit>, BrainError> {
        self.failures.take()?;
        self.check_model()?;
        let query = self.embedder.vector_for(query_text);
        let store = self.chunks.lock().unwrap();
        let mut hits: Vec<SearchHit> = store
            .iter()
            .filter(|(_, chunk)| match filter {
                Some(pred) => pred.is_conjunctive_filter() && pred.eval(&chunk.metadata),
                None => true,
            })
            .map(|((packet_id, ordinal), chunk)| {
                let dot: f32 = query
                    .iter()
                    .zip(&chunk.embedding)
                    .map(|(a, b)| a * b)
                    .sum();
                SearchHit {
                    packet_id: packet_id.clone(),
                    ordinal: *ordinal,
                    text: chunk.text.clone(),
                    // Cosine distance; embeddings are unit-normalized.
                    distance: (1.0 - dot as f64).max(0.0),
                }
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, packet_id: &str) -> Result<(), BrainError> {
        self.failures.take()?;
        self.chunks
            .lock()
            .unwrap()
            .retain(|(pid, _), _| pid != packet_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryAnalyticalBrain
// ---------------------------------------------------------------------------

pub struct MemoryAnalyticalBrain {
    rows: Mutex<HashMap<String, PacketIndexRow>>,
    packets: Mutex<HashMap<String, nancy_common::KnowledgePacket>>,
    tables: Mutex<HashMap<(String, String), (Vec<ColumnSpec>, Vec<Vec<serde_json::Value>>)>>,
    compensation: Mutex<HashMap<String, CompensationRow>>,
    failures: FailureScript,
}

impl MemoryAnalyticalBrain {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            packets: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            compensation: Mutex::new(HashMap::new()),
            failures: FailureScript::default(),
        }
    }

    pub fn fail_next(&self, err: BrainError) {
        self.failures.push(err);
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn has_packet(&self, packet_id: &str) -> bool {
        self.rows.lock().unwrap().contains_key(packet_id)
    }

    pub fn compensation_for(&self, packet_id: &str) -> Option<CompensationRow> {
        self.compensation.lock().unwrap().get(packet_id).cloned()
    }

    pub fn table_row_count(&self, packet_id: &str, table_name: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(&(packet_id.to_string(), table_name.to_string()))
            .map(|(_, rows)| rows.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryAnalyticalBrain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyticalBrain for MemoryAnalyticalBrain {
    async fn upsert_packet_row(
        &self,
        row: &PacketIndexRow,
        packet: &nancy_common::KnowledgePacket,
    ) -> Result<(), BrainError> {
        self.failures.take()?;
        self.rows
            .lock()
            .unwrap()
            .insert(row.packet_id.clone(), row.clone());
        self.packets
            .lock()
            .unwrap()
            .insert(row.packet_id.clone(), packet.clone());
        Ok(())
    }

    async fn load_packet(
        &self,
        packet_id: &str,
    ) -> Result<Option<nancy_common::KnowledgePacket>, BrainError> {
        self.failures.take()?;
        Ok(self.packets.lock().unwrap().get(packet_id).cloned())
    }

    async fn upsert_table(
        &self,
        packet_id: &str,
        table_name: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<serde_json::Value>],
    ) -> Result<(), BrainError> {
        self.failures.take()?;
        self.tables.lock().unwrap().insert(
            (packet_id.to_string(), table_name.to_string()),
            (columns.to_vec(), rows.to_vec()),
        );
        Ok(())
    }

    async fn run_structured_query(
        &self,
        predicate: &Predicate,
    ) -> Result<Vec<PacketIndexRow>, BrainError> {
        self.failures.take()?;
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<PacketIndexRow> = rows
            .values()
            .filter(|row| predicate.eval(&row.metadata))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn count(&self, predicate: &Predicate) -> Result<u64, BrainError> {
        self.failures.take()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows.values().filter(|row| predicate.eval(&row.metadata)).count() as u64)
    }

    async fn delete(&self, packet_id: &str) -> Result<(), BrainError> {
        self.failures.take()?;
        self.rows.lock().unwrap().remove(packet_id);
        self.packets.lock().unwrap().remove(packet_id);
        self.tables
            .lock()
            .unwrap()
            .retain(|(pid, _), _| pid != packet_id);
        self.compensation.lock().unwrap().remove(packet_id);
        Ok(())
    }

    async fn record_compensation(
        &self,
        packet_id: &str,
        failed: &[BrainKind],
    ) -> Result<(), BrainError> {
        self.failures.take()?;
        let mut compensation = self.compensation.lock().unwrap();
        let entry = compensation
            .entry(packet_id.to_string())
            .or_insert_with(|| CompensationRow {
                packet_id: packet_id.to_string(),
                adapters: Vec::new(),
                first_failed_at: chrono::Utc::now(),
                attempts: 0,
            });
        entry.adapters = failed.to_vec();
        Ok(())
    }

    async fn clear_compensation(&self, packet_id: &str) -> Result<(), BrainError> {
        self.failures.take()?;
        self.compensation.lock().unwrap().remove(packet_id);
        Ok(())
    }

    async fn bump_compensation_attempt(&self, packet_id: &str) -> Result<(), BrainError> {
        self.failures.take()?;
        if let Some(row) = self.compensation.lock().unwrap().get_mut(packet_id) {
            row.attempts += 1;
        }
        Ok(())
    }

    async fn pending_compensation(&self) -> Result<Vec<CompensationRow>, BrainError> {
        self.failures.take()?;
        let mut rows: Vec<CompensationRow> =
            self.compensation.lock().unwrap().values().cloned().collect();
        rows.sort_by(|a, b| a.first_failed_at.cmp(&b.first_failed_at));
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// MemoryGraphBrain
// ---------------------------------------------------------------------------

pub struct MemoryGraphBrain {
    nodes: Mutex<HashMap<String, GraphNode>>,
    edges: Mutex<HashMap<(String, String, String), GraphEdge>>,
    failures: FailureScript,
}

impl MemoryGraphBrain {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            edges: Mutex::new(HashMap::new()),
            failures: FailureScript::default(),
        }
    }

    pub fn fail_next(&self, err: BrainError) {
        self.failures.push(err);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().unwrap().len()
    }

    pub fn get_node(&self, fqid: &str) -> Option<GraphNode> {
        self.nodes.lock().unwrap().get(fqid).cloned()
    }

    pub fn nodes_for_packet(&self, packet_id: &str) -> Vec<GraphNode> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.packet_id == packet_id)
            .cloned()
            .collect()
    }

    fn resolve_endpoint(packet_id: &str, endpoint: &str) -> String {
        if parse_kp_ref(endpoint).is_some() {
            endpoint.to_string()
        } else {
            fq_entity_id(packet_id, endpoint)
        }
    }

    fn ensure_endpoint(nodes: &mut HashMap<String, GraphNode>, fqid: &str) {
        if !nodes.contains_key(fqid) {
            let owner = parse_kp_ref(fqid)
                .map(|(pid, _)| pid.to_string())
                .unwrap_or_default();
            nodes.insert(
                fqid.to_string(),
                GraphNode {
                    fqid: fqid.to_string(),
                    node_type: "unresolved".into(),
                    properties: BTreeMap::new(),
                    packet_id: owner,
                },
            );
        }
    }
}

impl Default for MemoryGraphBrain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphBrain for MemoryGraphBrain {
    async fn upsert_entities(
        &self,
        packet_id: &str,
        entities: &[Entity],
    ) -> Result<(), BrainError> {
        self.failures.take()?;
        let mut nodes = self.nodes.lock().unwrap();
        for entity in entities {
            let fqid = fq_entity_id(packet_id, &entity.id);
            // Upgrades placeholders in place: same fqid, authoritative type.
            nodes.insert(
                fqid.clone(),
                GraphNode {
                    fqid,
                    node_type: entity.entity_type.clone(),
                    properties: entity.properties.clone(),
                    packet_id: packet_id.to_string(),
                },
            );
        }
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        packet_id: &str,
        relationships: &[Relationship],
    ) -> Result<(), BrainError> {
        self.failures.take()?;
        let mut nodes = self.nodes.lock().unwrap();
        let mut edges = self.edges.lock().unwrap();
        for rel in relationships {
            let src = Self::resolve_endpoint(packet_id, &rel.source_id);
            let dst = Self::resolve_endpoint(packet_id, &rel.target_id);
            Self::ensure_endpoint(&mut nodes, &src);
            Self::ensure_endpoint(&mut nodes, &dst);
            let rel_type = sanitize_rel_type(&rel.rel_type);
            let key = (src.clone(), dst.clone(), rel_type.clone());
            let edge = edges.entry(key).or_insert_with(|| GraphEdge {
                source: src,
                target: dst,
                edge_type: rel_type,
                properties: BTreeMap::new(),
                packet_id: packet_id.to_string(),
            });
            edge.properties.extend(rel.properties.clone());
        }
        Ok(())
    }

    async fn neighborhood(
        &self,
        node_id: &str,
        depth: u32,
        edge_types: Option<&[String]>,
    ) -> Result<Subgraph, BrainError> {
        self.failures.take()?;
        let nodes = self.nodes.lock().unwrap();
        let edges = self.edges.lock().unwrap();
        let allowed: Option<HashSet<String>> = edge_types.map(|types| {
            types.iter().map(|t| sanitize_rel_type(t)).collect()
        });

        let mut subgraph = Subgraph::default();
        let Some(origin) = nodes.get(node_id) else {
            return Ok(subgraph);
        };
        subgraph.nodes.push(origin.clone());

        let mut frontier: HashSet<String> = [node_id.to_string()].into();
        let mut seen: HashSet<String> = frontier.clone();
        let mut seen_edges: HashSet<(String, String, String)> = HashSet::new();

        for _ in 0..depth {
            let mut next = HashSet::new();
            for edge in edges.values() {
                if let Some(allowed) = &allowed {
                    if !allowed.contains(&edge.edge_type) {
                        continue;
                    }
                }
                let touches = |fqid: &String| frontier.contains(fqid);
                let other = if touches(&edge.source) {
                    Some(&edge.target)
                } else if touches(&edge.target) {
                    Some(&edge.source)
                } else {
                    None
                };
                let Some(other) = other else { continue };
                let key = (
                    edge.source.clone(),
                    edge.target.clone(),
                    edge.edge_type.clone(),
                );
                if seen_edges.insert(key) {
                    subgraph.edges.push(edge.clone());
                }
                if seen.insert(other.clone()) {
                    if let Some(node) = nodes.get(other) {
                        subgraph.nodes.push(node.clone());
                    }
                    next.insert(other.clone());
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(subgraph)
    }

    async fn find_by_type(
        &self,
        entity_type: &str,
        properties: Option<&BTreeMap<String, serde_json::Value>>,
    ) -> Result<Vec<GraphNode>, BrainError> {
        self.failures.take()?;
        let nodes = self.nodes.lock().unwrap();
        Ok(nodes
            .values()
            .filter(|n| n.node_type == entity_type)
            .filter(|n| properties.is_none_or(|wanted| props_match(&n.properties, wanted)))
            .cloned()
            .collect())
    }

    async fn shortest_paths(
        &self,
        src: &str,
        dst: &str,
        max_len: u32,
    ) -> Result<Vec<GraphPath>, BrainError> {
        self.failures.take()?;
        let nodes = self.nodes.lock().unwrap();
        let edges = self.edges.lock().unwrap();
        if !nodes.contains_key(src) || !nodes.contains_key(dst) {
            return Ok(Vec::new());
        }

        // Breadth-first over undirected edges, collecting every path of the
        // first length that reaches the destination.
        let mut paths: Vec<Vec<String>> = vec![vec![src.to_string()]];
        let mut found: Vec<Vec<String>> = Vec::new();
        for _ in 0..max_len {
            let mut next: Vec<Vec<String>> = Vec::new();
            for path in &paths {
                let tail = path.last().cloned().unwrap_or_default();
                for edge in edges.values() {
                    let other = if edge.source == tail {
                        &edge.target
                    } else if edge.target == tail {
                        &edge.source
                    } else {
                        continue;
                    };
                    if path.contains(other) {
                        continue;
                    }
                    let mut extended = path.clone();
                    extended.push(other.clone());
                    if other == dst {
                        found.push(extended);
                    } else {
                        next.push(extended);
                    }
                }
            }
            if !found.is_empty() {
                break;
            }
            paths = next;
            if paths.is_empty() {
                break;
            }
        }

        Ok(found
            .into_iter()
            .map(|fqids| GraphPath {
                nodes: fqids
                    .iter()
                    .filter_map(|fqid| nodes.get(fqid).cloned())
                    .collect(),
            })
            .collect())
    }

    async fn delete(&self, packet_id: &str) -> Result<(), BrainError> {
        self.failures.take()?;
        self.edges
            .lock()
            .unwrap()
            .retain(|_, edge| edge.packet_id != packet_id);
        self.nodes
            .lock()
            .unwrap()
            .retain(|_, node| node.packet_id != packet_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PacketBuilder
// ---------------------------------------------------------------------------

/// Builder for sealed test packets. Timestamps default to a fixed instant so
/// packet ids are stable across runs.
pub struct PacketBuilder {
    packet: nancy_common::KnowledgePacket,
}

impl PacketBuilder {
    pub fn document(title: &str) -> Self {
        use chrono::TimeZone;
        let packet = nancy_common::KnowledgePacket {
            packet_version: nancy_common::PACKET_VERSION.to_string(),
            packet_id: String::new(),
            timestamp: chrono::Utc
                .with_ymd_and_hms(2024, 11, 2, 10, 0, 0)
                .unwrap(),
            source: nancy_common::PacketSource {
                plugin_name: "test_plugin".into(),
                plugin_version: "0.1.0".into(),
                origin_locator: format!("mem://{}", title.to_lowercase().replace(' ', "-")),
                content_type: nancy_common::ContentType::Document,
            },
            metadata: nancy_common::PacketMetadata {
                title: Some(title.to_string()),
                ..Default::default()
            },
            content: nancy_common::PacketContent::default(),
            hints: None,
        };
        Self { packet }
    }

    pub fn author(mut self, name: &str) -> Self {
        self.packet.metadata.author = Some(name.to_string());
        self
    }

    pub fn created_at(mut self, rfc3339: &str) -> Self {
        self.packet.metadata.created_at = chrono::DateTime::parse_from_rfc3339(rfc3339)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc));
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.packet.metadata.tags.push(tag.to_string());
        self
    }

    pub fn body(mut self, text: &str) -> Self {
        let content = self
            .packet
            .content
            .vector
            .get_or_insert_with(|| nancy_common::VectorContent {
                chunks: Vec::new(),
                embedding_model: "fixed-embed".into(),
                chunk_strategy: "paragraph".into(),
            });
        let ordinal = content.chunks.len() as u32;
        content.chunks.push(Chunk {
            text: text.to_string(),
            ordinal,
        });
        self
    }

    pub fn field(mut self, name: &str, value: serde_json::Value) -> Self {
        self.packet
            .content
            .analytical
            .get_or_insert_with(Default::default)
            .fields
            .insert(name.to_string(), value);
        self
    }

    pub fn entity(mut self, id: &str, entity_type: &str, name: &str) -> Self {
        let graph = self
            .packet
            .content
            .graph
            .get_or_insert_with(Default::default);
        graph.entities.push(Entity {
            id: id.to_string(),
            entity_type: entity_type.to_string(),
            properties: [("name".to_string(), serde_json::json!(name))]
                .into_iter()
                .collect(),
        });
        self
    }

    pub fn relationship(mut self, source_id: &str, target_id: &str, rel_type: &str) -> Self {
        let graph = self
            .packet
            .content
            .graph
            .get_or_insert_with(Default::default);
        graph.relationships.push(Relationship {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            rel_type: rel_type.to_string(),
            properties: BTreeMap::new(),
        });
        self
    }

    pub fn priority(mut self, brain: nancy_common::PriorityBrain) -> Self {
        self.packet
            .hints
            .get_or_insert_with(Default::default)
            .priority_brain = Some(brain);
        self
    }

    /// Seal and return the packet. Panics only on serialization bugs, which
    /// a test should surface loudly anyway.
    pub fn build(self) -> nancy_common::KnowledgePacket {
        nancy_common::seal(self.packet).expect("test packet seals")
    }
}

// ---------------------------------------------------------------------------
// ScriptedLinguistic
// ---------------------------------------------------------------------------

/// Deterministic linguistic brain. Intents are selected by the first
/// registered key found as a substring of the query; synthesis is a fixed
/// template over the evidence so tests can assert on grounded content.
///
/// Builder pattern: `.on_intent()`, `.on_entities()`, `.forced_down()`.
pub struct ScriptedLinguistic {
    intents: Vec<(String, Intent)>,
    entities: Vec<(String, Vec<ExtractedEntity>)>,
    down: bool,
    latency: std::time::Duration,
    failures: FailureScript,
}

impl ScriptedLinguistic {
    pub fn new() -> Self {
        Self {
            intents: Vec::new(),
            entities: Vec::new(),
            down: false,
            latency: std::time::Duration::ZERO,
            failures: FailureScript::default(),
        }
    }

    /// Sleep this long before every answer. Lets tests exercise deadlines
    /// and concurrency caps deterministically.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn on_intent(mut self, key: &str, intent: Intent) -> Self {
        self.intents.push((key.to_string(), intent));
        self
    }

    pub fn on_entities(mut self, key: &str, entities: Vec<ExtractedEntity>) -> Self {
        self.entities.push((key.to_string(), entities));
        self
    }

    /// Every call fails with `LlmUnavailable`, as if the provider retry
    /// budget were exhausted.
    pub fn forced_down(mut self) -> Self {
        self.down = true;
        self
    }

    pub fn fail_next(&self, err: BrainError) {
        self.failures.push(err);
    }

    async fn check_down(&self) -> Result<(), BrainError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.down {
            return Err(BrainError::LlmUnavailable {
                attempts: 1,
                reason: "scripted: forced down".into(),
            });
        }
        self.failures.take()
    }
}

impl Default for ScriptedLinguistic {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinguisticBrain for ScriptedLinguistic {
    async fn classify_intent(&self, query: &str) -> Result<Intent, BrainError> {
        self.check_down().await?;
        let lowered = query.to_lowercase();
        self.intents
            .iter()
            .find(|(key, _)| lowered.contains(&key.to_lowercase()))
            .map(|(_, intent)| intent.clone())
            .ok_or_else(|| {
                BrainError::Permanent(format!(
                    "ScriptedLinguistic: no intent registered matching {query:?}"
                ))
            })
    }

    async fn synthesize(
        &self,
        query: &str,
        evidence: &[EvidenceBundle],
    ) -> Result<String, BrainError> {
        self.check_down().await?;
        if evidence.iter().all(|b| b.items.is_empty()) {
            return Ok(format!("No relevant material found for: {query}"));
        }
        let mut lines = vec![format!("Answer for \"{query}\":")];
        for bundle in evidence {
            for item in &bundle.items {
                lines.push(format!(
                    "{} — {} [{}]",
                    item.label, item.snippet, item.packet_id
                ));
            }
        }
        Ok(lines.join("\n"))
    }

    async fn extract_entities(&self, text: &str) -> Result<Vec<ExtractedEntity>, BrainError> {
        self.check_down().await?;
        let lowered = text.to_lowercase();
        Ok(self
            .entities
            .iter()
            .find(|(key, _)| lowered.contains(&key.to_lowercase()))
            .map(|(_, entities)| entities.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fixed_embedder_favors_shared_words() {
        let vector = MemoryVectorBrain::new();
        vector
            .upsert_chunks(
                "pkt-power",
                &[Chunk { text: "Power Budget: total power draw by subsystem".into(), ordinal: 0 }],
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        vector
            .upsert_chunks(
                "pkt-mech",
                &[Chunk { text: "Mechanical enclosure drawings and tolerances".into(), ordinal: 0 }],
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        let hits = vector
            .semantic_search("power requirements", 2, None)
            .await
            .unwrap();
        assert_eq!(hits[0].packet_id, "pkt-power");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[tokio::test]
    async fn vector_upsert_is_idempotent_and_replaces() {
        let vector = MemoryVectorBrain::new();
        let chunks = vec![
            Chunk { text: "one".into(), ordinal: 0 },
            Chunk { text: "two".into(), ordinal: 1 },
        ];
        vector.upsert_chunks("p", &chunks, &BTreeMap::new()).await.unwrap();
        vector.upsert_chunks("p", &chunks, &BTreeMap::new()).await.unwrap();
        assert_eq!(vector.chunk_count("p"), 2);

        vector
            .upsert_chunks("p", &chunks[..1], &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(vector.chunk_count("p"), 1);
    }

    #[tokio::test]
    async fn vector_filter_restricts_hits() {
        let vector = MemoryVectorBrain::new();
        let meta_a: BTreeMap<String, serde_json::Value> =
            [("author".to_string(), json!("Sarah Chen"))].into_iter().collect();
        vector
            .upsert_chunks("pa", &[Chunk { text: "thermal notes".into(), ordinal: 0 }], &meta_a)
            .await
            .unwrap();
        vector
            .upsert_chunks(
                "pb",
                &[Chunk { text: "thermal data".into(), ordinal: 0 }],
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        let filter = Predicate::eq("author", "sarah chen");
        let hits = vector
            .semantic_search("thermal", 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].packet_id, "pa");
    }

    #[tokio::test]
    async fn graph_placeholder_upgrades_in_place() {
        let graph = MemoryGraphBrain::new();
        // Packet A references an entity in packet X before X arrives.
        graph
            .upsert_relationships(
                "pktA",
                &[Relationship {
                    source_id: "doc".into(),
                    target_id: "kp://pktX/e".into(),
                    rel_type: "REFERENCES".into(),
                    properties: BTreeMap::new(),
                }],
            )
            .await
            .unwrap();
        let placeholder = graph.get_node("kp://pktX/e").unwrap();
        assert_eq!(placeholder.node_type, "unresolved");

        graph
            .upsert_entities(
                "pktX",
                &[Entity {
                    id: "e".into(),
                    entity_type: "Decision".into(),
                    properties: BTreeMap::new(),
                }],
            )
            .await
            .unwrap();
        let resolved = graph.get_node("kp://pktX/e").unwrap();
        assert_eq!(resolved.node_type, "Decision");
        assert_eq!(resolved.fqid, placeholder.fqid);
    }

    #[tokio::test]
    async fn graph_edge_merge_is_idempotent() {
        let graph = MemoryGraphBrain::new();
        let rel = Relationship {
            source_id: "a".into(),
            target_id: "b".into(),
            rel_type: "AUTHORED".into(),
            properties: [("weight".to_string(), json!(1))].into_iter().collect(),
        };
        graph.upsert_relationships("p", &[rel.clone()]).await.unwrap();
        graph.upsert_relationships("p", &[rel]).await.unwrap();
        assert_eq!(graph.edge_count(), 1);
    }

    #[tokio::test]
    async fn graph_neighborhood_respects_depth_and_types() {
        let graph = MemoryGraphBrain::new();
        graph
            .upsert_relationships(
                "p",
                &[
                    Relationship {
                        source_id: "a".into(),
                        target_id: "b".into(),
                        rel_type: "AUTHORED".into(),
                        properties: BTreeMap::new(),
                    },
                    Relationship {
                        source_id: "b".into(),
                        target_id: "c".into(),
                        rel_type: "REFERENCES".into(),
                        properties: BTreeMap::new(),
                    },
                ],
            )
            .await
            .unwrap();

        let one_hop = graph
            .neighborhood("kp://p/a", 1, None)
            .await
            .unwrap();
        assert_eq!(one_hop.nodes.len(), 2);

        let two_hop = graph.neighborhood("kp://p/a", 2, None).await.unwrap();
        assert_eq!(two_hop.nodes.len(), 3);

        let typed = graph
            .neighborhood("kp://p/a", 2, Some(&["AUTHORED".to_string()]))
            .await
            .unwrap();
        assert_eq!(typed.nodes.len(), 2);
    }

    #[tokio::test]
    async fn graph_shortest_paths_finds_chain() {
        let graph = MemoryGraphBrain::new();
        graph
            .upsert_relationships(
                "p",
                &[
                    Relationship {
                        source_id: "mike".into(),
                        target_id: "emc".into(),
                        rel_type: "AUTHORED".into(),
                        properties: BTreeMap::new(),
                    },
                    Relationship {
                        source_id: "emc".into(),
                        target_id: "ground".into(),
                        rel_type: "REFERENCES".into(),
                        properties: BTreeMap::new(),
                    },
                ],
            )
            .await
            .unwrap();
        let paths = graph
            .shortest_paths("kp://p/mike", "kp://p/ground", 4)
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].nodes.len(), 3);
    }

    #[tokio::test]
    async fn analytical_query_filters_by_metadata() {
        let analytical = MemoryAnalyticalBrain::new();
        for (title, author) in [("Doc One", "Sarah Chen"), ("Doc Two", "Mike")] {
            let packet = PacketBuilder::document(title).author(author).body("text").build();
            let row = PacketIndexRow::from_packet(&packet);
            analytical.upsert_packet_row(&row, &packet).await.unwrap();
        }
        let hits = analytical
            .run_structured_query(&Predicate::eq("author", "sarah chen"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].author.as_deref(), Some("Sarah Chen"));
        assert_eq!(
            analytical.count(&Predicate::eq("author", "mike")).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn fail_next_consumes_one_error() {
        let graph = MemoryGraphBrain::new();
        graph.fail_next(BrainError::Permanent("scripted".into()));
        let err = graph.upsert_entities("p", &[]).await.unwrap_err();
        assert!(err.is_permanent());
        graph.upsert_entities("p", &[]).await.unwrap();
    }
}
