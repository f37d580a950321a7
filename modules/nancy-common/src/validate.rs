use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{parse_kp_ref, KnowledgePacket, PACKET_VERSION};

/// One structural problem found in a packet. `field` is a dotted path into
/// the packet document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Compute the content-addressed id of a packet: hex SHA-256 over the
/// canonical serialization of every field except `packet_id` itself.
///
/// Canonical form is compact JSON with object keys sorted, which
/// `serde_json::Value` provides (objects are BTreeMap-backed). Two
/// semantically equal packets hash identically regardless of the field
/// order they were built or parsed with.
pub fn canonical_id(packet: &KnowledgePacket) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(packet)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("packet_id");
    }
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Stamp `packet_id` from the packet's own content. Plugins and tests use
/// this; the validator only ever recomputes and compares.
pub fn seal(mut packet: KnowledgePacket) -> Result<KnowledgePacket, serde_json::Error> {
    packet.packet_id = canonical_id(&packet)?;
    Ok(packet)
}

/// Structural and relational validation (no store access). Returns every
/// issue found; an empty list means the packet is acceptable. Never panics
/// on malformed input.
pub fn validate(packet: &KnowledgePacket) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if packet.packet_version != PACKET_VERSION {
        issues.push(ValidationIssue::new(
            "packet_version",
            format!(
                "unsupported version {:?}, expected {PACKET_VERSION:?}",
                packet.packet_version
            ),
        ));
    }

    match canonical_id(packet) {
        Ok(expected) => {
            if packet.packet_id != expected {
                issues.push(ValidationIssue::new(
                    "packet_id",
                    format!("does not match canonical id {expected}"),
                ));
            }
        }
        Err(e) => {
            issues.push(ValidationIssue::new(
                "packet_id",
                format!("canonical serialization failed: {e}"),
            ));
        }
    }

    if packet.source.plugin_name.is_empty() {
        issues.push(ValidationIssue::new("source.plugin_name", "must not be empty"));
    }
    if packet.source.origin_locator.is_empty() {
        issues.push(ValidationIssue::new(
            "source.origin_locator",
            "must not be empty",
        ));
    }

    if packet.content_brains().is_empty() {
        issues.push(ValidationIssue::new(
            "content",
            "at least one of vector/analytical/graph must be non-empty",
        ));
    }

    if let Some(vector) = &packet.content.vector {
        validate_vector(vector, &mut issues);
    }
    if let Some(analytical) = &packet.content.analytical {
        validate_table(analytical, &mut issues);
    }
    if let Some(graph) = &packet.content.graph {
        validate_graph(graph, &mut issues);
    }
    if let Some(hints) = &packet.hints {
        validate_hints(hints, &mut issues);
    }

    issues
}

fn validate_vector(vector: &crate::types::VectorContent, issues: &mut Vec<ValidationIssue>) {
    let mut last_ordinal: Option<u32> = None;
    for (i, chunk) in vector.chunks.iter().enumerate() {
        if chunk.text.trim().is_empty() {
            issues.push(ValidationIssue::new(
                format!("content.vector.chunks[{i}].text"),
                "must be a non-empty string",
            ));
        }
        if let Some(prev) = last_ordinal {
            if chunk.ordinal <= prev {
                issues.push(ValidationIssue::new(
                    format!("content.vector.chunks[{i}].ordinal"),
                    format!("ordinals must be strictly increasing, got {} after {prev}", chunk.ordinal),
                ));
            }
        }
        last_ordinal = Some(chunk.ordinal);
    }
    if vector.embedding_model.is_empty() {
        issues.push(ValidationIssue::new(
            "content.vector.embedding_model",
            "must not be empty",
        ));
    }
}

fn validate_table(analytical: &crate::types::AnalyticalContent, issues: &mut Vec<ValidationIssue>) {
    let Some(table) = &analytical.table else {
        return;
    };
    if table.columns.is_empty() {
        issues.push(ValidationIssue::new(
            "content.analytical.table.columns",
            "table must declare at least one column",
        ));
        return;
    }
    for (r, row) in table.rows.iter().enumerate() {
        if row.len() != table.columns.len() {
            issues.push(ValidationIssue::new(
                format!("content.analytical.table.rows[{r}]"),
                format!(
                    "arity {} does not match {} declared columns",
                    row.len(),
                    table.columns.len()
                ),
            ));
            continue;
        }
        for (c, cell) in row.iter().enumerate() {
            let spec = &table.columns[c];
            if !spec.column_type.admits(cell) {
                issues.push(ValidationIssue::new(
                    format!("content.analytical.table.rows[{r}][{c}]"),
                    format!("cell does not match column {:?} type", spec.name),
                ));
            }
        }
    }
}

fn validate_graph(graph: &crate::types::GraphContent, issues: &mut Vec<ValidationIssue>) {
    let local_ids: std::collections::HashSet<&str> =
        graph.entities.iter().map(|e| e.id.as_str()).collect();

    for (i, entity) in graph.entities.iter().enumerate() {
        if entity.id.is_empty() {
            issues.push(ValidationIssue::new(
                format!("content.graph.entities[{i}].id"),
                "must not be empty",
            ));
        }
        if entity.entity_type.is_empty() {
            issues.push(ValidationIssue::new(
                format!("content.graph.entities[{i}].type"),
                "must not be empty",
            ));
        }
    }

    for (i, rel) in graph.relationships.iter().enumerate() {
        for (side, endpoint) in [("source_id", &rel.source_id), ("target_id", &rel.target_id)] {
            let resolvable =
                local_ids.contains(endpoint.as_str()) || parse_kp_ref(endpoint).is_some();
            if !resolvable {
                issues.push(ValidationIssue::new(
                    format!("content.graph.relationships[{i}].{side}"),
                    format!(
                        "{endpoint:?} is neither a local entity id nor a kp:// reference"
                    ),
                ));
            }
        }
        if rel.rel_type.is_empty() {
            issues.push(ValidationIssue::new(
                format!("content.graph.relationships[{i}].type"),
                "must not be empty",
            ));
        }
    }
}

fn validate_hints(hints: &crate::types::RoutingHints, issues: &mut Vec<ValidationIssue>) {
    if let Some(w) = hints.semantic_weight {
        if !(0.0..=1.0).contains(&w) {
            issues.push(ValidationIssue::new(
                "hints.semantic_weight",
                format!("{w} outside [0, 1]"),
            ));
        }
    }
    if let Some(c) = hints.extraction_confidence {
        if !(0.0..=1.0).contains(&c) {
            issues.push(ValidationIssue::new(
                "hints.extraction_confidence",
                format!("{c} outside [0, 1]"),
            ));
        }
    }
}
