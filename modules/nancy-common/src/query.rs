use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::types::BrainKind;

/// Classified shape of a natural-language query. Drives plan selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    Semantic,
    AuthorAttribution,
    MetadataFilter,
    RelationshipDiscovery,
    DecisionProvenance,
    ExpertIdentification,
    Temporal,
    Hybrid,
}

impl std::fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStrategy::Semantic => write!(f, "semantic"),
            QueryStrategy::AuthorAttribution => write!(f, "author_attribution"),
            QueryStrategy::MetadataFilter => write!(f, "metadata_filter"),
            QueryStrategy::RelationshipDiscovery => write!(f, "relationship_discovery"),
            QueryStrategy::DecisionProvenance => write!(f, "decision_provenance"),
            QueryStrategy::ExpertIdentification => write!(f, "expert_identification"),
            QueryStrategy::Temporal => write!(f, "temporal"),
            QueryStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for QueryStrategy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(Self::Semantic),
            "author_attribution" => Ok(Self::AuthorAttribution),
            "metadata_filter" => Ok(Self::MetadataFilter),
            "relationship_discovery" => Ok(Self::RelationshipDiscovery),
            "decision_provenance" => Ok(Self::DecisionProvenance),
            "expert_identification" => Ok(Self::ExpertIdentification),
            "temporal" => Ok(Self::Temporal),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown QueryStrategy: {other}")),
        }
    }
}

/// Structured predicates pulled out of the query text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IntentFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
}

impl IntentFilters {
    pub fn is_empty(&self) -> bool {
        self.author.is_none()
            && self.tags.is_empty()
            && self.created_after.is_none()
            && self.created_before.is_none()
    }
}

/// The linguistic adapter's classification of a user query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Intent {
    pub strategy: QueryStrategy,
    /// The store the plan leads with.
    pub primary_store: BrainKind,
    /// Which stores the plan will consult.
    pub needs: Vec<BrainKind>,
    /// Salient noun-phrases extracted from the query.
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub filters: IntentFilters,
}

impl Intent {
    pub fn needs(&self, kind: BrainKind) -> bool {
        self.needs.contains(&kind)
    }
}

// --- Evidence ---

/// One ranked item of grounding material. `score` is rank weight within the
/// bundle; larger is stronger. Vector distances are inverted into this
/// before bundling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub packet_id: String,
    pub label: String,
    pub snippet: String,
    pub score: f64,
}

/// A ranked set of items from one adapter, passed to the synthesizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub source: BrainKind,
    pub items: Vec<EvidenceItem>,
    pub note: String,
}

impl EvidenceBundle {
    pub fn new(source: BrainKind, note: impl Into<String>) -> Self {
        Self {
            source,
            items: Vec::new(),
            note: note.into(),
        }
    }

    pub fn packet_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.packet_id.clone()).collect()
    }
}

/// An entity mention found in free text by the linguistic adapter.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub properties: std::collections::BTreeMap<String, serde_json::Value>,
    /// Byte offsets of the mention in the input text, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<(usize, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn strategy_display_and_fromstr_roundtrip() {
        for s in [
            QueryStrategy::Semantic,
            QueryStrategy::AuthorAttribution,
            QueryStrategy::MetadataFilter,
            QueryStrategy::RelationshipDiscovery,
            QueryStrategy::DecisionProvenance,
            QueryStrategy::ExpertIdentification,
            QueryStrategy::Temporal,
            QueryStrategy::Hybrid,
        ] {
            assert_eq!(QueryStrategy::from_str(&s.to_string()).unwrap(), s);
        }
    }

    #[test]
    fn intent_serde_roundtrip() {
        let intent = Intent {
            strategy: QueryStrategy::AuthorAttribution,
            primary_store: BrainKind::Graph,
            needs: vec![BrainKind::Graph, BrainKind::Analytical],
            entities: vec!["Sarah Chen".into()],
            filters: IntentFilters {
                author: Some("Sarah Chen".into()),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&intent).unwrap();
        let back: Intent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn empty_filters_report_empty() {
        assert!(IntentFilters::default().is_empty());
        let f = IntentFilters {
            tags: vec!["thermal".into()],
            ..Default::default()
        };
        assert!(!f.is_empty());
    }
}
