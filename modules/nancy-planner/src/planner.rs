use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use nancy_brains::{BrainError, BrainSet, GraphNode, PacketIndexRow, Predicate, SearchHit};
use nancy_common::{
    BrainKind, EvidenceBundle, EvidenceItem, Intent, IntentFilters, QueryStrategy,
};

use crate::fallback::{is_multi_step, rule_based_intent};
use crate::trace::{IntentSource, QueryTrace, TraceStep};

/// Entity types the planner probes when resolving a bare name to graph
/// nodes. These are ordinary `type` values, not special-cased storage.
const NAMED_NODE_TYPES: [&str; 6] =
    ["Person", "Author", "Document", "Decision", "Meeting", "Component"];

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// k for semantic search.
    pub search_k: usize,
    pub query_deadline: Duration,
    pub adapter_deadline: Duration,
    /// Synthesis gets at most this many bundles.
    pub max_bundles: usize,
    pub max_items_per_bundle: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            search_k: 8,
            query_deadline: Duration::from_secs(30),
            adapter_deadline: Duration::from_secs(10),
            max_bundles: 4,
            max_items_per_bundle: 10,
        }
    }
}

/// The answer plus everything needed to audit how it was produced.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    /// Packet ids backing the answer, strongest first.
    pub citations: Vec<String>,
    pub intent: Intent,
    pub trace: QueryTrace,
    /// A store or the synthesizer was unavailable and the plan degraded.
    pub degraded: bool,
    /// The overall deadline expired before the plan completed.
    pub truncated: bool,
}

/// Turns a natural-language query into an answer: classify, execute the
/// strategy's plan across the brains, synthesize over the collected
/// evidence. Every LLM call has a pure fallback.
pub struct QueryPlanner {
    brains: BrainSet,
    config: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(brains: BrainSet, config: PlannerConfig) -> Self {
        Self { brains, config }
    }

    fn budget(&self, started: Instant) -> Duration {
        self.config
            .adapter_deadline
            .min(self.config.query_deadline.saturating_sub(started.elapsed()))
    }

    pub async fn query(&self, text: &str) -> QueryResponse {
        let started = Instant::now();

        let classify_started = Instant::now();
        let classify_budget = self.budget(started);
        let classified = if classify_budget.is_zero() {
            Err(BrainError::Unavailable("deadline exhausted".into()))
        } else {
            match tokio::time::timeout(
                classify_budget,
                self.brains.linguistic.classify_intent(text),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BrainError::Transient("classification timed out".into())),
            }
        };
        let (intent, intent_source) = match classified {
            Ok(intent) => (intent, IntentSource::Llm),
            Err(e) => {
                warn!(error = %e, "Intent classification unavailable, using rule fallback");
                (rule_based_intent(text), IntentSource::RuleFallback)
            }
        };
        let mut trace = QueryTrace::new(intent_source);
        trace.steps.push(TraceStep {
            adapter: BrainKind::Linguistic,
            operation: "classify_intent".into(),
            elapsed_ms: classify_started.elapsed().as_millis() as u64,
            result_count: 1,
            degraded: intent_source == IntentSource::RuleFallback,
        });
        debug!(strategy = %intent.strategy, source = ?intent_source, "Planned query");

        let mut truncated = false;
        let mut bundles = self
            .execute_plan(text, &intent, started, &mut trace, &mut truncated)
            .await;

        // Ranking and truncation happen here, not in the synthesizer, so
        // token budgets hold regardless of adapter behavior.
        bundles.truncate(self.config.max_bundles);
        for bundle in &mut bundles {
            bundle.items.truncate(self.config.max_items_per_bundle);
        }
        let citations = collect_citations(&bundles);

        let synth_budget = self.budget(started);
        let synth_started = Instant::now();
        let synthesized = if synth_budget.is_zero() {
            truncated = true;
            Err(BrainError::Unavailable("deadline exhausted".into()))
        } else {
            match tokio::time::timeout(
                synth_budget,
                self.brains.linguistic.synthesize(text, &bundles),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BrainError::Transient("synthesis timed out".into())),
            }
        };
        let (answer, synth_degraded) = match synthesized {
            Ok(answer) => (answer, false),
            Err(e) => {
                warn!(error = %e, "Synthesis unavailable, returning structured evidence");
                (fallback_synthesis(text, &bundles), true)
            }
        };
        trace.steps.push(TraceStep {
            adapter: BrainKind::Linguistic,
            operation: "synthesize".into(),
            elapsed_ms: synth_started.elapsed().as_millis() as u64,
            result_count: bundles.iter().map(|b| b.items.len()).sum(),
            degraded: synth_degraded,
        });

        let degraded = trace.any_degraded();
        info!(
            strategy = %intent.strategy,
            citations = citations.len(),
            degraded,
            truncated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query complete"
        );
        QueryResponse {
            answer,
            citations,
            intent,
            trace,
            degraded,
            truncated,
        }
    }

    async fn execute_plan(
        &self,
        text: &str,
        intent: &Intent,
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> Vec<EvidenceBundle> {
        let mut bundles = match intent.strategy {
            QueryStrategy::Semantic => {
                self.semantic_plan(text, None, started, trace, truncated).await
            }
            QueryStrategy::AuthorAttribution => {
                self.author_plan(intent, started, trace, truncated).await
            }
            QueryStrategy::MetadataFilter | QueryStrategy::Temporal => {
                self.filter_plan(text, intent, started, trace, truncated).await
            }
            QueryStrategy::RelationshipDiscovery | QueryStrategy::DecisionProvenance => {
                self.relationship_plan(text, intent, started, trace, truncated)
                    .await
            }
            QueryStrategy::ExpertIdentification => {
                self.expert_plan(text, intent, started, trace, truncated).await
            }
            QueryStrategy::Hybrid => {
                self.hybrid_plan(text, intent, started, trace, truncated).await
            }
        };

        // Multi-step plans always feed the synthesizer both a vector and a
        // graph bundle.
        if is_multi_step(intent) {
            if !bundles.iter().any(|b| b.source == BrainKind::Vector) {
                bundles.extend(
                    self.semantic_plan(text, None, started, trace, truncated).await,
                );
            }
            if !bundles.iter().any(|b| b.source == BrainKind::Graph) {
                if let Some(bundle) = self
                    .graph_expansion(&intent.entities, started, trace, truncated)
                    .await
                {
                    bundles.push(bundle);
                }
            }
        }
        bundles
    }

    // --- Plan shapes ---

    /// vector.semantic_search → analytical metadata lookup → bundle.
    async fn semantic_plan(
        &self,
        text: &str,
        restrict_to: Option<&[String]>,
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> Vec<EvidenceBundle> {
        let filter = restrict_to.map(|ids| Predicate::In {
            column: "packet_id".into(),
            values: ids.iter().map(|id| json!(id)).collect(),
        });
        let hits = run_step(
            trace,
            truncated,
            BrainKind::Vector,
            "semantic_search",
            self.budget(started),
            self.brains
                .vector
                .semantic_search(text, self.config.search_k, filter.as_ref()),
            |hits: &Vec<SearchHit>| hits.len(),
        )
        .await
        .unwrap_or_default();
        if hits.is_empty() {
            return Vec::new();
        }

        // Best hit per packet, in rank order.
        let mut seen = HashSet::new();
        let mut ranked: Vec<&SearchHit> = Vec::new();
        for hit in &hits {
            if seen.insert(hit.packet_id.clone()) {
                ranked.push(hit);
            }
        }
        let ids: Vec<String> = ranked.iter().map(|h| h.packet_id.clone()).collect();
        let rows = self.lookup_rows(&ids, started, trace, truncated).await;

        let mut bundle = EvidenceBundle::new(BrainKind::Vector, "semantic similarity over chunks");
        for hit in ranked {
            let label = rows
                .get(&hit.packet_id)
                .and_then(|row| row.title.clone())
                .unwrap_or_else(|| short_id(&hit.packet_id));
            bundle.items.push(EvidenceItem {
                packet_id: hit.packet_id.clone(),
                label,
                snippet: hit.text.clone(),
                score: 1.0 / (1.0 + hit.distance),
            });
        }
        vec![bundle]
    }

    /// graph.find_by_type(author) → neighborhood over authorship edges →
    /// analytical metadata join.
    async fn author_plan(
        &self,
        intent: &Intent,
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> Vec<EvidenceBundle> {
        let Some(author) = intent
            .filters
            .author
            .clone()
            .or_else(|| intent.entities.first().cloned())
        else {
            return Vec::new();
        };

        let wanted: BTreeMap<String, serde_json::Value> =
            [("name".to_string(), json!(author))].into_iter().collect();
        let author_nodes = run_step(
            trace,
            truncated,
            BrainKind::Graph,
            "find_by_type",
            self.budget(started),
            self.find_named_nodes(&wanted),
            |nodes: &Vec<GraphNode>| nodes.len(),
        )
        .await
        .unwrap_or_default();

        let mut bundle = EvidenceBundle::new(
            BrainKind::Graph,
            format!("authorship edges around {author}"),
        );
        let mut cited = HashSet::new();
        for node in &author_nodes {
            let subgraph = run_step(
                trace,
                truncated,
                BrainKind::Graph,
                "neighborhood",
                self.budget(started),
                self.brains.graph.neighborhood(
                    &node.fqid,
                    1,
                    Some(&["AUTHORED".to_string(), "CONTRIBUTED_TO".to_string()]),
                ),
                |sg: &nancy_brains::Subgraph| sg.nodes.len(),
            )
            .await;
            let Some(subgraph) = subgraph else { continue };
            for neighbor in subgraph.nodes {
                if neighbor.fqid == node.fqid || neighbor.packet_id.is_empty() {
                    continue;
                }
                if cited.insert(neighbor.packet_id.clone()) {
                    bundle.items.push(node_evidence(&neighbor, 1.0));
                }
            }
        }

        let ids: Vec<String> = cited.into_iter().collect();
        let rows = self.lookup_rows(&ids, started, trace, truncated).await;
        let mut analytical =
            EvidenceBundle::new(BrainKind::Analytical, format!("metadata for {author}'s work"));
        for item in &bundle.items {
            if let Some(row) = rows.get(&item.packet_id) {
                analytical.items.push(row_evidence(row, 0.8));
            }
        }

        let mut bundles = vec![bundle];
        if !analytical.items.is_empty() {
            bundles.push(analytical);
        }
        bundles
    }

    /// analytical.run_structured_query(filters) → optional vector
    /// refinement over the matching packets.
    async fn filter_plan(
        &self,
        text: &str,
        intent: &Intent,
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> Vec<EvidenceBundle> {
        let predicate = filters_to_predicate(&intent.filters);
        let rows = run_step(
            trace,
            truncated,
            BrainKind::Analytical,
            "run_structured_query",
            self.budget(started),
            self.brains.analytical.run_structured_query(&predicate),
            |rows: &Vec<PacketIndexRow>| rows.len(),
        )
        .await
        .unwrap_or_default();

        let mut bundle =
            EvidenceBundle::new(BrainKind::Analytical, "metadata filter over the packet index");
        for (rank, row) in rows.iter().enumerate() {
            bundle
                .items
                .push(row_evidence(row, 1.0 / (1.0 + rank as f64)));
        }
        let mut bundles = vec![bundle];

        // Refinement only when the plan declared it needs the vector store;
        // a pure filter query never touches it.
        if intent.needs(BrainKind::Vector) && !rows.is_empty() {
            let ids: Vec<String> = rows.iter().map(|r| r.packet_id.clone()).collect();
            bundles.extend(
                self.semantic_plan(text, Some(&ids), started, trace, truncated)
                    .await,
            );
        }
        bundles
    }

    /// shortest_paths / multi-hop neighborhood around the named entities,
    /// with vector detail restricted to the packets those touch.
    async fn relationship_plan(
        &self,
        text: &str,
        intent: &Intent,
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> Vec<EvidenceBundle> {
        let mut bundles = Vec::new();
        if let Some(bundle) = self
            .graph_expansion(&intent.entities, started, trace, truncated)
            .await
        {
            let ids: Vec<String> = bundle
                .items
                .iter()
                .map(|i| i.packet_id.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            bundles.push(bundle);
            if intent.needs(BrainKind::Vector) && !ids.is_empty() {
                bundles.extend(
                    self.semantic_plan(text, Some(&ids), started, trace, truncated)
                        .await,
                );
            }
        }
        bundles
    }

    /// vector topic search → author histogram from metadata → graph check
    /// of the leading author.
    async fn expert_plan(
        &self,
        text: &str,
        intent: &Intent,
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> Vec<EvidenceBundle> {
        let topic = if intent.entities.is_empty() {
            text.to_string()
        } else {
            intent.entities.join(" ")
        };
        let mut bundles = self
            .semantic_plan(&topic, None, started, trace, truncated)
            .await;

        let ids: Vec<String> = bundles
            .first()
            .map(|b| b.items.iter().map(|i| i.packet_id.clone()).collect())
            .unwrap_or_default();
        let rows = self.lookup_rows(&ids, started, trace, truncated).await;

        let mut by_author: HashMap<String, usize> = HashMap::new();
        for row in rows.values() {
            if let Some(author) = &row.author {
                *by_author.entry(author.clone()).or_default() += 1;
            }
        }
        let mut ranking: Vec<(String, usize)> = by_author.into_iter().collect();
        ranking.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut analytical = EvidenceBundle::new(
            BrainKind::Analytical,
            format!(
                "author contribution counts: {}",
                ranking
                    .iter()
                    .map(|(a, n)| format!("{a} ({n})"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );
        for (author, count) in &ranking {
            for row in rows.values().filter(|r| r.author.as_ref() == Some(author)) {
                analytical.items.push(row_evidence(row, *count as f64));
            }
        }
        if !analytical.items.is_empty() {
            analytical
                .items
                .sort_by(|a, b| b.score.total_cmp(&a.score));
            bundles.push(analytical);
        }

        if let Some((top_author, _)) = ranking.first() {
            if let Some(bundle) = self
                .graph_expansion(std::slice::from_ref(top_author), started, trace, truncated)
                .await
            {
                bundles.push(bundle);
            }
        }
        bundles
    }

    /// vector first, then graph expansion around the query's entities.
    async fn hybrid_plan(
        &self,
        text: &str,
        intent: &Intent,
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> Vec<EvidenceBundle> {
        let mut bundles = self
            .semantic_plan(text, None, started, trace, truncated)
            .await;
        if let Some(bundle) = self
            .graph_expansion(&intent.entities, started, trace, truncated)
            .await
        {
            bundles.push(bundle);
        }
        bundles
    }

    // --- Shared plan fragments ---

    /// Resolve names to nodes, then expand: paths between the first two
    /// resolutions, neighborhoods around each.
    async fn graph_expansion(
        &self,
        names: &[String],
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> Option<EvidenceBundle> {
        if names.is_empty() {
            return None;
        }
        let mut resolved: Vec<GraphNode> = Vec::new();
        for name in names.iter().take(3) {
            let wanted: BTreeMap<String, serde_json::Value> =
                [("name".to_string(), json!(name))].into_iter().collect();
            let nodes = run_step(
                trace,
                truncated,
                BrainKind::Graph,
                "find_by_type",
                self.budget(started),
                self.find_named_nodes(&wanted),
                |nodes: &Vec<GraphNode>| nodes.len(),
            )
            .await
            .unwrap_or_default();
            resolved.extend(nodes);
        }
        if resolved.is_empty() {
            return None;
        }

        let mut bundle = EvidenceBundle::new(
            BrainKind::Graph,
            format!("relationships around {}", names.join(", ")),
        );
        let mut cited: HashSet<String> = HashSet::new();
        let mut include = |node: &GraphNode, score: f64, bundle: &mut EvidenceBundle| {
            if node.packet_id.is_empty() || node.node_type == "unresolved" {
                return;
            }
            if cited.insert(format!("{}|{}", node.packet_id, node.fqid)) {
                bundle.items.push(node_evidence(node, score));
            }
        };

        if resolved.len() >= 2 {
            let paths = run_step(
                trace,
                truncated,
                BrainKind::Graph,
                "shortest_paths",
                self.budget(started),
                self.brains
                    .graph
                    .shortest_paths(&resolved[0].fqid, &resolved[1].fqid, 4),
                |paths: &Vec<nancy_brains::GraphPath>| paths.len(),
            )
            .await
            .unwrap_or_default();
            for path in &paths {
                for node in &path.nodes {
                    include(node, 1.0, &mut bundle);
                }
            }
        }

        for node in resolved.iter().take(3) {
            let subgraph = run_step(
                trace,
                truncated,
                BrainKind::Graph,
                "neighborhood",
                self.budget(started),
                self.brains.graph.neighborhood(&node.fqid, 2, None),
                |sg: &nancy_brains::Subgraph| sg.nodes.len(),
            )
            .await;
            if let Some(subgraph) = subgraph {
                for neighbor in &subgraph.nodes {
                    include(neighbor, 0.7, &mut bundle);
                }
            }
        }

        if bundle.items.is_empty() {
            None
        } else {
            Some(bundle)
        }
    }

    /// Probe the conventional named-entity types for nodes matching the
    /// wanted properties.
    async fn find_named_nodes(
        &self,
        wanted: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Vec<GraphNode>, BrainError> {
        let mut out = Vec::new();
        for entity_type in NAMED_NODE_TYPES {
            let nodes = self
                .brains
                .graph
                .find_by_type(entity_type, Some(wanted))
                .await?;
            out.extend(nodes);
        }
        Ok(out)
    }

    async fn lookup_rows(
        &self,
        ids: &[String],
        started: Instant,
        trace: &mut QueryTrace,
        truncated: &mut bool,
    ) -> HashMap<String, PacketIndexRow> {
        if ids.is_empty() {
            return HashMap::new();
        }
        let predicate = Predicate::In {
            column: "packet_id".into(),
            values: ids.iter().map(|id| json!(id)).collect(),
        };
        run_step(
            trace,
            truncated,
            BrainKind::Analytical,
            "run_structured_query",
            self.budget(started),
            self.brains.analytical.run_structured_query(&predicate),
            |rows: &Vec<PacketIndexRow>| rows.len(),
        )
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|row| (row.packet_id.clone(), row))
        .collect()
    }
}

// --- Helpers ---

/// Run one adapter call under a budget, recording a trace step either way.
/// `None` means the step degraded (failed, timed out, or was skipped for
/// deadline) and the plan should continue without it.
async fn run_step<T, F, C>(
    trace: &mut QueryTrace,
    truncated: &mut bool,
    adapter: BrainKind,
    operation: &str,
    budget: Duration,
    fut: F,
    count: C,
) -> Option<T>
where
    F: Future<Output = Result<T, BrainError>>,
    C: FnOnce(&T) -> usize,
{
    if budget.is_zero() {
        *truncated = true;
        trace.steps.push(TraceStep {
            adapter,
            operation: format!("{operation} (skipped: deadline)"),
            elapsed_ms: 0,
            result_count: 0,
            degraded: true,
        });
        return None;
    }
    let t0 = Instant::now();
    let outcome = tokio::time::timeout(budget, fut).await;
    let elapsed_ms = t0.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(value)) => {
            trace.steps.push(TraceStep {
                adapter,
                operation: operation.to_string(),
                elapsed_ms,
                result_count: count(&value),
                degraded: false,
            });
            Some(value)
        }
        Ok(Err(e)) => {
            warn!(adapter = %adapter, operation, error = %e, "Plan step degraded");
            trace.steps.push(TraceStep {
                adapter,
                operation: operation.to_string(),
                elapsed_ms,
                result_count: 0,
                degraded: true,
            });
            None
        }
        Err(_) => {
            warn!(adapter = %adapter, operation, "Plan step timed out");
            *truncated = true;
            trace.steps.push(TraceStep {
                adapter,
                operation: format!("{operation} (timeout)"),
                elapsed_ms,
                result_count: 0,
                degraded: true,
            });
            None
        }
    }
}

/// Lower the intent's typed filters into the analytical predicate algebra.
/// Empty filters become a match-all conjunction.
pub fn filters_to_predicate(filters: &IntentFilters) -> Predicate {
    let mut preds = Vec::new();
    if let Some(author) = &filters.author {
        preds.push(Predicate::eq("author", author.as_str()));
    }
    for tag in &filters.tags {
        preds.push(Predicate::eq("tags", tag.as_str()));
    }
    if filters.created_after.is_some() || filters.created_before.is_some() {
        preds.push(Predicate::range(
            "created_at",
            filters.created_after.map(|t| json!(t.to_rfc3339())),
            filters.created_before.map(|t| json!(t.to_rfc3339())),
        ));
    }
    Predicate::and(preds)
}

/// Structured listing used when natural-language synthesis is unavailable.
pub fn fallback_synthesis(query: &str, bundles: &[EvidenceBundle]) -> String {
    if bundles.iter().all(|b| b.items.is_empty()) {
        return format!("No matching material found for: {query}");
    }
    let mut lines = vec![format!(
        "Natural-language synthesis is unavailable. Top evidence for \"{query}\":"
    )];
    for bundle in bundles {
        for item in bundle.items.iter().take(5) {
            lines.push(format!(
                "- [{}] {} — {} (packet {})",
                bundle.source, item.label, item.snippet, item.packet_id
            ));
        }
    }
    lines.join("\n")
}

fn collect_citations(bundles: &[EvidenceBundle]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut citations = Vec::new();
    for bundle in bundles {
        for item in &bundle.items {
            if !item.packet_id.is_empty() && seen.insert(item.packet_id.clone()) {
                citations.push(item.packet_id.clone());
            }
        }
    }
    citations
}

fn short_id(packet_id: &str) -> String {
    packet_id.chars().take(12).collect()
}

fn node_evidence(node: &GraphNode, score: f64) -> EvidenceItem {
    let name = node
        .properties
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(&node.fqid);
    EvidenceItem {
        packet_id: node.packet_id.clone(),
        label: name.to_string(),
        snippet: format!("{}: {}", node.node_type, name),
        score,
    }
}

fn row_evidence(row: &PacketIndexRow, score: f64) -> EvidenceItem {
    let label = row
        .title
        .clone()
        .unwrap_or_else(|| short_id(&row.packet_id));
    let mut parts = Vec::new();
    if let Some(author) = &row.author {
        parts.push(format!("by {author}"));
    }
    if let Some(created) = &row.created_at {
        parts.push(format!("created {}", created.format("%Y-%m-%d")));
    }
    parts.push(row.content_type.clone());
    EvidenceItem {
        packet_id: row.packet_id.clone(),
        label,
        snippet: parts.join(", "),
        score,
    }
}
