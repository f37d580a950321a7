use std::collections::BTreeMap;

use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, Graph};
use serde_json::Value;
use tracing::debug;

use nancy_common::{fq_entity_id, parse_kp_ref, Entity, Relationship};

use crate::error::BrainError;
use crate::traits::{GraphBrain, GraphEdge, GraphNode, GraphPath, Subgraph};

/// Thin wrapper around neo4rs::Graph providing connection setup.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
}

impl GraphClient {
    /// Connect over bolt with the given credentials.
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, neo4rs::Error> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .fetch_size(500)
            .max_connections(10)
            .build()?;
        let graph = Graph::connect(config).await?;
        Ok(Self { graph })
    }

    pub fn inner(&self) -> &Graph {
        &self.graph
    }
}

/// Graph brain backed by a bolt-protocol store. Every node carries
/// `fqid`, `entity_type`, `packet_id`, and a `props` JSON document; every
/// edge carries `packet_id` and `props`. Nothing is special-cased per
/// entity type.
pub struct BoltGraphBrain {
    client: GraphClient,
}

impl BoltGraphBrain {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub async fn migrate(&self) -> Result<(), BrainError> {
        self.client
            .graph
            .run(query(
                "CREATE CONSTRAINT entity_fqid IF NOT EXISTS
                 FOR (e:Entity) REQUIRE e.fqid IS UNIQUE",
            ))
            .await?;
        Ok(())
    }

    /// Resolve a packet-local endpoint to its fully-qualified id. `kp://`
    /// references pass through untouched.
    fn resolve_endpoint(packet_id: &str, endpoint: &str) -> String {
        if parse_kp_ref(endpoint).is_some() {
            endpoint.to_string()
        } else {
            fq_entity_id(packet_id, endpoint)
        }
    }

    /// Owning packet of an fqid, parsed back out of the reference.
    fn owner_of(fqid: &str) -> String {
        parse_kp_ref(fqid)
            .map(|(packet_id, _)| packet_id.to_string())
            .unwrap_or_default()
    }

    /// Ensure the endpoint node exists, materializing an `unresolved`
    /// placeholder when it doesn't. Never downgrades a real node.
    async fn merge_endpoint(&self, fqid: &str) -> Result<(), BrainError> {
        let q = query(
            "MERGE (e:Entity {fqid: $fqid})
             ON CREATE SET e.entity_type = 'unresolved',
                           e.packet_id = $packet_id,
                           e.props = '{}'",
        )
        .param("fqid", fqid)
        .param("packet_id", Self::owner_of(fqid));
        self.client.graph.run(q).await?;
        Ok(())
    }
}

/// Relationship types become native edge types; anything outside
/// `[A-Za-z0-9_]` is normalized so plugin data can't inject Cypher.
pub(crate) fn sanitize_rel_type(rel_type: &str) -> String {
    let cleaned: String = rel_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("REL_{cleaned}")
    } else {
        cleaned
    }
}

fn props_json(properties: &BTreeMap<String, Value>) -> String {
    serde_json::to_string(properties).unwrap_or_else(|_| "{}".to_string())
}

fn parse_props(raw: &str) -> BTreeMap<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn node_from_row(row: &neo4rs::Row, prefix: &str) -> GraphNode {
    let fqid: String = row.get(&format!("{prefix}_fqid")).unwrap_or_default();
    let node_type: String = row.get(&format!("{prefix}_type")).unwrap_or_default();
    let packet_id: String = row.get(&format!("{prefix}_packet")).unwrap_or_default();
    let props: String = row.get(&format!("{prefix}_props")).unwrap_or_default();
    GraphNode {
        fqid,
        node_type,
        properties: parse_props(&props),
        packet_id,
    }
}

#[async_trait]
impl GraphBrain for BoltGraphBrain {
    async fn upsert_entities(
        &self,
        packet_id: &str,
        entities: &[Entity],
    ) -> Result<(), BrainError> {
        for entity in entities {
            let fqid = fq_entity_id(packet_id, &entity.id);
            // MERGE by fqid upgrades placeholders in place: same node,
            // type and properties replaced by the authoritative packet.
            let q = query(
                "MERGE (e:Entity {fqid: $fqid})
                 SET e.entity_type = $entity_type,
                     e.packet_id = $packet_id,
                     e.props = $props",
            )
            .param("fqid", fqid)
            .param("entity_type", entity.entity_type.as_str())
            .param("packet_id", packet_id)
            .param("props", props_json(&entity.properties));
            self.client.graph.run(q).await?;
        }
        debug!(packet_id, entities = entities.len(), "Upserted graph entities");
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        packet_id: &str,
        relationships: &[Relationship],
    ) -> Result<(), BrainError> {
        for rel in relationships {
            let src = Self::resolve_endpoint(packet_id, &rel.source_id);
            let dst = Self::resolve_endpoint(packet_id, &rel.target_id);
            self.merge_endpoint(&src).await?;
            self.merge_endpoint(&dst).await?;

            let rel_type = sanitize_rel_type(&rel.rel_type);
            // Idempotent on (source, target, type). Packets are
            // content-addressed, so a replay carries identical props and
            // wholesale replacement is a merge.
            let cypher = format!(
                "MATCH (s:Entity {{fqid: $src}}), (t:Entity {{fqid: $dst}})
                 MERGE (s)-[r:{rel_type}]->(t)
                 SET r.packet_id = $packet_id,
                     r.props = $props",
            );
            let q = query(&cypher)
                .param("src", src)
                .param("dst", dst)
                .param("packet_id", packet_id)
                .param("props", props_json(&rel.properties));
            self.client.graph.run(q).await?;
        }
        Ok(())
    }

    async fn neighborhood(
        &self,
        node_id: &str,
        depth: u32,
        edge_types: Option<&[String]>,
    ) -> Result<Subgraph, BrainError> {
        let depth = depth.clamp(1, 5);
        let type_filter = match edge_types {
            Some(types) if !types.is_empty() => {
                let sanitized: Vec<String> =
                    types.iter().map(|t| sanitize_rel_type(t)).collect();
                format!(":{}", sanitized.join("|"))
            }
            _ => String::new(),
        };

        let mut subgraph = Subgraph::default();

        // Origin node first so a lone node still yields itself.
        let q = query(
            "MATCH (n:Entity {fqid: $fqid})
             RETURN n.fqid AS n_fqid, n.entity_type AS n_type,
                    n.packet_id AS n_packet, n.props AS n_props",
        )
        .param("fqid", node_id);
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            subgraph.nodes.push(node_from_row(&row, "n"));
        }
        if subgraph.nodes.is_empty() {
            return Ok(subgraph);
        }

        let cypher = format!(
            "MATCH path = (n:Entity {{fqid: $fqid}})-[{type_filter}*1..{depth}]-(:Entity)
             UNWIND relationships(path) AS rel
             WITH DISTINCT rel
             RETURN startNode(rel).fqid AS s_fqid, startNode(rel).entity_type AS s_type,
                    startNode(rel).packet_id AS s_packet, startNode(rel).props AS s_props,
                    endNode(rel).fqid AS t_fqid, endNode(rel).entity_type AS t_type,
                    endNode(rel).packet_id AS t_packet, endNode(rel).props AS t_props,
                    type(rel) AS rel_type, rel.packet_id AS rel_packet,
                    coalesce(rel.props, '{{}}') AS rel_props",
        );
        let q = query(&cypher).param("fqid", node_id);
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            let source = node_from_row(&row, "s");
            let target = node_from_row(&row, "t");
            let rel_type: String = row.get("rel_type").unwrap_or_default();
            let rel_packet: String = row.get("rel_packet").unwrap_or_default();
            let rel_props: String = row.get("rel_props").unwrap_or_default();
            for node in [source.clone(), target.clone()] {
                if !subgraph.nodes.iter().any(|n| n.fqid == node.fqid) {
                    subgraph.nodes.push(node);
                }
            }
            subgraph.edges.push(GraphEdge {
                source: source.fqid,
                target: target.fqid,
                edge_type: rel_type,
                properties: parse_props(&rel_props),
                packet_id: rel_packet,
            });
        }
        Ok(subgraph)
    }

    async fn find_by_type(
        &self,
        entity_type: &str,
        properties: Option<&BTreeMap<String, Value>>,
    ) -> Result<Vec<GraphNode>, BrainError> {
        let q = query(
            "MATCH (e:Entity) WHERE e.entity_type = $entity_type
             RETURN e.fqid AS e_fqid, e.entity_type AS e_type,
                    e.packet_id AS e_packet, e.props AS e_props",
        )
        .param("entity_type", entity_type);
        let mut stream = self.client.graph.execute(q).await?;
        let mut nodes = Vec::new();
        while let Some(row) = stream.next().await? {
            let node = node_from_row(&row, "e");
            if properties.is_none_or(|wanted| props_match(&node.properties, wanted)) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn shortest_paths(
        &self,
        src: &str,
        dst: &str,
        max_len: u32,
    ) -> Result<Vec<GraphPath>, BrainError> {
        let max_len = max_len.clamp(1, 8);
        let cypher = format!(
            "MATCH (a:Entity {{fqid: $src}}), (b:Entity {{fqid: $dst}})
             MATCH p = allShortestPaths((a)-[*..{max_len}]-(b))
             RETURN [x IN nodes(p) | x.fqid] AS fqids,
                    [x IN nodes(p) | x.entity_type] AS types,
                    [x IN nodes(p) | coalesce(x.packet_id, '')] AS packets,
                    [x IN nodes(p) | coalesce(x.props, '{{}}')] AS props",
        );
        let q = query(&cypher).param("src", src).param("dst", dst);
        let mut stream = self.client.graph.execute(q).await?;
        let mut paths = Vec::new();
        while let Some(row) = stream.next().await? {
            let fqids: Vec<String> = row.get("fqids").unwrap_or_default();
            let types: Vec<String> = row.get("types").unwrap_or_default();
            let packets: Vec<String> = row.get("packets").unwrap_or_default();
            let props: Vec<String> = row.get("props").unwrap_or_default();
            let nodes = fqids
                .into_iter()
                .enumerate()
                .map(|(i, fqid)| GraphNode {
                    fqid,
                    node_type: types.get(i).cloned().unwrap_or_default(),
                    packet_id: packets.get(i).cloned().unwrap_or_default(),
                    properties: props.get(i).map(|p| parse_props(p)).unwrap_or_default(),
                })
                .collect();
            paths.push(GraphPath { nodes });
        }
        Ok(paths)
    }

    async fn delete(&self, packet_id: &str) -> Result<(), BrainError> {
        // Edges tagged with the packet go first, then the packet's nodes
        // with whatever edges still hang off them.
        let q = query("MATCH ()-[r {packet_id: $packet_id}]-() DELETE r")
            .param("packet_id", packet_id);
        self.client.graph.run(q).await?;
        let q = query("MATCH (e:Entity {packet_id: $packet_id}) DETACH DELETE e")
            .param("packet_id", packet_id);
        self.client.graph.run(q).await?;
        Ok(())
    }
}

/// Property match used by `find_by_type`: string values match
/// case-insensitively, and either side containing the other counts (this is
/// the `name ≈ …` behavior author lookups rely on). Non-strings match
/// exactly.
pub(crate) fn props_match(
    actual: &BTreeMap<String, Value>,
    wanted: &BTreeMap<String, Value>,
) -> bool {
    wanted.iter().all(|(key, want)| {
        actual.get(key).is_some_and(|have| match (have, want) {
            (Value::String(have), Value::String(want)) => {
                let have = have.to_lowercase();
                let want = want.to_lowercase();
                have == want || have.contains(&want) || want.contains(&have)
            }
            _ => have == want,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rel_type_sanitization() {
        assert_eq!(sanitize_rel_type("AUTHORED"), "AUTHORED");
        assert_eq!(sanitize_rel_type("contributed-to"), "CONTRIBUTED_TO");
        assert_eq!(sanitize_rel_type("references; DROP"), "REFERENCES__DROP");
        assert_eq!(sanitize_rel_type("1hop"), "REL_1HOP");
        assert_eq!(sanitize_rel_type(""), "REL_");
    }

    #[test]
    fn props_match_is_fuzzy_for_strings() {
        let actual: BTreeMap<String, Value> =
            [("name".to_string(), json!("Sarah Chen"))].into_iter().collect();
        let exact: BTreeMap<String, Value> =
            [("name".to_string(), json!("sarah chen"))].into_iter().collect();
        let partial: BTreeMap<String, Value> =
            [("name".to_string(), json!("Sarah"))].into_iter().collect();
        let wrong: BTreeMap<String, Value> =
            [("name".to_string(), json!("Mike"))].into_iter().collect();
        assert!(props_match(&actual, &exact));
        assert!(props_match(&actual, &partial));
        assert!(!props_match(&actual, &wrong));
    }

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            BoltGraphBrain::resolve_endpoint("pkt1", "e1"),
            "kp://pkt1/e1"
        );
        assert_eq!(
            BoltGraphBrain::resolve_endpoint("pkt1", "kp://other/e2"),
            "kp://other/e2"
        );
        assert_eq!(BoltGraphBrain::owner_of("kp://other/e2"), "other");
    }
}
