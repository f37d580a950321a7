// Routing semantics against the in-memory brains: section targeting,
// terminal states, compensation, retries, idempotence.

use std::sync::Arc;
use std::time::Duration;

use nancy_brains::testing::{
    MemoryAnalyticalBrain, MemoryGraphBrain, MemoryVectorBrain, PacketBuilder, ScriptedLinguistic,
};
use nancy_brains::{BrainError, BrainSet};
use nancy_common::{BrainKind, ExtractedEntity, PacketState, PriorityBrain};
use nancy_router::{BrainRouter, RouterConfig, WriteOutcome};

struct Fixture {
    vector: Arc<MemoryVectorBrain>,
    analytical: Arc<MemoryAnalyticalBrain>,
    graph: Arc<MemoryGraphBrain>,
    router: BrainRouter,
}

fn fixture() -> Fixture {
    fixture_with_linguistic(ScriptedLinguistic::new())
}

fn fixture_with_linguistic(linguistic: ScriptedLinguistic) -> Fixture {
    let vector = Arc::new(MemoryVectorBrain::new());
    let analytical = Arc::new(MemoryAnalyticalBrain::new());
    let graph = Arc::new(MemoryGraphBrain::new());
    let brains = BrainSet {
        vector: vector.clone(),
        analytical: analytical.clone(),
        graph: graph.clone(),
        linguistic: Arc::new(linguistic),
    };
    let config = RouterConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..Default::default()
    };
    Fixture {
        vector,
        analytical,
        graph,
        router: BrainRouter::new(brains, config),
    }
}

#[tokio::test]
async fn routes_only_to_present_sections_plus_analytical() {
    let f = fixture();
    let packet = PacketBuilder::document("Thermal Analysis")
        .author("Sarah Chen")
        .body("Heat rises through the chassis.")
        .build();

    let outcome = f.router.apply(&packet).await;
    assert_eq!(outcome.state, PacketState::Committed);
    assert!(outcome.result_for(BrainKind::Vector).unwrap().outcome.is_ok());
    assert!(outcome.result_for(BrainKind::Analytical).unwrap().outcome.is_ok());
    assert!(outcome.result_for(BrainKind::Graph).is_none());

    assert_eq!(f.vector.chunk_count(&packet.packet_id), 1);
    assert!(f.analytical.has_packet(&packet.packet_id));
    assert_eq!(f.graph.node_count(), 0);
}

#[tokio::test]
async fn ingestion_is_idempotent() {
    let f = fixture();
    let packet = PacketBuilder::document("Power Budget")
        .body("Total power draw by subsystem.")
        .entity("doc", "Document", "Power Budget")
        .entity("p1", "Person", "Mike")
        .relationship("p1", "doc", "AUTHORED")
        .build();

    let first = f.router.apply(&packet).await;
    let second = f.router.apply(&packet).await;
    assert_eq!(first.state, PacketState::Committed);
    assert_eq!(second.state, PacketState::Committed);

    assert_eq!(f.vector.chunk_count(&packet.packet_id), 1);
    assert_eq!(f.analytical.row_count(), 1);
    assert_eq!(f.graph.node_count(), 2);
    assert_eq!(f.graph.edge_count(), 1);
}

#[tokio::test]
async fn rejected_when_analytical_fails_and_prior_writes_are_undone() {
    let f = fixture();
    f.analytical
        .fail_next(BrainError::Permanent("constraint violation".into()));

    let packet = PacketBuilder::document("EMC Report")
        .body("Radiated emissions summary.")
        .entity("doc", "Document", "EMC Report")
        .build();

    let outcome = f.router.apply(&packet).await;
    assert_eq!(outcome.state, PacketState::Rejected);
    // Vector wrote before analytical failed; the undo must have removed it.
    assert_eq!(f.vector.chunk_count(&packet.packet_id), 0);
    assert_eq!(f.graph.nodes_for_packet(&packet.packet_id).len(), 0);
    assert!(!f.analytical.has_packet(&packet.packet_id));
}

#[tokio::test]
async fn partial_commit_records_compensation_and_reconverges() {
    let f = fixture();
    f.graph
        .fail_next(BrainError::Permanent("schema mismatch".into()));

    let packet = PacketBuilder::document("Ground Plane Decision")
        .body("Decided to use a solid ground plane.")
        .field("watts", serde_json::json!(12))
        .entity("d1", "Decision", "Ground plane")
        .build();

    let outcome = f.router.apply(&packet).await;
    assert_eq!(outcome.state, PacketState::PartiallyCommitted);
    assert!(f.analytical.has_packet(&packet.packet_id));
    assert_eq!(f.vector.chunk_count(&packet.packet_id), 1);

    let comp = f.analytical.compensation_for(&packet.packet_id).unwrap();
    assert_eq!(comp.adapters, vec![BrainKind::Graph]);

    // Adapter healthy again: re-submission commits and clears the row.
    let second = f.router.apply(&packet).await;
    assert_eq!(second.state, PacketState::Committed);
    assert!(f.analytical.compensation_for(&packet.packet_id).is_none());
    assert_eq!(f.graph.nodes_for_packet(&packet.packet_id).len(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_in_place() {
    let f = fixture();
    f.graph.fail_next(BrainError::Transient("timeout".into()));

    let packet = PacketBuilder::document("Retry Me")
        .body("text")
        .entity("e", "Component", "PSU")
        .build();

    let outcome = f.router.apply(&packet).await;
    assert_eq!(outcome.state, PacketState::Committed);
    let graph_result = outcome.result_for(BrainKind::Graph).unwrap();
    assert!(graph_result.outcome.is_ok());
    assert_eq!(graph_result.retries, 1);
}

#[tokio::test]
async fn catastrophic_failure_marks_adapter_unhealthy_for_later_packets() {
    let f = fixture();
    f.vector
        .fail_next(BrainError::Catastrophic("process dead".into()));

    let first = PacketBuilder::document("First").body("a").build();
    let outcome = f.router.apply(&first).await;
    assert_eq!(outcome.state, PacketState::PartiallyCommitted);

    let second = PacketBuilder::document("Second").body("b").build();
    let outcome = f.router.apply(&second).await;
    assert_eq!(outcome.state, PacketState::PartiallyCommitted);
    assert!(matches!(
        outcome.result_for(BrainKind::Vector).unwrap().outcome,
        WriteOutcome::Skipped { .. }
    ));
}

#[tokio::test]
async fn priority_brain_is_written_first() {
    let f = fixture();
    let packet = PacketBuilder::document("Graph First")
        .body("text")
        .entity("e", "Component", "PSU")
        .priority(PriorityBrain::Graph)
        .build();

    let outcome = f.router.apply(&packet).await;
    assert_eq!(outcome.results[0].brain, BrainKind::Graph);
    // Remaining adapters keep the fixed vector → analytical order.
    assert_eq!(outcome.results[1].brain, BrainKind::Vector);
    assert_eq!(outcome.results[2].brain, BrainKind::Analytical);
}

#[tokio::test]
async fn graph_priority_with_text_only_content_enriches_entities() {
    let linguistic = ScriptedLinguistic::new().on_entities(
        "ground plane",
        vec![ExtractedEntity {
            entity_type: "Decision".into(),
            properties: [("name".to_string(), serde_json::json!("Ground plane"))]
                .into_iter()
                .collect(),
            span: None,
        }],
    );
    let f = fixture_with_linguistic(linguistic);

    let packet = PacketBuilder::document("Meeting Notes")
        .body("We settled the ground plane question.")
        .priority(PriorityBrain::Graph)
        .build();

    let outcome = f.router.apply(&packet).await;
    assert_eq!(outcome.state, PacketState::Committed);
    let nodes = f.graph.nodes_for_packet(&packet.packet_id);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node_type, "Decision");
}

#[tokio::test]
async fn concurrent_submissions_of_same_packet_converge() {
    let f = fixture();
    let packet = PacketBuilder::document("Contended")
        .body("same packet twice")
        .entity("e", "Component", "PSU")
        .build();

    let router = &f.router;
    let (a, b) = tokio::join!(router.apply(&packet), router.apply(&packet));
    assert_eq!(a.state, PacketState::Committed);
    assert_eq!(b.state, PacketState::Committed);
    assert_eq!(f.vector.chunk_count(&packet.packet_id), 1);
    assert_eq!(f.analytical.row_count(), 1);
    assert_eq!(f.graph.nodes_for_packet(&packet.packet_id).len(), 1);
}

#[tokio::test]
async fn sweep_replays_stored_packets_until_committed() {
    let f = fixture();
    f.graph
        .fail_next(BrainError::Permanent("schema mismatch".into()));

    let packet = PacketBuilder::document("Sweep Me")
        .body("text")
        .entity("e", "Decision", "Retry policy")
        .build();
    assert_eq!(
        f.router.apply(&packet).await.state,
        PacketState::PartiallyCommitted
    );

    let stats = f.router.sweep_once(5).await.unwrap();
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.committed, 1);
    assert!(f.analytical.compensation_for(&packet.packet_id).is_none());
    assert_eq!(f.graph.nodes_for_packet(&packet.packet_id).len(), 1);
}

#[tokio::test]
async fn sweep_gives_up_after_attempt_budget() {
    let f = fixture();
    f.graph
        .fail_next(BrainError::Permanent("schema mismatch".into()));
    let packet = PacketBuilder::document("Stubborn")
        .body("text")
        .entity("e", "Decision", "x")
        .build();
    f.router.apply(&packet).await;

    // Keep the graph failing through each sweep.
    for _ in 0..2 {
        f.graph
            .fail_next(BrainError::Permanent("still broken".into()));
        let stats = f.router.sweep_once(2).await.unwrap();
        assert_eq!(stats.still_pending, 1);
    }
    let comp = f.analytical.compensation_for(&packet.packet_id).unwrap();
    assert_eq!(comp.attempts, 2);

    // Budget exhausted: row is left alone, not replayed.
    let stats = f.router.sweep_once(2).await.unwrap();
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.committed, 0);
    assert_eq!(stats.still_pending, 1);
}
