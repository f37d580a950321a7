// End-to-end scenarios through the facade, on the in-memory brains:
// author attribution, semantic ranking, metadata filtering, relationship
// discovery, partial commit with compensation, core-only mode, and
// validation isolation for plugin streams.

use std::sync::Arc;
use std::time::Duration;

use nancy_brains::testing::{
    MemoryAnalyticalBrain, MemoryGraphBrain, MemoryVectorBrain, PacketBuilder, ScriptedLinguistic,
};
use nancy_brains::{BrainError, BrainSet};
use nancy_common::{
    seal, BrainKind, Intent, IntentFilters, KnowledgePacket, NancyError, PacketState,
    PluginManifest, QueryStrategy,
};
use nancy_host::{HostConfig, PluginEvent, PluginState};
use nancy_orchestrator::{Nancy, NancyConfig};

struct Fixture {
    vector: Arc<MemoryVectorBrain>,
    analytical: Arc<MemoryAnalyticalBrain>,
    graph: Arc<MemoryGraphBrain>,
    nancy: Arc<Nancy>,
}

fn fixture(linguistic: ScriptedLinguistic) -> Fixture {
    let vector = Arc::new(MemoryVectorBrain::new());
    let analytical = Arc::new(MemoryAnalyticalBrain::new());
    let graph = Arc::new(MemoryGraphBrain::new());
    let brains = BrainSet {
        vector: vector.clone(),
        analytical: analytical.clone(),
        graph: graph.clone(),
        linguistic: Arc::new(linguistic),
    };
    let nancy = Nancy::new(brains, NancyConfig::default());
    Fixture {
        vector,
        analytical,
        graph,
        nancy,
    }
}

async fn ingest_ok(f: &Fixture, packet: &KnowledgePacket) {
    let outcome = f.nancy.ingest_packet(packet.clone()).await.unwrap();
    assert_eq!(outcome.state, PacketState::Committed);
}

// --- Scenario A: author attribution ---

#[tokio::test]
async fn author_attribution_end_to_end() {
    let linguistic = ScriptedLinguistic::new().on_intent(
        "sarah chen",
        Intent {
            strategy: QueryStrategy::AuthorAttribution,
            primary_store: BrainKind::Graph,
            needs: vec![BrainKind::Graph, BrainKind::Analytical],
            entities: vec!["Sarah Chen".into()],
            filters: IntentFilters {
                author: Some("Sarah Chen".into()),
                ..Default::default()
            },
        },
    );
    let f = fixture(linguistic);

    let packet = PacketBuilder::document("Thermal Analysis")
        .author("Sarah Chen")
        .body("Thermal margins for the controller board.")
        .entity("doc", "Document", "Thermal Analysis")
        .entity("p1", "Person", "Sarah Chen")
        .relationship("p1", "doc", "CONTRIBUTED_TO")
        .build();
    ingest_ok(&f, &packet).await;

    let response = f.nancy.query("documents by Sarah Chen").await.unwrap();
    assert_eq!(response.intent.strategy, QueryStrategy::AuthorAttribution);
    assert_eq!(response.citations, vec![packet.packet_id.clone()]);
    assert!(response.answer.contains("Sarah Chen"));
}

// --- Scenario B: semantic ranking ---

#[tokio::test]
async fn semantic_ranking_end_to_end() {
    let linguistic = ScriptedLinguistic::new().on_intent(
        "power requirements",
        Intent {
            strategy: QueryStrategy::Semantic,
            primary_store: BrainKind::Vector,
            needs: vec![BrainKind::Vector],
            entities: vec!["power requirements".into()],
            filters: IntentFilters::default(),
        },
    );
    let f = fixture(linguistic);

    let thermal = PacketBuilder::document("Thermal Analysis")
        .body("Fan curves and junction temperatures.")
        .build();
    let power = PacketBuilder::document("Power Budget")
        .body("Power requirements per rail, total power draw.")
        .build();
    let mech = PacketBuilder::document("Mechanical Enclosure")
        .body("Bend radii and panel thickness.")
        .build();
    for packet in [&thermal, &power, &mech] {
        ingest_ok(&f, packet).await;
    }

    let response = f.nancy.query("power requirements").await.unwrap();
    assert_eq!(response.citations.first(), Some(&power.packet_id));
    assert!(response.intent.needs.contains(&BrainKind::Vector));
}

// --- Scenario C: metadata filter, analytical only ---

#[tokio::test]
async fn metadata_filter_end_to_end() {
    let linguistic = ScriptedLinguistic::new().on_intent(
        "q4 2024",
        Intent {
            strategy: QueryStrategy::MetadataFilter,
            primary_store: BrainKind::Analytical,
            needs: vec![BrainKind::Analytical],
            entities: vec![],
            filters: IntentFilters {
                created_after: Some("2024-10-01T00:00:00Z".parse().unwrap()),
                created_before: Some("2025-01-01T00:00:00Z".parse().unwrap()),
                ..Default::default()
            },
        },
    );
    let f = fixture(linguistic);

    let dates = [
        ("Kickoff", "2024-01-15T00:00:00Z", false),
        ("Design Review", "2024-04-10T00:00:00Z", false),
        ("Prototype", "2024-08-01T00:00:00Z", false),
        ("EMC Retest", "2024-10-20T00:00:00Z", true),
        ("Ship Review", "2024-12-05T00:00:00Z", true),
    ];
    let mut expected = Vec::new();
    for (title, created, in_q4) in dates {
        let packet = PacketBuilder::document(title)
            .body("notes")
            .created_at(created)
            .build();
        if in_q4 {
            expected.push(packet.packet_id.clone());
        }
        ingest_ok(&f, &packet).await;
    }

    let response = f.nancy.query("documents from Q4 2024").await.unwrap();
    assert_eq!(response.intent.strategy, QueryStrategy::MetadataFilter);

    let mut got = response.citations.clone();
    got.sort();
    expected.sort();
    assert_eq!(got, expected);
    assert!(!response.trace.called(BrainKind::Vector));
}

// --- Scenario D: relationship discovery ---

#[tokio::test]
async fn relationship_discovery_end_to_end() {
    let linguistic = ScriptedLinguistic::new().on_intent(
        "mike",
        Intent {
            strategy: QueryStrategy::DecisionProvenance,
            primary_store: BrainKind::Graph,
            needs: vec![BrainKind::Graph, BrainKind::Vector],
            entities: vec!["Mike".into()],
            filters: IntentFilters::default(),
        },
    );
    let f = fixture(linguistic);

    let emc = PacketBuilder::document("EMC Report")
        .body("Radiated emissions failed at 120 MHz.")
        .entity("mike", "Person", "Mike")
        .entity("emc", "Document", "EMC")
        .relationship("mike", "emc", "AUTHORED")
        .build();
    ingest_ok(&f, &emc).await;

    let decision = PacketBuilder::document("Ground Plane Decision")
        .body("Switch to a solid ground plane.")
        .entity("gp", "Decision", "Ground plane")
        .relationship(&format!("kp://{}/emc", emc.packet_id), "gp", "REFERENCES")
        .build();
    ingest_ok(&f, &decision).await;

    let response = f.nancy.query("what decisions did Mike influence").await.unwrap();
    assert!(matches!(
        response.intent.strategy,
        QueryStrategy::RelationshipDiscovery | QueryStrategy::DecisionProvenance
    ));
    assert!(response.citations.contains(&emc.packet_id));
    assert!(response.citations.contains(&decision.packet_id));
    assert!(response.answer.contains("EMC"));
    assert!(response.answer.contains("Ground plane"));
}

// --- Scenario E: partial commit, then reconvergence ---

#[tokio::test]
async fn partial_commit_then_reconverges() {
    let f = fixture(ScriptedLinguistic::new());
    f.graph
        .fail_next(BrainError::Permanent("constraint violation".into()));

    let packet = PacketBuilder::document("All Sections")
        .body("Text body for the vector store.")
        .field("row_count", serde_json::json!(3))
        .entity("e1", "Component", "PSU")
        .build();

    let outcome = f.nancy.ingest_packet(packet.clone()).await.unwrap();
    assert_eq!(outcome.state, PacketState::PartiallyCommitted);
    assert!(f.analytical.has_packet(&packet.packet_id));
    assert_eq!(f.vector.chunk_count(&packet.packet_id), 1);
    assert!(f.analytical.compensation_for(&packet.packet_id).is_some());

    // Adapter recovered: the same submission converges to Committed.
    let outcome = f.nancy.ingest_packet(packet.clone()).await.unwrap();
    assert_eq!(outcome.state, PacketState::Committed);
    assert!(f.analytical.compensation_for(&packet.packet_id).is_none());
    assert_eq!(f.graph.nodes_for_packet(&packet.packet_id).len(), 1);
}

// --- Scenario F: core-only mode ---

#[tokio::test]
async fn core_only_mode_end_to_end() {
    let linguistic = ScriptedLinguistic::new().on_intent(
        "notes",
        Intent {
            strategy: QueryStrategy::Semantic,
            primary_store: BrainKind::Vector,
            needs: vec![BrainKind::Vector],
            entities: vec!["notes".into()],
            filters: IntentFilters::default(),
        },
    );
    let f = fixture(linguistic);

    let err = f.nancy.ingest_file("/tmp/x.txt", None).await.unwrap_err();
    assert!(matches!(err, NancyError::NoPluginForType(_)));

    // A forced health round over zero plugins is a clean no-op.
    f.nancy.health_tick().await;

    let packet = PacketBuilder::document("Standalone Notes")
        .body("Core-only ingestion notes.")
        .build();
    ingest_ok(&f, &packet).await;

    let response = f.nancy.query("notes").await.unwrap();
    assert!(response.citations.contains(&packet.packet_id));
}

// --- Background health loop drives supervision without explicit calls ---

#[tokio::test]
async fn background_health_loop_terminates_broken_plugin() {
    let brains = BrainSet {
        vector: Arc::new(MemoryVectorBrain::new()),
        analytical: Arc::new(MemoryAnalyticalBrain::new()),
        graph: Arc::new(MemoryGraphBrain::new()),
        linguistic: Arc::new(ScriptedLinguistic::new()),
    };
    let config = NancyConfig {
        health_check_interval: Duration::from_millis(25),
        host: HostConfig {
            restart_budget: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let nancy = Nancy::new(brains, config);

    // Spawn fails (no such binary), leaving the plugin Unhealthy. From here
    // only the background loop touches it: one restart attempt within the
    // budget, then termination.
    nancy
        .launch_plugins(vec![PluginManifest {
            name: "ghost".into(),
            command: "/nonexistent/plugin-binary".into(),
            args: vec![],
            enabled: true,
            supported_extensions: vec!["md".into()],
            env: Default::default(),
        }])
        .await;
    assert!(nancy.host().plugin_state("ghost").await.is_some());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if nancy.host().plugin_state("ghost").await == Some(PluginState::Terminated) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "health loop never terminated the broken plugin"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// --- Validation isolation for plugin streams ---

#[tokio::test]
async fn invalid_stream_packets_are_dropped_not_fatal() {
    let f = fixture(ScriptedLinguistic::new());
    let events = f.nancy.plugin_events();

    let total = 100;
    let invalid_every = 10; // 10 of 100 invalid
    for i in 0..total {
        let packet = PacketBuilder::document(&format!("Streamed {i}"))
            .body("streamed content")
            .build();
        let packet = if i % invalid_every == 0 {
            // Stale packet_id: mutate after sealing.
            let mut broken = packet;
            broken.metadata.title = Some("tampered".into());
            broken
        } else {
            packet
        };
        events
            .send(PluginEvent::Packet {
                plugin: "streamer".into(),
                packet: Box::new(packet),
            })
            .await
            .unwrap();
    }

    // Let the pump and workers drain.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while f.analytical.row_count() < 90 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(f.analytical.row_count(), 90);
}

// --- Rejected validation surfaces as a typed error ---

#[tokio::test]
async fn ingest_packet_rejects_invalid_with_issue_list() {
    let f = fixture(ScriptedLinguistic::new());
    let mut packet = PacketBuilder::document("Will Break").body("text").build();
    packet.packet_version = "2.0".into();
    packet = seal(packet).unwrap();
    packet.metadata.author = Some("tampered".into());

    let err = f.nancy.ingest_packet(packet).await.unwrap_err();
    match err {
        NancyError::Validation(issues) => {
            assert!(issues.iter().any(|i| i.field == "packet_version"));
            assert!(issues.iter().any(|i| i.field == "packet_id"));
        }
        other => panic!("expected validation error, got {other}"),
    }
}

// --- Query overload fails fast ---

#[tokio::test]
async fn query_overload_fails_fast() {
    let linguistic = ScriptedLinguistic::new()
        .with_latency(Duration::from_millis(300))
        .on_intent(
            "anything",
            Intent {
                strategy: QueryStrategy::Semantic,
                primary_store: BrainKind::Vector,
                needs: vec![BrainKind::Vector],
                entities: vec![],
                filters: IntentFilters::default(),
            },
        );
    let brains = BrainSet {
        vector: Arc::new(MemoryVectorBrain::new()),
        analytical: Arc::new(MemoryAnalyticalBrain::new()),
        graph: Arc::new(MemoryGraphBrain::new()),
        linguistic: Arc::new(linguistic),
    };
    let config = NancyConfig {
        query_concurrency: 1,
        query_acquire_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let nancy = Nancy::new(brains, config);

    // First query holds the only slot for ~600ms of scripted latency.
    let holder = nancy.clone();
    let held = tokio::spawn(async move { holder.query("anything").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second query cannot get a slot within its acquire timeout.
    let err = nancy.query("anything").await.unwrap_err();
    assert!(matches!(err, NancyError::Overloaded(_)));

    assert!(held.await.unwrap().is_ok());
}
