use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tracing::{debug, info, warn};

use nancy_brains::{BrainError, BrainSet, PacketIndexRow};
use nancy_common::{BrainKind, Entity, KnowledgePacket, PacketState, Relationship};

use crate::keyed_lock::KeyedLocks;
use crate::outcome::{AdapterResult, IngestOutcome, WriteOutcome};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Transient-error retries per adapter write.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on the per-packet lock arena.
    pub lock_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            lock_capacity: 1024,
        }
    }
}

/// Routes one validated packet across the brains with per-store
/// transactional semantics: sequential writes, bounded retries on transient
/// failures, compensation records on partial failure, best-effort undo when
/// the index of record can't be written. Pure function of packet content
/// plus adapter availability; queueing lives elsewhere.
pub struct BrainRouter {
    brains: BrainSet,
    config: RouterConfig,
    health: RwLock<HashMap<BrainKind, bool>>,
    locks: KeyedLocks,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub scanned: usize,
    pub committed: usize,
    pub still_pending: usize,
    pub orphaned: usize,
}

impl BrainRouter {
    pub fn new(brains: BrainSet, config: RouterConfig) -> Self {
        let locks = KeyedLocks::new(config.lock_capacity);
        Self {
            brains,
            config,
            health: RwLock::new(HashMap::new()),
            locks,
        }
    }

    pub fn set_healthy(&self, kind: BrainKind, healthy: bool) {
        self.health.write().unwrap().insert(kind, healthy);
    }

    pub fn is_healthy(&self, kind: BrainKind) -> bool {
        *self.health.read().unwrap().get(&kind).unwrap_or(&true)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt);
        let ms = (self.config.base_delay.as_millis() as u64).saturating_mul(exp);
        Duration::from_millis(ms.min(self.config.max_delay.as_millis() as u64))
    }

    /// Persist one packet. Concurrent submissions of the same `packet_id`
    /// serialize; everything the router does is idempotent on `packet_id`,
    /// so replays converge to the same terminal state.
    pub async fn apply(&self, packet: &KnowledgePacket) -> IngestOutcome {
        let _guard = self.locks.acquire(&packet.packet_id).await;

        let mut row = PacketIndexRow::from_packet(packet);
        // Typed analytical scalars join the queryable metadata namespace.
        if let Some(analytical) = &packet.content.analytical {
            for (name, value) in &analytical.fields {
                row.metadata.insert(name.clone(), value.clone());
            }
        }

        let enriched = self.enrich_graph_content(packet).await;

        let mut order: Vec<BrainKind> = [BrainKind::Vector, BrainKind::Analytical, BrainKind::Graph]
            .into_iter()
            .filter(|kind| {
                *kind == BrainKind::Analytical
                    || packet.content_brains().contains(kind)
                    || (*kind == BrainKind::Graph && enriched.is_some())
            })
            .collect();
        if let Some(priority) = packet.priority_brain() {
            if let Some(pos) = order.iter().position(|k| *k == priority) {
                let kind = order.remove(pos);
                order.insert(0, kind);
            }
        }

        let mut results = Vec::with_capacity(order.len());
        for kind in order {
            if !self.is_healthy(kind) {
                debug!(packet_id = %packet.packet_id, brain = %kind, "Skipping unhealthy adapter");
                results.push(AdapterResult {
                    brain: kind,
                    outcome: WriteOutcome::Skipped {
                        reason: "adapter unhealthy".into(),
                    },
                    retries: 0,
                });
                continue;
            }

            let mut retries = 0;
            let outcome = loop {
                match self.write_to(kind, packet, &row, enriched.as_deref()).await {
                    Ok(()) => break WriteOutcome::Ok,
                    Err(err) if err.is_transient() && retries < self.config.max_retries => {
                        let delay = self.delay_for(retries);
                        retries += 1;
                        warn!(
                            packet_id = %packet.packet_id,
                            brain = %kind,
                            error = %err,
                            retry = retries,
                            "Transient adapter failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        if err.is_catastrophic() {
                            warn!(brain = %kind, error = %err, "Marking adapter unhealthy");
                            self.set_healthy(kind, false);
                        }
                        break WriteOutcome::Failed {
                            error: err.to_string(),
                        };
                    }
                }
            };
            results.push(AdapterResult {
                brain: kind,
                outcome,
                retries,
            });
        }

        let state = self.settle(packet, &results).await;
        info!(
            packet_id = %packet.packet_id,
            state = %state,
            adapters = results.len(),
            "Routed packet"
        );
        IngestOutcome {
            packet_id: packet.packet_id.clone(),
            state,
            results,
        }
    }

    /// Decide the terminal state and perform compensation bookkeeping.
    async fn settle(&self, packet: &KnowledgePacket, results: &[AdapterResult]) -> PacketState {
        let analytical_ok = results
            .iter()
            .find(|r| r.brain == BrainKind::Analytical)
            .is_some_and(|r| r.outcome.is_ok());

        if !analytical_ok {
            // Without the index of record the packet never happened:
            // best-effort undo of whatever landed before the failure.
            for (kind, result) in results.iter().map(|r| (r.brain, r)) {
                if !result.outcome.is_ok() || kind == BrainKind::Analytical {
                    continue;
                }
                let undo = match kind {
                    BrainKind::Vector => self.brains.vector.delete(&packet.packet_id).await,
                    BrainKind::Graph => self.brains.graph.delete(&packet.packet_id).await,
                    _ => Ok(()),
                };
                if let Err(e) = undo {
                    warn!(packet_id = %packet.packet_id, brain = %kind, error = %e, "Compensating delete failed");
                }
            }
            return PacketState::Rejected;
        }

        let failed: Vec<BrainKind> = results
            .iter()
            .filter(|r| !r.outcome.is_ok())
            .map(|r| r.brain)
            .collect();

        if failed.is_empty() {
            if let Err(e) = self
                .brains
                .analytical
                .clear_compensation(&packet.packet_id)
                .await
            {
                warn!(packet_id = %packet.packet_id, error = %e, "Failed to clear compensation row");
            }
            return PacketState::Committed;
        }

        if let Err(e) = self
            .brains
            .analytical
            .record_compensation(&packet.packet_id, &failed)
            .await
        {
            warn!(packet_id = %packet.packet_id, error = %e, "Failed to record compensation row");
        }
        PacketState::PartiallyCommitted
    }

    async fn write_to(
        &self,
        kind: BrainKind,
        packet: &KnowledgePacket,
        row: &PacketIndexRow,
        enriched: Option<&[Entity]>,
    ) -> Result<(), BrainError> {
        match kind {
            BrainKind::Vector => {
                let chunks = packet
                    .content
                    .vector
                    .as_ref()
                    .map(|v| v.chunks.as_slice())
                    .unwrap_or_default();
                self.brains
                    .vector
                    .upsert_chunks(&packet.packet_id, chunks, &row.metadata)
                    .await
            }
            BrainKind::Analytical => {
                self.brains.analytical.upsert_packet_row(row, packet).await?;
                if let Some(table) = packet.content.analytical.as_ref().and_then(|a| a.table.as_ref())
                {
                    let table_name = row
                        .metadata
                        .get("table_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("data");
                    self.brains
                        .analytical
                        .upsert_table(&packet.packet_id, table_name, &table.columns, &table.rows)
                        .await?;
                }
                Ok(())
            }
            BrainKind::Graph => {
                let (entities, relationships): (&[Entity], &[Relationship]) =
                    match (&packet.content.graph, enriched) {
                        (Some(graph), _) => (&graph.entities, &graph.relationships),
                        (None, Some(entities)) => (entities, &[]),
                        (None, None) => (&[], &[]),
                    };
                self.brains
                    .graph
                    .upsert_entities(&packet.packet_id, entities)
                    .await?;
                self.brains
                    .graph
                    .upsert_relationships(&packet.packet_id, relationships)
                    .await
            }
            BrainKind::Linguistic => Ok(()),
        }
    }

    /// When a packet insists on the graph but carries no graph content, ask
    /// the linguistic brain to lift entities out of its text. Best-effort:
    /// an unavailable LLM just means no enrichment.
    async fn enrich_graph_content(&self, packet: &KnowledgePacket) -> Option<Vec<Entity>> {
        let graph_empty = packet
            .content
            .graph
            .as_ref()
            .map(|g| g.is_empty())
            .unwrap_or(true);
        let wants_graph = packet.priority_brain() == Some(BrainKind::Graph);
        let text: String = packet
            .content
            .vector
            .as_ref()
            .map(|v| {
                v.chunks
                    .iter()
                    .map(|c| c.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        if !graph_empty || !wants_graph || text.is_empty() {
            return None;
        }

        match self.brains.linguistic.extract_entities(&text).await {
            Ok(extracted) if !extracted.is_empty() => {
                let entities = extracted
                    .into_iter()
                    .enumerate()
                    .map(|(i, e)| Entity {
                        id: e
                            .properties
                            .get("name")
                            .and_then(|v| v.as_str())
                            .map(|n| n.to_lowercase().replace(' ', "-"))
                            .unwrap_or_else(|| format!("extracted-{i}")),
                        entity_type: e.entity_type,
                        properties: e.properties,
                    })
                    .collect();
                Some(entities)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(packet_id = %packet.packet_id, error = %e, "Entity enrichment unavailable");
                None
            }
        }
    }

    /// Replay packets with pending compensation rows. Health flags are reset
    /// first so a recovered adapter gets probed by the replay itself.
    pub async fn sweep_once(&self, max_attempts: u32) -> Result<SweepStats, BrainError> {
        self.health.write().unwrap().clear();

        let pending = self.brains.analytical.pending_compensation().await?;
        let mut stats = SweepStats {
            scanned: pending.len(),
            ..Default::default()
        };
        for row in pending {
            if row.attempts >= max_attempts {
                debug!(packet_id = %row.packet_id, attempts = row.attempts, "Compensation attempts exhausted");
                stats.still_pending += 1;
                continue;
            }
            match self.brains.analytical.load_packet(&row.packet_id).await? {
                Some(packet) => {
                    let outcome = self.apply(&packet).await;
                    if outcome.state == PacketState::Committed {
                        stats.committed += 1;
                    } else {
                        self.brains
                            .analytical
                            .bump_compensation_attempt(&row.packet_id)
                            .await?;
                        stats.still_pending += 1;
                    }
                }
                None => {
                    // Row without a stored packet can never be replayed.
                    self.brains
                        .analytical
                        .clear_compensation(&row.packet_id)
                        .await?;
                    stats.orphaned += 1;
                }
            }
        }
        if stats.scanned > 0 {
            info!(
                scanned = stats.scanned,
                committed = stats.committed,
                still_pending = stats.still_pending,
                "Compensation sweep complete"
            );
        }
        Ok(stats)
    }
}
