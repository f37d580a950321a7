use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use nancy_router::BrainRouter;

use crate::queue::QueueReceiver;

/// Fixed-size pool draining the ingest queue into the router. Each worker
/// loops: claim an item, route it, report the outcome, go back. The pool
/// winds down when the queue's senders are gone.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, rx: QueueReceiver, router: Arc<BrainRouter>) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    loop {
                        // Hold the receiver lock only for the claim; routing
                        // happens with the lock released.
                        let item = { rx.lock().await.recv().await };
                        let Some(item) = item else { break };
                        debug!(
                            worker_id,
                            packet_id = %item.packet.packet_id,
                            queued_at = %item.received_at,
                            "Worker claimed packet"
                        );
                        let outcome = router.apply(&item.packet).await;
                        if let Some(done) = item.done {
                            let _ = done.send(outcome);
                        }
                    }
                    debug!(worker_id, "Worker stopped: queue closed");
                })
            })
            .collect();
        info!(workers = workers.max(1), "Ingest worker pool started");
        Self { handles }
    }

    /// Wait for every worker to finish draining. Call after dropping all
    /// queue senders.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nancy_brains::testing::{
        MemoryAnalyticalBrain, MemoryGraphBrain, MemoryVectorBrain, PacketBuilder,
        ScriptedLinguistic,
    };
    use nancy_brains::BrainSet;
    use nancy_common::PacketState;
    use nancy_router::RouterConfig;
    use tokio::sync::oneshot;

    use crate::queue::{IngestQueue, QueueItem};

    fn router() -> (Arc<MemoryAnalyticalBrain>, Arc<BrainRouter>) {
        let analytical = Arc::new(MemoryAnalyticalBrain::new());
        let brains = BrainSet {
            vector: Arc::new(MemoryVectorBrain::new()),
            analytical: analytical.clone(),
            graph: Arc::new(MemoryGraphBrain::new()),
            linguistic: Arc::new(ScriptedLinguistic::new()),
        };
        (
            analytical,
            Arc::new(BrainRouter::new(brains, RouterConfig::default())),
        )
    }

    #[tokio::test]
    async fn workers_drain_queue_and_report_outcomes() {
        let (analytical, router) = router();
        let (queue, rx) = IngestQueue::new(8);
        let pool = WorkerPool::spawn(2, rx, router);

        let mut waiters = Vec::new();
        for i in 0..5 {
            let packet = PacketBuilder::document(&format!("Doc {i}")).body("text").build();
            let (tx, rx) = oneshot::channel();
            assert!(queue.push(QueueItem::new(packet, Some(tx))).await);
            waiters.push(rx);
        }
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().state, PacketState::Committed);
        }
        assert_eq!(analytical.row_count(), 5);

        drop(queue);
        pool.join().await;
    }
}
