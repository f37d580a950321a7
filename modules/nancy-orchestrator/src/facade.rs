use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nancy_brains::BrainSet;
use nancy_common::{validate, KnowledgePacket, NancyError, PacketState, PluginManifest};
use nancy_host::{HostConfig, HostError, PluginEvent, PluginHost};
use nancy_ingest::{IngestQueue, QueueItem, WorkerPool};
use nancy_planner::{PlannerConfig, QueryPlanner, QueryResponse};
use nancy_router::{BrainRouter, IngestOutcome, RouterConfig};

#[derive(Debug, Clone)]
pub struct NancyConfig {
    pub queue_capacity: usize,
    pub ingest_workers: usize,
    pub query_concurrency: usize,
    /// How long a query waits for a slot before failing `Overloaded`.
    pub query_acquire_timeout: Duration,
    pub router: RouterConfig,
    pub planner: PlannerConfig,
    pub host: HostConfig,
    pub sweep_interval: Duration,
    pub sweep_max_attempts: u32,
    /// How often the background health loop probes every plugin.
    pub health_check_interval: Duration,
    /// Waiting budget for the per-packet outcomes of one `ingest_file`.
    pub file_ingest_deadline: Duration,
}

impl Default for NancyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ingest_workers: 4,
            query_concurrency: 8,
            query_acquire_timeout: Duration::from_secs(5),
            router: RouterConfig::default(),
            planner: PlannerConfig::default(),
            host: HostConfig::default(),
            sweep_interval: Duration::from_secs(60),
            sweep_max_attempts: 5,
            health_check_interval: Duration::from_secs(30),
            file_ingest_deadline: Duration::from_secs(300),
        }
    }
}

/// Result of `ingest_file`. Streaming plugins acknowledge and push their
/// packets through the queue; their outcomes surface in logs and the
/// compensation machinery rather than this return value.
#[derive(Debug)]
pub enum FileIngest {
    Completed {
        outcomes: Vec<IngestOutcome>,
        warnings: Vec<String>,
    },
    Streaming {
        plugin: String,
        warnings: Vec<String>,
    },
}

/// The single entry point to the orchestration core: `ingest_packet`,
/// `ingest_file`, `query`. Owns the plugin host, the ingest queue and
/// worker pool, the compensation sweeper, and the query semaphore.
pub struct Nancy {
    router: Arc<BrainRouter>,
    planner: QueryPlanner,
    host: Arc<PluginHost>,
    /// Taken (dropped) on shutdown so the workers see the queue close.
    queue: std::sync::RwLock<Option<IngestQueue>>,
    query_slots: Arc<Semaphore>,
    events_tx: mpsc::Sender<PluginEvent>,
    config: NancyConfig,
    accepting: AtomicBool,
    workers: Mutex<Option<WorkerPool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Nancy {
    /// Wire the core together and start its background machinery. Plugins
    /// are launched separately with [`Nancy::launch_plugins`]; a core with
    /// zero plugins is fully operational.
    pub fn new(brains: BrainSet, config: NancyConfig) -> Arc<Self> {
        let router = Arc::new(BrainRouter::new(brains.clone(), config.router.clone()));
        let planner = QueryPlanner::new(brains, config.planner.clone());

        let (events_tx, events_rx) = mpsc::channel::<PluginEvent>(64);
        let host = Arc::new(PluginHost::new(config.host.clone(), events_tx.clone()));

        let (queue, queue_rx) = IngestQueue::new(config.queue_capacity);
        let workers = WorkerPool::spawn(config.ingest_workers, queue_rx, router.clone());

        let nancy = Arc::new(Self {
            router,
            planner,
            host,
            queue: std::sync::RwLock::new(Some(queue)),
            query_slots: Arc::new(Semaphore::new(config.query_concurrency.max(1))),
            events_tx,
            config,
            accepting: AtomicBool::new(true),
            workers: Mutex::new(Some(workers)),
            tasks: Mutex::new(Vec::new()),
        });

        let pump = tokio::spawn(Self::event_pump(nancy.clone(), events_rx));
        let sweeper = tokio::spawn(Self::sweep_loop(nancy.clone()));
        let health = tokio::spawn(Self::health_loop(nancy.clone()));
        if let Ok(mut tasks) = nancy.tasks.try_lock() {
            tasks.push(pump);
            tasks.push(sweeper);
            tasks.push(health);
        }
        nancy
    }

    pub async fn launch_plugins(&self, manifests: Vec<PluginManifest>) {
        self.host.launch_all(manifests).await;
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    pub fn router(&self) -> &BrainRouter {
        &self.router
    }

    /// Sender feeding the ingest pump. Embedding harnesses use this to
    /// drive plugin-style packet streams without child processes.
    pub fn plugin_events(&self) -> mpsc::Sender<PluginEvent> {
        self.events_tx.clone()
    }

    /// Validate and route one packet directly, bypassing plugins and the
    /// queue. Programmatic ingestion and tests use this.
    pub async fn ingest_packet(&self, packet: KnowledgePacket) -> Result<IngestOutcome, NancyError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(NancyError::Overloaded("shutting down".into()));
        }
        let issues = validate(&packet);
        if !issues.is_empty() {
            return Err(NancyError::Validation(issues));
        }
        Ok(self.router.apply(&packet).await)
    }

    /// Resolve a plugin for the path, collect its packets, validate and
    /// enqueue them, and wait for their terminal outcomes.
    pub async fn ingest_file(
        &self,
        path: &str,
        metadata_hints: Option<Value>,
    ) -> Result<FileIngest, NancyError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(NancyError::Overloaded("shutting down".into()));
        }
        let (plugin, response) = self.host.ingest_file(path, metadata_hints).await.map_err(
            |e| match e {
                HostError::NoPluginForType(path) => NancyError::NoPluginForType(path),
                HostError::NotReady(name) => NancyError::PluginUnhealthy(name),
                other => NancyError::Protocol(other.to_string()),
            },
        )?;

        if response.is_streaming() {
            info!(plugin = %plugin, path, "Plugin streaming packets asynchronously");
            return Ok(FileIngest::Streaming {
                plugin,
                warnings: response.warnings,
            });
        }

        let mut outcomes = Vec::new();
        let mut waiters = Vec::new();
        for packet in response.packets {
            let issues = validate(&packet);
            if !issues.is_empty() {
                warn!(
                    plugin = %plugin,
                    packet_id = %packet.packet_id,
                    issues = issues.len(),
                    "Dropping invalid packet from plugin"
                );
                outcomes.push(IngestOutcome {
                    packet_id: packet.packet_id.clone(),
                    state: PacketState::Rejected,
                    results: Vec::new(),
                });
                continue;
            }
            let (done_tx, done_rx) = oneshot::channel();
            let queue = self
                .queue_handle()
                .ok_or_else(|| NancyError::Overloaded("ingest queue closed".into()))?;
            if !queue.push(QueueItem::new(packet, Some(done_tx))).await {
                return Err(NancyError::Overloaded("ingest queue closed".into()));
            }
            waiters.push(done_rx);
        }

        let deadline = self.config.file_ingest_deadline;
        for waiter in waiters {
            match tokio::time::timeout(deadline, waiter).await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(_)) => return Err(NancyError::Overloaded("worker pool stopped".into())),
                Err(_) => return Err(NancyError::DeadlineExceeded),
            }
        }
        Ok(FileIngest::Completed {
            outcomes,
            warnings: response.warnings,
        })
    }

    /// Answer a natural-language question. Concurrency-capped; surplus
    /// queries wait briefly, then fail fast.
    pub async fn query(&self, text: &str) -> Result<QueryResponse, NancyError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(NancyError::Overloaded("shutting down".into()));
        }
        let permit = tokio::time::timeout(
            self.config.query_acquire_timeout,
            self.query_slots.clone().acquire_owned(),
        )
        .await
        .map_err(|_| NancyError::Overloaded("query pool saturated".into()))?
        .map_err(|_| NancyError::Overloaded("query pool closed".into()))?;

        let response = self.planner.query(text).await;
        drop(permit);
        Ok(response)
    }

    /// Run one health-check round over the plugins. The background health
    /// loop ticks this on `health_check_interval`; callers may also invoke
    /// it directly to force a round.
    pub async fn health_tick(&self) {
        self.host.run_health_checks().await;
    }

    /// Drain packets pushed by plugins into the queue, with back-pressure
    /// signalling when it fills.
    async fn event_pump(self: Arc<Self>, mut events: mpsc::Receiver<PluginEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PluginEvent::Packet { plugin, packet } => {
                    let packet = *packet;
                    let issues = validate(&packet);
                    if !issues.is_empty() {
                        warn!(
                            plugin = %plugin,
                            packet_id = %packet.packet_id,
                            issues = issues.len(),
                            "Dropping invalid packet from plugin stream"
                        );
                        continue;
                    }
                    let Some(queue) = self.queue_handle() else { break };
                    let item = QueueItem::new(packet, None);
                    if let Err(item) = queue.try_push(item) {
                        debug!(plugin = %plugin, "Ingest queue full, signalling back-pressure");
                        self.host.notify_backpressure(&plugin).await;
                        // Blocking push: the packet is not lost, the plugin
                        // just waits on our stdio reads.
                        queue.push(item).await;
                    }
                }
                PluginEvent::Log { plugin, level, message } => match level.as_str() {
                    "error" => warn!(target: "nancy.plugin", plugin = %plugin, "{message}"),
                    "warn" | "warning" => {
                        warn!(target: "nancy.plugin", plugin = %plugin, "{message}")
                    }
                    _ => info!(target: "nancy.plugin", plugin = %plugin, "{message}"),
                },
                PluginEvent::Exited { plugin } => {
                    self.host.handle_exit(&plugin).await;
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick is a no-op
        loop {
            ticker.tick().await;
            if let Err(e) = self.router.sweep_once(self.config.sweep_max_attempts).await {
                warn!(error = %e, "Compensation sweep failed");
            }
        }
    }

    /// Probe every plugin on an interval so one that silently stops
    /// responding still trips the consecutive-failure threshold, not just
    /// one that errors on a request.
    async fn health_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick is a no-op
        loop {
            ticker.tick().await;
            self.host.run_health_checks().await;
        }
    }

    fn queue_handle(&self) -> Option<IngestQueue> {
        self.queue.read().unwrap().clone()
    }

    /// Stop accepting work, drain the queue, and shut plugins down.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("Nancy shutting down");
        self.host.shutdown_all().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        // Dropping the last sender closes the queue; workers finish what
        // they already claimed and stop.
        self.queue.write().unwrap().take();
        if let Some(workers) = self.workers.lock().await.take() {
            workers.join().await;
        }
    }
}
