use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use nancy_common::PluginManifest;

use crate::client::{PluginClient, PluginEvent};
use crate::error::HostError;
use crate::protocol::{IngestResponse, PluginStatus};
use crate::registry::PluginRegistry;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub health_deadline: Duration,
    pub ingest_deadline: Duration,
    pub shutdown_grace: Duration,
    /// Consecutive health-check failures before a plugin turns unhealthy.
    pub unhealthy_after: u32,
    /// Restarts allowed within `restart_window` before termination.
    pub restart_budget: usize,
    pub restart_window: Duration,
    /// Bytes of file prefix offered to `sniff`.
    pub sniff_sample_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            health_deadline: Duration::from_secs(2),
            ingest_deadline: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(3),
            unhealthy_after: 3,
            restart_budget: 3,
            restart_window: Duration::from_secs(300),
            sniff_sample_bytes: 512,
        }
    }
}

/// Supervision states of one plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Starting,
    Ready,
    Busy,
    Unhealthy,
    Terminated,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Starting => write!(f, "starting"),
            PluginState::Ready => write!(f, "ready"),
            PluginState::Busy => write!(f, "busy"),
            PluginState::Unhealthy => write!(f, "unhealthy"),
            PluginState::Terminated => write!(f, "terminated"),
        }
    }
}

struct Supervised {
    manifest: PluginManifest,
    client: Option<Arc<PluginClient>>,
    state: PluginState,
    capabilities: Vec<String>,
    consecutive_failures: u32,
    history: Vec<bool>,
    last_checked: Option<DateTime<Utc>>,
    restarts: VecDeque<Instant>,
}

impl Supervised {
    fn new(manifest: PluginManifest) -> Self {
        Self {
            manifest,
            client: None,
            state: PluginState::Starting,
            capabilities: Vec::new(),
            consecutive_failures: 0,
            history: Vec::new(),
            last_checked: None,
            restarts: VecDeque::new(),
        }
    }
}

/// Point-in-time view of one plugin for operational introspection.
#[derive(Debug, Clone)]
pub struct PluginReport {
    pub name: String,
    pub state: PluginState,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    /// Share of recorded health checks that passed, 0.0–100.0.
    pub uptime_percentage: f64,
}

/// Record a health result; returns true when the failure threshold tips the
/// plugin into `Unhealthy`.
fn note_health_result(plugin: &mut Supervised, ok: bool, unhealthy_after: u32) -> bool {
    plugin.history.push(ok);
    plugin.last_checked = Some(Utc::now());
    if ok {
        plugin.consecutive_failures = 0;
        return false;
    }
    plugin.consecutive_failures += 1;
    plugin.consecutive_failures >= unhealthy_after
}

/// Sliding-window restart budget: prune attempts older than `window`, then
/// check whether another restart fits.
fn restart_allowed(
    restarts: &mut VecDeque<Instant>,
    window: Duration,
    budget: usize,
    now: Instant,
) -> bool {
    while restarts
        .front()
        .is_some_and(|t| now.duration_since(*t) > window)
    {
        restarts.pop_front();
    }
    restarts.len() < budget
}

fn uptime_percentage(history: &[bool]) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let healthy = history.iter().filter(|&&ok| ok).count();
    (healthy as f64 / history.len() as f64) * 100.0
}

/// Launches, supervises, and talks to plugin processes. Core-only operation
/// (zero plugins) is a valid, stable state: `ingest_file` fails cleanly and
/// everything else keeps working.
pub struct PluginHost {
    config: HostConfig,
    plugins: RwLock<HashMap<String, Supervised>>,
    registry: RwLock<PluginRegistry>,
    events: mpsc::Sender<PluginEvent>,
}

impl PluginHost {
    pub fn new(config: HostConfig, events: mpsc::Sender<PluginEvent>) -> Self {
        Self {
            config,
            plugins: RwLock::new(HashMap::new()),
            registry: RwLock::new(PluginRegistry::new()),
            events,
        }
    }

    /// Launch every manifest. Individual failures are logged and the plugin
    /// left in `Unhealthy` for the health loop to retry; the host comes up
    /// regardless.
    pub async fn launch_all(&self, manifests: Vec<PluginManifest>) {
        for manifest in manifests {
            let name = manifest.name.clone();
            if let Err(e) = self.start_plugin(manifest).await {
                warn!(plugin = %name, error = %e, "Plugin failed to start");
            }
        }
    }

    pub async fn start_plugin(&self, manifest: PluginManifest) -> Result<(), HostError> {
        let name = manifest.name.clone();
        self.plugins
            .write()
            .await
            .insert(name.clone(), Supervised::new(manifest.clone()));

        match self.connect(&manifest).await {
            Ok((client, capabilities, extensions)) => {
                {
                    let mut plugins = self.plugins.write().await;
                    if let Some(plugin) = plugins.get_mut(&name) {
                        plugin.client = Some(client);
                        plugin.capabilities = capabilities;
                        plugin.state = PluginState::Ready;
                        note_health_result(plugin, true, self.config.unhealthy_after);
                    }
                }
                self.registry.write().await.register(&name, &extensions);
                info!(plugin = %name, extensions = ?extensions, "Plugin ready");
                Ok(())
            }
            Err(e) => {
                if let Some(plugin) = self.plugins.write().await.get_mut(&name) {
                    plugin.state = PluginState::Unhealthy;
                    note_health_result(plugin, false, self.config.unhealthy_after);
                }
                Err(e)
            }
        }
    }

    /// Spawn and handshake: the first successful health check moves
    /// `Starting → Ready`.
    async fn connect(
        &self,
        manifest: &PluginManifest,
    ) -> Result<(Arc<PluginClient>, Vec<String>, Vec<String>), HostError> {
        let client = Arc::new(PluginClient::spawn(manifest, self.events.clone())?);
        let health = client.health_check(self.config.health_deadline).await?;
        if health.status == PluginStatus::Error {
            client.kill().await;
            return Err(HostError::NotReady(manifest.name.clone()));
        }
        // Manifest extensions are the declaration of record; the handshake
        // may extend them.
        let mut extensions = manifest.supported_extensions.clone();
        for ext in health.supported_extensions {
            if !extensions.contains(&ext) {
                extensions.push(ext);
            }
        }
        Ok((client, health.capabilities, extensions))
    }

    async fn client_for(&self, name: &str) -> Result<Arc<PluginClient>, HostError> {
        let plugins = self.plugins.read().await;
        let plugin = plugins
            .get(name)
            .ok_or_else(|| HostError::NotReady(name.to_string()))?;
        if !matches!(plugin.state, PluginState::Ready | PluginState::Busy) {
            return Err(HostError::NotReady(name.to_string()));
        }
        plugin
            .client
            .clone()
            .ok_or_else(|| HostError::NotReady(name.to_string()))
    }

    async fn set_state(&self, name: &str, state: PluginState) {
        if let Some(plugin) = self.plugins.write().await.get_mut(name) {
            plugin.state = state;
        }
    }

    /// Resolve the plugin for a path: extension match first, then content
    /// sniffing across plugins advertising the capability.
    pub async fn resolve_plugin(&self, path: &str) -> Result<String, HostError> {
        if let Some(name) = self.registry.read().await.select(path) {
            return Ok(name.to_string());
        }

        let sniffers: Vec<String> = {
            let plugins = self.plugins.read().await;
            self.registry
                .read()
                .await
                .plugins()
                .into_iter()
                .filter(|name| {
                    plugins.get(name).is_some_and(|p| {
                        p.state == PluginState::Ready
                            && p.capabilities.iter().any(|c| c == "sniff")
                    })
                })
                .collect()
        };
        if !sniffers.is_empty() {
            let sample = read_sample(path, self.config.sniff_sample_bytes).await;
            if let Some(sample) = sample {
                for name in sniffers {
                    if let Ok(client) = self.client_for(&name).await {
                        if client
                            .sniff(&sample, self.config.health_deadline)
                            .await
                            .unwrap_or(false)
                        {
                            return Ok(name);
                        }
                    }
                }
            }
        }
        Err(HostError::NoPluginForType(path.to_string()))
    }

    /// Ask the resolved plugin to ingest a file. Synchronous responses carry
    /// packets inline; streaming plugins answer `{status: "streaming"}` and
    /// push `nancy/packet` notifications instead.
    pub async fn ingest_file(
        &self,
        path: &str,
        metadata_hints: Option<Value>,
    ) -> Result<(String, IngestResponse), HostError> {
        let name = self.resolve_plugin(path).await?;
        let client = self.client_for(&name).await?;

        self.set_state(&name, PluginState::Busy).await;
        let result = client
            .ingest(path, metadata_hints, self.config.ingest_deadline)
            .await;
        self.set_state(&name, PluginState::Ready).await;

        match result {
            Ok(response) => Ok((name, response)),
            Err(e) => {
                if e.is_process_failure() {
                    self.note_failure(&name).await;
                }
                Err(e)
            }
        }
    }

    /// Send a back-pressure notification so a cooperative plugin pauses its
    /// packet stream.
    pub async fn notify_backpressure(&self, name: &str) {
        if let Ok(client) = self.client_for(name).await {
            let _ = client
                .notify(crate::protocol::NOTIFY_BACKPRESSURE, Value::Null)
                .await;
        }
    }

    async fn note_failure(&self, name: &str) {
        let became_unhealthy = {
            let mut plugins = self.plugins.write().await;
            match plugins.get_mut(name) {
                Some(plugin) => note_health_result(plugin, false, self.config.unhealthy_after),
                None => false,
            }
        };
        if became_unhealthy {
            self.set_state(name, PluginState::Unhealthy).await;
            self.try_restart(name).await;
        }
    }

    /// Run one health-check round over every live plugin. The facade's
    /// health loop ticks this on its configured interval; unhealthy plugins
    /// get a restart attempt within the budget.
    pub async fn run_health_checks(&self) {
        let names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        for name in names {
            let state = self.plugin_state(&name).await;
            match state {
                Some(PluginState::Ready) | Some(PluginState::Busy) => {
                    let client = match self.client_for(&name).await {
                        Ok(client) => client,
                        Err(_) => continue,
                    };
                    let ok = client
                        .health_check(self.config.health_deadline)
                        .await
                        .map(|h| h.status != PluginStatus::Error)
                        .unwrap_or(false);
                    let became_unhealthy = {
                        let mut plugins = self.plugins.write().await;
                        match plugins.get_mut(&name) {
                            Some(plugin) => {
                                note_health_result(plugin, ok, self.config.unhealthy_after)
                            }
                            None => false,
                        }
                    };
                    if became_unhealthy {
                        warn!(plugin = %name, "Plugin unhealthy after consecutive failures");
                        self.set_state(&name, PluginState::Unhealthy).await;
                        self.try_restart(&name).await;
                    }
                }
                Some(PluginState::Unhealthy) => {
                    self.try_restart(&name).await;
                }
                _ => {}
            }
        }
    }

    /// Restart an unhealthy plugin within the sliding-window budget;
    /// past the budget it is terminated and its extensions unregistered.
    async fn try_restart(&self, name: &str) {
        let (allowed, manifest) = {
            let mut plugins = self.plugins.write().await;
            let Some(plugin) = plugins.get_mut(name) else {
                return;
            };
            let allowed = restart_allowed(
                &mut plugin.restarts,
                self.config.restart_window,
                self.config.restart_budget,
                Instant::now(),
            );
            if allowed {
                plugin.restarts.push_back(Instant::now());
                plugin.state = PluginState::Starting;
            } else {
                plugin.state = PluginState::Terminated;
            }
            (allowed, plugin.manifest.clone())
        };

        if !allowed {
            warn!(plugin = %name, "Restart budget exhausted, terminating plugin");
            self.registry.write().await.unregister(name);
            if let Some(client) = self.plugins.read().await.get(name).and_then(|p| p.client.clone())
            {
                client.kill().await;
            }
            return;
        }

        info!(plugin = %name, "Restarting plugin");
        if let Some(client) = self.plugins.read().await.get(name).and_then(|p| p.client.clone()) {
            client.kill().await;
        }
        match self.connect(&manifest).await {
            Ok((client, capabilities, extensions)) => {
                {
                    let mut plugins = self.plugins.write().await;
                    if let Some(plugin) = plugins.get_mut(name) {
                        plugin.client = Some(client);
                        plugin.capabilities = capabilities;
                        plugin.state = PluginState::Ready;
                        plugin.consecutive_failures = 0;
                    }
                }
                self.registry.write().await.register(name, &extensions);
            }
            Err(e) => {
                warn!(plugin = %name, error = %e, "Restart attempt failed");
                self.set_state(name, PluginState::Unhealthy).await;
            }
        }
    }

    /// Supervisor hook for `PluginEvent::Exited` from the reader task.
    pub async fn handle_exit(&self, name: &str) {
        let relevant = matches!(
            self.plugin_state(name).await,
            Some(PluginState::Ready) | Some(PluginState::Busy) | Some(PluginState::Starting)
        );
        if relevant {
            warn!(plugin = %name, "Plugin process exited unexpectedly");
            self.set_state(name, PluginState::Unhealthy).await;
            self.try_restart(name).await;
        }
    }

    pub async fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.plugins.read().await.get(name).map(|p| p.state)
    }

    pub async fn has_plugins(&self) -> bool {
        !self.registry.read().await.is_empty()
    }

    pub async fn report(&self) -> Vec<PluginReport> {
        self.plugins
            .read()
            .await
            .values()
            .map(|p| PluginReport {
                name: p.manifest.name.clone(),
                state: p.state,
                consecutive_failures: p.consecutive_failures,
                last_checked: p.last_checked,
                uptime_percentage: uptime_percentage(&p.history),
            })
            .collect()
    }

    pub async fn shutdown_all(&self) {
        let clients: Vec<(String, Arc<PluginClient>)> = {
            let plugins = self.plugins.read().await;
            plugins
                .iter()
                .filter_map(|(name, p)| p.client.clone().map(|c| (name.clone(), c)))
                .collect()
        };
        for (name, client) in clients {
            info!(plugin = %name, "Shutting down plugin");
            client.shutdown(self.config.shutdown_grace).await;
        }
        let mut plugins = self.plugins.write().await;
        for plugin in plugins.values_mut() {
            plugin.state = PluginState::Terminated;
        }
    }
}

async fn read_sample(path: &str, limit: usize) -> Option<Vec<u8>> {
    let bytes = tokio::fs::read(path).await.ok()?;
    Some(bytes.into_iter().take(limit).collect())
}
