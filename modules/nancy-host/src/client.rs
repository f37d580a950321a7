use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nancy_common::{KnowledgePacket, PluginManifest};

use crate::error::HostError;
use crate::process::PluginProcess;
use crate::protocol::{
    self, encode_frame, parse_incoming, read_frame, HealthCheckResponse, Incoming,
    IngestResponse, JsonRpcRequest, LogNotification,
};

/// Something a plugin pushed at the host outside the request/response cycle.
#[derive(Debug)]
pub enum PluginEvent {
    Packet {
        plugin: String,
        packet: Box<KnowledgePacket>,
    },
    Log {
        plugin: String,
        level: String,
        message: String,
    },
    /// The plugin's stdout closed; the supervisor decides what happens next.
    Exited { plugin: String },
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, HostError>>>>>;

/// One live plugin connection: request/response correlation over framed
/// JSON-RPC plus a reader task that forwards notifications.
pub struct PluginClient {
    name: String,
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicU64,
    child: Option<AsyncMutex<Child>>,
    reader_task: JoinHandle<()>,
}

impl PluginClient {
    /// Spawn the plugin process and attach to its stdio.
    pub fn spawn(
        manifest: &PluginManifest,
        events: mpsc::Sender<PluginEvent>,
    ) -> Result<Self, HostError> {
        let process = PluginProcess::spawn(manifest)?;
        Ok(Self::attach(
            &manifest.name,
            Box::new(process.stdin),
            process.stdout,
            Some(process.child),
            events,
        ))
    }

    /// Attach to an existing transport. Tests drive this with duplex pipes;
    /// production goes through [`PluginClient::spawn`].
    pub fn attach<R>(
        name: &str,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        reader: R,
        child: Option<Child>,
        events: mpsc::Sender<PluginEvent>,
    ) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = tokio::spawn(Self::read_loop(
            name.to_string(),
            reader,
            pending.clone(),
            events,
        ));
        Self {
            name: name.to_string(),
            writer: AsyncMutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            child: child.map(AsyncMutex::new),
            reader_task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn read_loop<R>(
        name: String,
        mut reader: R,
        pending: Pending,
        events: mpsc::Sender<PluginEvent>,
    ) where
        R: AsyncBufRead + Send + Unpin,
    {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(value)) => match parse_incoming(value) {
                    Ok(Incoming::Response { id, result }) => {
                        let sender = pending.lock().unwrap().remove(&id);
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(result.map_err(|e| {
                                    HostError::Protocol(format!(
                                        "plugin error {}: {}",
                                        e.code, e.message
                                    ))
                                }));
                            }
                            None => {
                                warn!(plugin = %name, id, "Response for unknown request id")
                            }
                        }
                    }
                    Ok(Incoming::Notification { method, params }) => {
                        Self::dispatch_notification(&name, &method, params, &events).await;
                    }
                    Err(e) => {
                        warn!(plugin = %name, error = %e, "Dropping malformed frame");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Plugin stream error");
                    break;
                }
            }
        }
        // Fail anything still waiting, then tell the supervisor.
        let waiters: Vec<_> = {
            let mut map = pending.lock().unwrap();
            map.drain().collect()
        };
        for (_, sender) in waiters {
            let _ = sender.send(Err(HostError::Exited));
        }
        let _ = events.send(PluginEvent::Exited { plugin: name }).await;
    }

    async fn dispatch_notification(
        plugin: &str,
        method: &str,
        params: Value,
        events: &mpsc::Sender<PluginEvent>,
    ) {
        match method {
            protocol::NOTIFY_PACKET => match serde_json::from_value::<KnowledgePacket>(params) {
                Ok(packet) => {
                    let _ = events
                        .send(PluginEvent::Packet {
                            plugin: plugin.to_string(),
                            packet: Box::new(packet),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(plugin = %plugin, error = %e, "Dropping undecodable nancy/packet");
                }
            },
            protocol::NOTIFY_LOG => {
                let log: LogNotification = serde_json::from_value(params).unwrap_or(LogNotification {
                    level: "info".into(),
                    message: "<unparseable log>".into(),
                });
                let _ = events
                    .send(PluginEvent::Log {
                        plugin: plugin.to_string(),
                        level: log.level,
                        message: log.message,
                    })
                    .await;
            }
            other => {
                debug!(plugin = %plugin, method = %other, "Ignoring unknown notification");
            }
        }
    }

    async fn send(&self, request: &JsonRpcRequest) -> Result<(), HostError> {
        let frame = encode_frame(request)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.map_err(HostError::Stdin)?;
        writer.flush().await.map_err(HostError::Stdin)?;
        Ok(())
    }

    /// Issue a request and wait for its response within the deadline.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, HostError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        if let Err(e) = self.send(&JsonRpcRequest::call(id, method, params)).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::Exited),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(HostError::Timeout(deadline))
            }
        }
    }

    /// Fire-and-forget notification to the plugin.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), HostError> {
        self.send(&JsonRpcRequest::notification(method, params)).await
    }

    // --- Typed method wrappers ---

    pub async fn health_check(&self, deadline: Duration) -> Result<HealthCheckResponse, HostError> {
        let value = self
            .request(protocol::METHOD_HEALTH_CHECK, Value::Null, deadline)
            .await?;
        serde_json::from_value(value).map_err(|e| HostError::Protocol(e.to_string()))
    }

    pub async fn ingest(
        &self,
        file_path: &str,
        metadata_hints: Option<Value>,
        deadline: Duration,
    ) -> Result<IngestResponse, HostError> {
        let mut params = serde_json::json!({ "file_path": file_path });
        if let Some(hints) = metadata_hints {
            params["metadata_hints"] = hints;
        }
        let value = self
            .request(protocol::METHOD_INGEST, params, deadline)
            .await?;
        serde_json::from_value(value).map_err(|e| HostError::Protocol(e.to_string()))
    }

    /// Ask a plugin whether it recognizes the content sample. Samples are
    /// sent lossily as UTF-8; sniffing is a heuristic, not a parse.
    pub async fn sniff(&self, sample: &[u8], deadline: Duration) -> Result<bool, HostError> {
        let params = serde_json::json!({
            "sample": String::from_utf8_lossy(sample),
        });
        let value = self.request(protocol::METHOD_SNIFF, params, deadline).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Best-effort shutdown: polite RPC, then kill after the grace period.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self
            .notify(protocol::METHOD_SHUTDOWN, Value::Null)
            .await;
        if let Some(child) = &self.child {
            let mut child = child.lock().await;
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(plugin = %self.name, "Plugin ignored shutdown, killing");
                    let _ = child.kill().await;
                }
            }
        }
        self.reader_task.abort();
    }

    /// Hard kill without the polite phase. Used on restart.
    pub async fn kill(&self) {
        if let Some(child) = &self.child {
            let mut child = child.lock().await;
            let _ = child.kill().await;
        }
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    /// Script a fake plugin on the far end of a duplex pipe.
    fn harness() -> (
        PluginClient,
        tokio::io::DuplexStream,
        mpsc::Receiver<PluginEvent>,
    ) {
        let (host_side, plugin_side) = tokio::io::duplex(64 * 1024);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (read_half, write_half) = tokio::io::split(host_side);
        let client = PluginClient::attach(
            "fake_plugin",
            Box::new(write_half),
            BufReader::new(read_half),
            None,
            events_tx,
        );
        (client, plugin_side, events_rx)
    }

    async fn read_one_request(plugin_side: &mut tokio::io::DuplexStream) -> Value {
        // Accumulate until a full frame parses.
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0u8; 1024];
            let n = plugin_side.read(&mut chunk).await.unwrap();
            buffer.extend_from_slice(&chunk[..n]);
            let mut reader = BufReader::new(buffer.as_slice());
            if let Ok(Some(value)) = read_frame(&mut reader).await {
                return value;
            }
        }
    }

    #[tokio::test]
    async fn request_response_correlation() {
        let (client, mut plugin_side, _events) = harness();

        let call = tokio::spawn(async move {
            client
                .request("health_check", Value::Null, Duration::from_secs(5))
                .await
        });

        let request = read_one_request(&mut plugin_side).await;
        assert_eq!(request["method"], "health_check");
        let id = request["id"].as_u64().unwrap();

        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"status": "ok", "capabilities": [], "supported_extensions": ["md"]}
        });
        plugin_side
            .write_all(&encode_frame(&response).unwrap())
            .await
            .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn notifications_flow_to_event_channel() {
        let (_client, mut plugin_side, mut events) = harness();

        let log = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "nancy/log",
            "params": {"level": "warn", "message": "low disk"}
        });
        plugin_side
            .write_all(&encode_frame(&log).unwrap())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            PluginEvent::Log { plugin, level, message } => {
                assert_eq!(plugin, "fake_plugin");
                assert_eq!(level, "warn");
                assert_eq!(message, "low disk");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_response_surfaces_as_protocol_error() {
        let (client, mut plugin_side, _events) = harness();

        let call = tokio::spawn(async move {
            client
                .request("ingest", serde_json::json!({"file_path": "/x"}), Duration::from_secs(5))
                .await
        });

        let request = read_one_request(&mut plugin_side).await;
        let id = request["id"].as_u64().unwrap();
        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32000, "message": "unreadable file"}
        });
        plugin_side
            .write_all(&encode_frame(&response).unwrap())
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HostError::Protocol(_)));
        assert!(err.to_string().contains("unreadable file"));
    }

    #[tokio::test]
    async fn closed_stream_fails_pending_and_reports_exit() {
        let (client, plugin_side, mut events) = harness();

        let call = tokio::spawn(async move {
            client
                .request("health_check", Value::Null, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(plugin_side);

        assert!(matches!(call.await.unwrap(), Err(HostError::Exited)));
        assert!(matches!(
            events.recv().await.unwrap(),
            PluginEvent::Exited { .. }
        ));
    }

    #[tokio::test]
    async fn request_times_out() {
        let (client, _plugin_side, _events) = harness();
        let err = client
            .request("health_check", Value::Null, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Timeout(_)));
    }
}
