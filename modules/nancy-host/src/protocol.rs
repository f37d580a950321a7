// JSON-RPC 2.0 over Content-Length framed stdio, the framing used by
// language-server tooling: `Content-Length: <n>\r\n\r\n` then n bytes of
// UTF-8 JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use crate::error::HostError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method names of the host→plugin surface.
pub const METHOD_HEALTH_CHECK: &str = "health_check";
pub const METHOD_INGEST: &str = "ingest";
pub const METHOD_SNIFF: &str = "sniff";
pub const METHOD_SHUTDOWN: &str = "shutdown";

/// Notifications either side may send.
pub const NOTIFY_PACKET: &str = "nancy/packet";
pub const NOTIFY_LOG: &str = "nancy/log";
pub const NOTIFY_BACKPRESSURE: &str = "nancy/backpressure";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An outgoing request (`id` set) or notification (`id` absent).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn call(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// A message arriving from the plugin: a response to one of our calls, or a
/// plugin-initiated notification.
#[derive(Debug)]
pub enum Incoming {
    Response {
        id: u64,
        result: Result<Value, JsonRpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Classify a decoded frame. A `method` key marks a notification (plugins
/// never call host methods expecting results); otherwise it must carry an
/// `id` and either `result` or `error`.
pub fn parse_incoming(value: Value) -> Result<Incoming, HostError> {
    let obj = value
        .as_object()
        .ok_or_else(|| HostError::Protocol("frame is not a JSON object".into()))?;

    if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
        return Ok(Incoming::Notification {
            method: method.to_string(),
            params: obj.get("params").cloned().unwrap_or(Value::Null),
        });
    }

    let id = obj
        .get("id")
        .and_then(|id| id.as_u64())
        .ok_or_else(|| HostError::Protocol("response without id".into()))?;
    if let Some(error) = obj.get("error") {
        let error: JsonRpcError = serde_json::from_value(error.clone())
            .map_err(|e| HostError::Protocol(format!("malformed error object: {e}")))?;
        return Ok(Incoming::Response {
            id,
            result: Err(error),
        });
    }
    let result = obj
        .get("result")
        .cloned()
        .ok_or_else(|| HostError::Protocol("response with neither result nor error".into()))?;
    Ok(Incoming::Response {
        id,
        result: Ok(result),
    })
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Largest frame we will accept from a plugin.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Encode one message with its `Content-Length` header.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, HostError> {
    let body =
        serde_json::to_vec(message).map_err(|e| HostError::Framing(e.to_string()))?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one framed message, or `None` on clean EOF before any header byte.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Value>, HostError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(HostError::Stdout)?;
        if n == 0 {
            return if content_length.is_none() {
                Ok(None)
            } else {
                Err(HostError::Framing("eof inside frame header".into()))
            };
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                let parsed = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| HostError::Framing(format!("bad content-length: {value:?}")))?;
                content_length = Some(parsed);
            }
            // Other headers (e.g. Content-Type) are tolerated and ignored.
        } else {
            return Err(HostError::Framing(format!("malformed header line: {trimmed:?}")));
        }
    }

    let len = content_length
        .ok_or_else(|| HostError::Framing("missing content-length header".into()))?;
    if len > MAX_FRAME_BYTES {
        return Err(HostError::Framing(format!("frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(HostError::Stdout)?;
    let value =
        serde_json::from_slice(&body).map_err(|e| HostError::Framing(e.to_string()))?;
    Ok(Some(value))
}

// ---------------------------------------------------------------------------
// Typed method payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckResponse {
    pub status: PluginStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub supported_extensions: Vec<String>,
}

/// Response to `ingest`: either the packets inline, or `status: "streaming"`
/// with the packets following as `nancy/packet` notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestResponse {
    #[serde(default)]
    pub packets: Vec<nancy_common::KnowledgePacket>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl IngestResponse {
    pub fn is_streaming(&self) -> bool {
        self.status.as_deref() == Some("streaming")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogNotification {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
}
