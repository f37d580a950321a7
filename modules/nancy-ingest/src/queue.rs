use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use nancy_common::KnowledgePacket;
use nancy_router::IngestOutcome;

/// One queued unit of work. `done` lets synchronous submitters await the
/// terminal outcome; notification-sourced packets leave it empty.
#[derive(Debug)]
pub struct QueueItem {
    pub packet: KnowledgePacket,
    pub received_at: DateTime<Utc>,
    pub done: Option<oneshot::Sender<IngestOutcome>>,
}

impl QueueItem {
    pub fn new(packet: KnowledgePacket, done: Option<oneshot::Sender<IngestOutcome>>) -> Self {
        Self {
            packet,
            received_at: Utc::now(),
            done,
        }
    }
}

pub type QueueReceiver = mpsc::Receiver<QueueItem>;

/// Bounded FIFO handoff between packet producers (plugins, the facade) and
/// the worker pool. Fullness is the back-pressure signal.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<QueueItem>,
    capacity: usize,
}

impl IngestQueue {
    pub fn new(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                capacity: capacity.max(1),
            },
            rx,
        )
    }

    /// Non-blocking push. `Err` returns the item so the caller can signal
    /// back-pressure and fall back to a blocking push; nothing is lost.
    pub fn try_push(&self, item: QueueItem) -> Result<(), QueueItem> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) => item,
            mpsc::error::TrySendError::Closed(item) => item,
        })
    }

    /// Blocking push: waits for space. Returns `false` if the queue has shut
    /// down and the item was dropped.
    pub async fn push(&self, item: QueueItem) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Items currently waiting (approximate under concurrency).
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
