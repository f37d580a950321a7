pub mod queue;
pub mod worker;

pub use queue::{IngestQueue, QueueItem, QueueReceiver};
pub use worker::WorkerPool;
