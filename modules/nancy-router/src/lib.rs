pub mod keyed_lock;
pub mod outcome;
pub mod router;

pub use keyed_lock::KeyedLocks;
pub use outcome::{AdapterResult, IngestOutcome, WriteOutcome};
pub use router::{BrainRouter, RouterConfig, SweepStats};
