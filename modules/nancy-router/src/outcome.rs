use serde::Serialize;

use nancy_common::{BrainKind, PacketState};

/// What happened at one adapter during a routing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WriteOutcome {
    Ok,
    Failed { error: String },
    Skipped { reason: String },
}

impl WriteOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, WriteOutcome::Ok)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterResult {
    pub brain: BrainKind,
    pub outcome: WriteOutcome,
    /// Transient retries spent before the final outcome.
    pub retries: u32,
}

/// Terminal record for one packet through the router.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub packet_id: String,
    pub state: PacketState,
    pub results: Vec<AdapterResult>,
}

impl IngestOutcome {
    pub fn result_for(&self, brain: BrainKind) -> Option<&AdapterResult> {
        self.results.iter().find(|r| r.brain == brain)
    }
}
