use serde::Serialize;

use nancy_common::BrainKind;

/// Where the intent came from: the linguistic adapter, or the deterministic
/// rules when the LLM was unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Llm,
    RuleFallback,
}

/// One adapter call made while executing the plan.
#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub adapter: BrainKind,
    pub operation: String,
    pub elapsed_ms: u64,
    pub result_count: usize,
    /// True when the step failed or timed out and the plan continued
    /// without it.
    pub degraded: bool,
}

/// Machine-readable audit of how the answer was produced.
#[derive(Debug, Clone, Serialize)]
pub struct QueryTrace {
    pub intent_source: IntentSource,
    pub steps: Vec<TraceStep>,
}

impl QueryTrace {
    pub fn new(intent_source: IntentSource) -> Self {
        Self {
            intent_source,
            steps: Vec::new(),
        }
    }

    pub fn called(&self, adapter: BrainKind) -> bool {
        self.steps.iter().any(|s| s.adapter == adapter)
    }

    pub fn any_degraded(&self) -> bool {
        self.steps.iter().any(|s| s.degraded)
    }
}
