pub mod fallback;
pub mod planner;
pub mod trace;

pub use fallback::{is_multi_step, rule_based_intent};
pub use planner::{fallback_synthesis, filters_to_predicate, PlannerConfig, QueryPlanner, QueryResponse};
pub use trace::{IntentSource, QueryTrace, TraceStep};
