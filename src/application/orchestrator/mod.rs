pub mod decision;
pub mod prompts;

mod cycle;

pub use cycle::Orchestrator;
pub use decision::{extract_json, Decision, DecisionKind};
