//! The two listing workflows: persisted-query orchestration and recorded
//! template replay.

pub mod orchestrator;
pub mod replay;
pub mod template;

pub use orchestrator::PersistedQueryFlow;
pub use replay::TemplateReplayFlow;
