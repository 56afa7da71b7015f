//! Turn orchestration: prompt assembly, model response repair, batching,
//! and the per-message state machine.

pub mod batch;
pub mod context;
pub mod normalizer;
pub mod orchestrator;

pub use normalizer::{ModelDecision, ReplyFragment};
pub use orchestrator::{ChatOutcome, ChatRequest, HealthReport, Orchestrator, SessionInfo, TurnStatus};
