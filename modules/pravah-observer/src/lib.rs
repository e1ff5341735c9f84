pub mod bus;
pub mod callback;
pub mod orchestrator;

pub use bus::{HttpPushBus, MemoryBus, MessageBus};
pub use orchestrator::{Orchestrator, OrchestratorDeps, WaitOutcome};
