/// Builder for wiring an orchestrator from explicit dependencies.
pub mod builder;
/// Dispatch loop: queue to actor to follow-on events.
pub mod orchestrator;
/// Process-level composition of the scheduler and dispatch loops.
pub mod worker;

pub use builder::OrchestratorBuilder;
pub use orchestrator::{DispatchOutcome, Orchestrator, ShutdownToken};
pub use worker::PipelineWorker;
