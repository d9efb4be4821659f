//! Health-gated bring-up and ordered teardown

pub mod engine;
pub mod state;

pub use engine::{Orchestrator, OrchestratorConfig, TeardownReport};
pub use state::{
    OrchestratorEvent, RunState, RuntimeState, ServiceSnapshot, ServiceStatus, Snapshot,
};
