//! Stagehand - health-gated service bring-up
//!
//! Stagehand starts the services of a compose project in dependency order.
//! A service is started only once every service it depends on reports
//! healthy through its readiness probe, and the project is stopped in
//! reverse start order.
//!
//! - [`compose`] loads a compose file into a validated [`service::Project`]
//! - [`service`] holds service descriptors and the dependency graph
//! - [`supervisor`] starts and stops the process behind a service
//! - [`health`] runs readiness probes
//! - [`orchestrator`] drives bring-up and teardown
//! - [`store`] persists the last run for later `status` and `down` calls

pub mod compose;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod service;
pub mod store;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, StagehandError};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use service::{resolve, Project, ServiceSpec};
