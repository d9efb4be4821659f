//! Process supervision
//!
//! A [`Supervisor`] starts and stops the process behind one service and
//! reports whether it is still running. It never retries; restart decisions
//! belong to the orchestrator.

pub mod process;
pub mod signal;

pub use process::{ContainerRuntime, LaunchPlan, ProcessSupervisor};

use crate::error::Result;
use crate::health::ProbeTarget;
use crate::service::ServiceSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Handle to a started service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Supervisor-local instance id
    pub id: u64,
    /// Service name
    pub service: String,
    /// OS process id, also the process group id
    pub pid: Option<u32>,
    /// Container name when running under a container runtime
    pub container: Option<String>,
}

/// Observed state of a started process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningState {
    Running,
    /// Exited on its own with a status code
    Exited(i32),
    /// Terminated by a signal
    Crashed { signal: Option<i32> },
}

impl RunningState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunningState::Running)
    }

    /// Exited with status 0
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, RunningState::Exited(0))
    }

    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match status.code() {
            Some(code) => RunningState::Exited(code),
            None => RunningState::Crashed {
                signal: status.signal(),
            },
        }
    }
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningState::Running => write!(f, "running"),
            RunningState::Exited(code) => write!(f, "exited({})", code),
            RunningState::Crashed { signal: Some(sig) } => write!(f, "crashed(signal {})", sig),
            RunningState::Crashed { signal: None } => write!(f, "crashed"),
        }
    }
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Exited within the grace period
    Graceful { code: Option<i32> },
    /// Still running after the grace period and killed
    Forced,
    /// Had already exited before the stop request
    AlreadyExited { code: Option<i32> },
}

impl ExitOutcome {
    pub fn was_forced(&self) -> bool {
        matches!(self, ExitOutcome::Forced)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Graceful { code: Some(code) } => write!(f, "stopped (exit {})", code),
            ExitOutcome::Graceful { code: None } => write!(f, "stopped"),
            ExitOutcome::Forced => write!(f, "killed after grace period"),
            ExitOutcome::AlreadyExited { .. } => write!(f, "already exited"),
        }
    }
}

/// Starts, stops and observes service processes
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Launch the service. Returns as soon as the process exists; it is not
    /// ready yet.
    async fn start(&self, spec: &ServiceSpec) -> Result<ProcessHandle>;

    /// SIGTERM, wait up to `grace`, then SIGKILL
    async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> Result<ExitOutcome>;

    /// Current state of a started process
    fn poll(&self, handle: &ProcessHandle) -> Result<RunningState>;

    /// Where health probes for this service should point
    fn probe_target(&self, _spec: &ServiceSpec) -> ProbeTarget {
        ProbeTarget::local()
    }
}
