//! Runtime state of a bring-up

use crate::health::ProbeResult;
use crate::supervisor::ProcessHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Launched, not yet ready
    Starting,
    /// Probe reported ready
    Healthy,
    /// Probe gave up or the start timed out
    Unhealthy,
    Stopped,
    /// Terminal for this run
    Failed,
}

impl ServiceStatus {
    /// Whether a process may exist for this service
    pub fn is_active(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Healthy)
    }

    /// Whether the service will never become healthy in this run
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle of the whole project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    BringingUp,
    Running,
    TearingDown,
    Terminated,
    /// Bring-up halted by a failed service; survivors may still run
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::BringingUp => "bringing-up",
            RunState::Running => "running",
            RunState::TearingDown => "tearing-down",
            RunState::Terminated => "terminated",
            RunState::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Mutable state of one service, owned by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    pub status: ServiceStatus,
    pub process_handle: Option<ProcessHandle>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_probe_result: Option<ProbeResult>,
    /// Restarts so far in this run
    pub restarts: u32,
    pub last_error: Option<String>,
    /// Incremented for every start attempt; reports carry it
    pub(crate) generation: u64,
    /// A restart is waiting out its backoff
    pub(crate) restart_pending: bool,
}

impl RuntimeState {
    /// Whether a process exists or is about to be started
    pub fn is_live(&self) -> bool {
        self.status.is_active() || self.restart_pending
    }
}

impl RuntimeState {
    /// Human readable last health, for error reports
    pub fn last_health(&self) -> String {
        match &self.last_probe_result {
            Some(result) => result.to_string(),
            None => "never probed".to_string(),
        }
    }
}

/// Point-in-time copy of one service's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_result: Option<ProbeResult>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Grace period used when stopping, in milliseconds
    #[serde(default)]
    pub stop_grace_ms: u64,
}

/// Point-in-time copy of the whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub project: String,
    pub run_state: RunState,
    /// Services in declaration order
    pub services: Vec<ServiceSnapshot>,
    /// Order in which services actually reached `starting`
    pub start_order: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Services to stop, in reverse start order
    pub fn shutdown_order(&self) -> impl Iterator<Item = &ServiceSnapshot> {
        self.start_order
            .iter()
            .rev()
            .filter_map(move |name| self.service(name))
    }
}

/// Journal entry of the state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Transition {
        service: String,
        from: ServiceStatus,
        to: ServiceStatus,
        at: DateTime<Utc>,
    },
    Probe {
        service: String,
        attempt: u32,
        result: ProbeResult,
        at: DateTime<Utc>,
    },
    RunState {
        state: RunState,
        at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ServiceStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&RunState::BringingUp).unwrap(),
            "\"bringing-up\""
        );
        assert_eq!(RunState::TearingDown.to_string(), "tearing-down");
    }

    #[test]
    fn test_live_and_terminal_statuses() {
        assert!(ServiceStatus::Stopped.is_terminal());
        assert!(ServiceStatus::Failed.is_terminal());
        assert!(!ServiceStatus::Unhealthy.is_terminal());

        let mut state = RuntimeState {
            status: ServiceStatus::Unhealthy,
            ..RuntimeState::default()
        };
        assert!(!state.is_live());
        state.restart_pending = true;
        assert!(state.is_live());
    }

    #[test]
    fn test_snapshot_shutdown_order() {
        let service = |name: &str| ServiceSnapshot {
            name: name.to_string(),
            status: ServiceStatus::Healthy,
            pid: None,
            container: None,
            start_time: None,
            last_probe_result: None,
            restarts: 0,
            last_error: None,
            stop_grace_ms: 0,
        };
        let snapshot = Snapshot {
            project: "app".to_string(),
            run_state: RunState::Running,
            services: vec![service("web"), service("db"), service("cache")],
            start_order: vec!["db".to_string(), "web".to_string()],
            updated_at: Utc::now(),
        };

        let order: Vec<_> = snapshot.shutdown_order().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["web", "db"]);

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
