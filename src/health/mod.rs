//! Health probing
//!
//! Readiness is observed, never assumed: a service counts as up only after
//! its probe reports [`ProbeResult::Ready`].

pub mod probe;

pub use probe::{HealthProbeRunner, NetworkProber, Prober};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum ProbeResult {
    Ready,
    /// The check ran and the service is not ready yet
    NotReady(String),
    /// The check could not be executed at all
    ProbeError(String),
}

impl ProbeResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeResult::Ready)
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeResult::Ready => write!(f, "ready"),
            ProbeResult::NotReady(reason) => write!(f, "not ready: {}", reason),
            ProbeResult::ProbeError(reason) => write!(f, "probe error: {}", reason),
        }
    }
}

/// Where a service's probe is pointed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Host used when the probe names none
    pub host: String,
    /// Prepended to command probes, e.g. `docker exec <container>`
    pub exec_prefix: Vec<String>,
}

impl ProbeTarget {
    /// Probes against published ports on this machine
    pub fn local() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            exec_prefix: Vec::new(),
        }
    }

    pub fn exec_prefix(mut self, prefix: Vec<String>) -> Self {
        self.exec_prefix = prefix;
        self
    }
}

impl Default for ProbeTarget {
    fn default() -> Self {
        Self::local()
    }
}
