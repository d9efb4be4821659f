//! Compose file configuration types
//!
//! These mirror the YAML document as written. Keys Stagehand does not act on
//! (`volumes`, `networks`, `secrets`, ...) are accepted and ignored.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version
    #[serde(default)]
    pub version: Option<String>,
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services, in declaration order
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    /// Compose healthcheck, mapped to a command probe
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Readiness probe
    #[serde(default)]
    pub health_probe: Option<HealthProbeConfig>,
    /// Restart policy (compose spelling)
    #[serde(default)]
    pub restart: Option<String>,
    /// Restart policy
    #[serde(default)]
    pub restart_policy: Option<String>,
    /// Deploy configuration
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
    /// Stop grace period
    #[serde(default)]
    pub stop_grace_period: Option<Scalar>,
}

/// A YAML scalar that may be written as a string, a number or a boolean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(s) => write!(f, "{}", s),
            Scalar::Integer(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    pub context: Option<String>,
    /// Dockerfile path
    pub dockerfile: Option<String>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(IndexMap<String, Option<Scalar>>),
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port: `- 80`
    Number(u16),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    pub published: Option<Scalar>,
    /// Host IP to bind to
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    pub protocol: Option<String>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(IndexMap<String, DependsOnCondition>),
}

impl DependsOnConfig {
    /// Dependency names in declaration order
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOnConfig::Array(arr) => arr.clone(),
            DependsOnConfig::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Depends on condition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for; every dependency is gated on health regardless
    #[serde(default)]
    pub condition: Option<String>,
}

/// Deploy configuration, only the restart policy is read
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Restart policy
    pub restart_policy: Option<RestartPolicyConfig>,
}

/// Restart policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    /// Condition (none, on-failure, any)
    pub condition: Option<String>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    pub test: Option<HealthcheckTest>,
    /// Interval
    pub interval: Option<Scalar>,
    /// Timeout
    pub timeout: Option<Scalar>,
    /// Retries
    pub retries: Option<u32>,
    /// Start period
    pub start_period: Option<Scalar>,
    /// Disable healthcheck
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Readiness probe configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthProbeConfig {
    /// tcp-connect, command or http-get
    pub kind: String,
    /// Port, `host:port`, URL/path or command, depending on the kind
    #[serde(default)]
    pub target: Option<ProbeTargetConfig>,
    /// Interval
    pub interval: Option<Scalar>,
    /// Timeout
    pub timeout: Option<Scalar>,
    /// Retries
    pub retries: Option<u32>,
    /// Start period
    pub start_period: Option<Scalar>,
}

/// Probe target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeTargetConfig {
    /// Command argv
    Args(Vec<String>),
    /// Port, address, URL or shell command
    Value(Scalar),
}
