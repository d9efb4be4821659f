//! Service descriptors
//!
//! A [`ServiceSpec`] is built once from the compose file and never mutated
//! afterwards. Everything the supervisor and the probe runner need to know
//! about a service lives here.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Where a service's process or container comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSource {
    /// Build context directory, optionally with a Dockerfile and image tag
    Build {
        context: PathBuf,
        dockerfile: Option<String>,
        tag: Option<String>,
    },
    /// Prebuilt image reference
    Image(String),
}

impl fmt::Display for LaunchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchSource::Build { context, .. } => write!(f, "build:{}", context.display()),
            LaunchSource::Image(image) => write!(f, "image:{}", image),
        }
    }
}

/// Network protocol of a published port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Host interface to bind, all interfaces when unset
    pub host_ip: Option<String>,
    /// Published host port; `None` exposes the container port only
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    /// Published `host:container` TCP mapping
    pub fn published(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref ip) = self.host_ip {
            write!(f, "{}:", ip)?;
        }
        if let Some(host) = self.host_port {
            write!(f, "{}:", host)?;
        }
        write!(f, "{}", self.container_port)?;
        if self.protocol != Protocol::Tcp {
            write!(f, "/{}", self.protocol)?;
        }
        Ok(())
    }
}

/// What happens when a service fails or exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl RestartPolicy {
    /// Whether a service that ended this way is started again
    pub fn restarts(&self, clean_exit: bool) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => !clean_exit,
            RestartPolicy::Always => true,
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // compose allows "on-failure:<max>"; the cap is handled by the orchestrator
        let base = s.split(':').next().unwrap_or_default().trim();
        match base {
            "" | "no" | "never" | "none" => Ok(RestartPolicy::Never),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "always" | "unless-stopped" | "any" => Ok(RestartPolicy::Always),
            other => Err(format!("unknown restart policy '{}'", other)),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

/// Probe kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    TcpConnect,
    Command,
    HttpGet,
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp-connect" | "tcp" => Ok(ProbeKind::TcpConnect),
            "command" | "cmd" | "exec" => Ok(ProbeKind::Command),
            "http-get" | "http" => Ok(ProbeKind::HttpGet),
            other => Err(format!("unknown probe kind '{}'", other)),
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::TcpConnect => write!(f, "tcp-connect"),
            ProbeKind::Command => write!(f, "command"),
            ProbeKind::HttpGet => write!(f, "http-get"),
        }
    }
}

/// Resolved probe target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCheck {
    /// Connect to `host:port`; host defaults to the probe target host
    TcpConnect { host: Option<String>, port: u16 },
    /// `GET http://host:port/path`
    HttpGet {
        host: Option<String>,
        port: u16,
        path: String,
    },
    /// Run `argv`, ready on exit status 0
    Command { argv: Vec<String> },
}

/// Readiness check configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbeSpec {
    pub check: ProbeCheck,
    /// Spacing between attempts
    pub interval: Duration,
    /// Bound on a single attempt
    pub timeout: Duration,
    /// Attempts before reporting not-ready
    pub retries: u32,
    /// Delay before the first attempt
    pub start_period: Duration,
}

impl HealthProbeSpec {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_RETRIES: u32 = 3;

    /// Probe with default timing around the given check
    pub fn new(check: ProbeCheck) -> Self {
        Self {
            check,
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            retries: Self::DEFAULT_RETRIES,
            start_period: Duration::ZERO,
        }
    }

    /// TCP connect probe against a local port
    pub fn tcp(port: u16) -> Self {
        Self::new(ProbeCheck::TcpConnect { host: None, port })
    }

    /// HTTP GET probe against a local port
    pub fn http(port: u16, path: &str) -> Self {
        Self::new(ProbeCheck::HttpGet {
            host: None,
            port,
            path: path.to_string(),
        })
    }

    /// Command probe
    pub fn command(argv: Vec<String>) -> Self {
        Self::new(ProbeCheck::Command { argv })
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }

    pub fn kind(&self) -> ProbeKind {
        match self.check {
            ProbeCheck::TcpConnect { .. } => ProbeKind::TcpConnect,
            ProbeCheck::HttpGet { .. } => ProbeKind::HttpGet,
            ProbeCheck::Command { .. } => ProbeKind::Command,
        }
    }
}

impl fmt::Display for HealthProbeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.check {
            ProbeCheck::TcpConnect { host, port } => {
                write!(f, "tcp-connect {}:{}", host.as_deref().unwrap_or("*"), port)
            }
            ProbeCheck::HttpGet { host, port, path } => write!(
                f,
                "http-get {}:{}{}",
                host.as_deref().unwrap_or("*"),
                port,
                path
            ),
            ProbeCheck::Command { argv } => write!(f, "command {}", argv.join(" ")),
        }
    }
}

/// Immutable description of one service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    /// Unique service name
    pub name: String,
    pub launch: LaunchSource,
    /// Command override; empty keeps the image default
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub ports: Vec<PortMapping>,
    /// Passed verbatim into the service environment
    pub environment: IndexMap<String, String>,
    /// Names of services that must be healthy first
    pub depends_on: Vec<String>,
    pub health_probe: Option<HealthProbeSpec>,
    pub restart_policy: RestartPolicy,
    pub stop_grace_period: Duration,
}

impl ServiceSpec {
    /// Create a service with no ports, dependencies or probe
    pub fn new(name: &str, launch: LaunchSource) -> Self {
        Self {
            name: name.to_string(),
            launch,
            command: Vec::new(),
            working_dir: None,
            ports: Vec::new(),
            environment: IndexMap::new(),
            depends_on: Vec::new(),
            health_probe: None,
            restart_policy: RestartPolicy::Never,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
        }
    }

    /// Create a service from an image reference
    pub fn image(name: &str, image: &str) -> Self {
        Self::new(name, LaunchSource::Image(image.to_string()))
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.push(service.to_string());
        self
    }

    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::published(host_port, container_port));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn health_probe(mut self, probe: HealthProbeSpec) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// First published host port, used as the default probe port
    pub fn first_host_port(&self) -> Option<u16> {
        self.ports.iter().find_map(|p| p.host_port)
    }
}
