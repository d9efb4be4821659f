//! Probe execution

use super::{ProbeResult, ProbeTarget};
use crate::error::{Result, StagehandError};
use crate::service::{HealthProbeSpec, ProbeCheck};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Executes a single probe attempt
#[async_trait]
pub trait Prober: Send + Sync {
    /// Run one attempt. Callers bound it with the probe timeout.
    async fn probe(
        &self,
        service: &str,
        spec: &HealthProbeSpec,
        target: &ProbeTarget,
    ) -> ProbeResult;
}

/// Prober that talks to real sockets and processes
pub struct NetworkProber {
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| StagehandError::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn tcp_connect(host: &str, port: u16) -> ProbeResult {
        match TcpStream::connect((host, port)).await {
            Ok(_) => ProbeResult::Ready,
            Err(e) => ProbeResult::NotReady(format!("connect {}:{}: {}", host, port, e)),
        }
    }

    async fn run_command(argv: &[String], target: &ProbeTarget) -> ProbeResult {
        let full: Vec<&String> = target.exec_prefix.iter().chain(argv.iter()).collect();
        let Some((program, args)) = full.split_first() else {
            return ProbeResult::ProbeError("empty probe command".to_string());
        };

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => ProbeResult::Ready,
            Ok(status) => ProbeResult::NotReady(format!("command exited with {}", status)),
            Err(e) => ProbeResult::ProbeError(format!("cannot run '{}': {}", program, e)),
        }
    }

    async fn http_get(&self, host: &str, port: u16, path: &str) -> ProbeResult {
        let url = format!("http://{}:{}{}", host, port, path);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => ProbeResult::Ready,
            Ok(response) => ProbeResult::NotReady(format!("GET {} returned {}", url, response.status())),
            Err(e) if e.is_builder() => ProbeResult::ProbeError(format!("bad request {}: {}", url, e)),
            Err(e) => ProbeResult::NotReady(format!("GET {}: {}", url, e)),
        }
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(
        &self,
        _service: &str,
        spec: &HealthProbeSpec,
        target: &ProbeTarget,
    ) -> ProbeResult {
        match &spec.check {
            ProbeCheck::TcpConnect { host, port } => {
                Self::tcp_connect(host.as_deref().unwrap_or(&target.host), *port).await
            }
            ProbeCheck::Command { argv } => Self::run_command(argv, target).await,
            ProbeCheck::HttpGet { host, port, path } => {
                self.http_get(host.as_deref().unwrap_or(&target.host), *port, path)
                    .await
            }
        }
    }
}

/// Runs a probe until ready or out of attempts
#[derive(Clone)]
pub struct HealthProbeRunner {
    prober: Arc<dyn Prober>,
}

impl HealthProbeRunner {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Runner backed by [`NetworkProber`]
    pub fn network() -> Result<Self> {
        Ok(Self::new(Arc::new(NetworkProber::new()?)))
    }

    /// Probe up to `retries` times, spaced by `interval`, and report the
    /// last result.
    pub async fn check(
        &self,
        service: &str,
        spec: &HealthProbeSpec,
        target: &ProbeTarget,
    ) -> ProbeResult {
        self.check_with(service, spec, target, |_, _| {}).await
    }

    /// Like [`check`](Self::check), calling `on_attempt` after every attempt
    pub async fn check_with<F>(
        &self,
        service: &str,
        spec: &HealthProbeSpec,
        target: &ProbeTarget,
        mut on_attempt: F,
    ) -> ProbeResult
    where
        F: FnMut(u32, &ProbeResult) + Send,
    {
        let attempts = spec.retries.max(1);
        let mut last = ProbeResult::NotReady("not probed".to_string());

        for attempt in 1..=attempts {
            let started = Instant::now();
            last = match tokio::time::timeout(
                spec.timeout,
                self.prober.probe(service, spec, target),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => ProbeResult::NotReady(format!("timed out after {:?}", spec.timeout)),
            };

            match &last {
                ProbeResult::Ready => {
                    debug!(
                        "Probe {} for {} ready after {:?}",
                        spec,
                        service,
                        started.elapsed()
                    );
                }
                ProbeResult::NotReady(reason) => {
                    info!(
                        "Service {} not ready (attempt {}/{}): {}",
                        service, attempt, attempts, reason
                    );
                }
                ProbeResult::ProbeError(reason) => {
                    warn!(
                        "Probe for {} failed to run (attempt {}/{}): {}",
                        service, attempt, attempts, reason
                    );
                }
            }
            on_attempt(attempt, &last);

            if last.is_ready() {
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(spec.interval).await;
            }
        }

        last
    }
}
