//! In-memory supervisor and prober for orchestrator tests

use crate::error::{Result, StagehandError};
use crate::health::{ProbeResult, ProbeTarget, Prober};
use crate::service::{HealthProbeSpec, ServiceSpec};
use crate::supervisor::{ExitOutcome, ProcessHandle, RunningState, Supervisor};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct FakeState {
    next_id: u64,
    starts: Vec<String>,
    stops: Vec<String>,
    processes: HashMap<u64, (String, RunningState)>,
}

/// Supervisor that only pretends to run processes
#[derive(Default)]
pub struct FakeSupervisor {
    start_latency: Duration,
    start_delay: Duration,
    failing: HashSet<String>,
    state: Mutex<FakeState>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_latency(mut self, latency: Duration) -> Self {
        self.start_latency = latency;
        self
    }

    /// Every start takes exactly `delay` before the process exists
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Every start of `service` fails with a launch error
    pub fn fail_launch(mut self, service: &str) -> Self {
        self.failing.insert(service.to_string());
        self
    }

    /// Services in the order they were started
    pub fn starts(&self) -> Vec<String> {
        self.state.lock().unwrap().starts.clone()
    }

    /// Services in the order they were stopped
    pub fn stops(&self) -> Vec<String> {
        self.state.lock().unwrap().stops.clone()
    }

    /// Make the newest running instance of `service` exit
    pub fn crash(&self, service: &str, exit: RunningState) {
        let mut state = self.state.lock().unwrap();
        let newest = state
            .processes
            .iter()
            .filter(|(_, (name, st))| name == service && st.is_running())
            .map(|(id, _)| *id)
            .max();
        if let Some(process) = newest.and_then(|id| state.processes.get_mut(&id)) {
            process.1 = exit;
        }
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn start(&self, spec: &ServiceSpec) -> Result<ProcessHandle> {
        if !self.start_latency.is_zero() {
            let jitter = rand::thread_rng().gen_range(0..=self.start_latency.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.starts.push(spec.name.clone());
        if self.failing.contains(&spec.name) {
            return Err(StagehandError::Launch {
                service: spec.name.clone(),
                reason: "image not found".to_string(),
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state
            .processes
            .insert(id, (spec.name.clone(), RunningState::Running));

        Ok(ProcessHandle {
            id,
            service: spec.name.clone(),
            pid: Some(40_000 + id as u32),
            container: None,
        })
    }

    async fn stop(&self, handle: &ProcessHandle, _grace: Duration) -> Result<ExitOutcome> {
        let mut state = self.state.lock().unwrap();
        state.stops.push(handle.service.clone());
        Ok(match state.processes.remove(&handle.id) {
            Some((_, RunningState::Running)) => ExitOutcome::Graceful { code: Some(0) },
            Some((_, RunningState::Exited(code))) => ExitOutcome::AlreadyExited { code: Some(code) },
            _ => ExitOutcome::AlreadyExited { code: None },
        })
    }

    fn poll(&self, handle: &ProcessHandle) -> Result<RunningState> {
        let state = self.state.lock().unwrap();
        state
            .processes
            .get(&handle.id)
            .map(|(_, st)| *st)
            .ok_or_else(|| StagehandError::ServiceNotFound(handle.service.clone()))
    }
}

/// Prober that replays scripted results per service, then reports ready
#[derive(Default)]
pub struct ScriptedProber {
    latency: Duration,
    random_latency: bool,
    scripts: Mutex<HashMap<String, VecDeque<ProbeResult>>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt takes `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self.random_latency = false;
        self
    }

    /// Every attempt takes a random time up to `latency`
    pub fn with_random_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self.random_latency = true;
        self
    }

    pub fn script(&self, service: &str, results: Vec<ProbeResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(service.to_string(), results.into());
    }

    pub fn calls_for(&self, service: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == service)
            .count()
    }

    /// Time between consecutive attempts against `service`
    pub fn gaps_for(&self, service: &str) -> Vec<Duration> {
        let calls = self.calls.lock().unwrap();
        let times: Vec<Instant> = calls
            .iter()
            .filter(|(name, _)| name == service)
            .map(|(_, at)| *at)
            .collect();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(
        &self,
        service: &str,
        _spec: &HealthProbeSpec,
        _target: &ProbeTarget,
    ) -> ProbeResult {
        self.calls
            .lock()
            .unwrap()
            .push((service.to_string(), Instant::now()));

        let delay = if self.random_latency {
            let ms = rand::thread_rng().gen_range(0..=self.latency.as_millis() as u64);
            Duration::from_millis(ms)
        } else {
            self.latency
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.scripts
            .lock()
            .unwrap()
            .get_mut(service)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ProbeResult::Ready)
    }
}
