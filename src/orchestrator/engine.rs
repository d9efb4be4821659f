//! Bring-up and teardown coordination

use super::state::{
    OrchestratorEvent, RunState, RuntimeState, ServiceSnapshot, ServiceStatus, Snapshot,
};
use crate::error::{Result, StagehandError};
use crate::health::{HealthProbeRunner, ProbeResult};
use crate::service::{Project, ServiceSpec};
use crate::supervisor::{ExitOutcome, ProcessHandle, RunningState, Supervisor};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on launch plus readiness for one attempt
    pub start_timeout: Duration,
    /// First restart delay
    pub backoff_initial: Duration,
    /// Upper bound on the restart delay
    pub backoff_max: Duration,
    pub backoff_factor: f64,
    /// Restarts allowed per service in one run
    pub max_restarts: u32,
    /// How often workers poll a running process for exit
    pub poll_interval: Duration,
    /// Stop every started service when bring-up aborts
    pub rollback_on_abort: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_restarts: 5,
            poll_interval: Duration::from_millis(250),
            rollback_on_abort: false,
        }
    }
}

impl OrchestratorConfig {
    /// Delay before restart number `restart` (1-based), with +/-10% jitter
    pub fn backoff(&self, restart: u32) -> Duration {
        let exponent = restart.saturating_sub(1).min(32) as i32;
        let base = self.backoff_initial.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.backoff_max.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

/// Result of stopping a project
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Services in the order they were stopped
    pub stopped: Vec<(String, ExitOutcome)>,
    /// Services whose stop request failed
    pub errors: Vec<(String, String)>,
}

impl TeardownReport {
    /// Whether any service had to be killed
    pub fn forced(&self) -> bool {
        self.stopped.iter().any(|(_, outcome)| outcome.was_forced())
    }

    pub fn is_clean(&self) -> bool {
        !self.forced() && self.errors.is_empty()
    }
}

#[derive(Debug)]
enum Report {
    /// Backoff is over and the process is being started
    Attempting,
    Launched { handle: ProcessHandle },
    LaunchFailed { reason: String },
    Probe { attempt: u32, result: ProbeResult },
    Ready,
    /// Not ready in time; the worker has already stopped the process
    Unhealthy { reason: String },
    Exited { state: RunningState },
}

#[derive(Debug)]
struct WorkerReport {
    index: usize,
    generation: u64,
    report: Report,
}

/// Drives one project from `pending` to `running` and back down.
///
/// The orchestrator is the only writer of [`RuntimeState`]. Every start
/// attempt runs in its own worker task which reports back over a channel;
/// reports from a superseded attempt are dropped by generation.
pub struct Orchestrator {
    project: Arc<Project>,
    supervisor: Arc<dyn Supervisor>,
    runner: HealthProbeRunner,
    config: OrchestratorConfig,
    states: Vec<RuntimeState>,
    /// Indices in the order they first reached `starting`
    started: Vec<usize>,
    run_state: RunState,
    first_failure: Option<usize>,
    /// Set while quiescing; failures no longer restart
    stopping: bool,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    reports_rx: mpsc::UnboundedReceiver<WorkerReport>,
    cancel: CancellationToken,
    workers_token: CancellationToken,
    workers: JoinSet<()>,
    snapshots: watch::Sender<Snapshot>,
    events: Vec<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        project: Arc<Project>,
        supervisor: Arc<dyn Supervisor>,
        runner: HealthProbeRunner,
        config: OrchestratorConfig,
    ) -> Self {
        let states = vec![RuntimeState::default(); project.len()];
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let workers_token = cancel.child_token();

        let initial = Snapshot {
            project: project.name().to_string(),
            run_state: RunState::BringingUp,
            services: Vec::new(),
            start_order: Vec::new(),
            updated_at: Utc::now(),
        };
        let (snapshots, _) = watch::channel(initial);

        let orchestrator = Self {
            project,
            supervisor,
            runner,
            config,
            states,
            started: Vec::new(),
            run_state: RunState::BringingUp,
            first_failure: None,
            stopping: false,
            reports_tx,
            reports_rx,
            cancel,
            workers_token,
            workers: JoinSet::new(),
            snapshots,
            events: Vec::new(),
        };
        orchestrator.publish();
        orchestrator
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// State of one service
    pub fn state(&self, name: &str) -> Option<&RuntimeState> {
        self.project
            .graph()
            .index_of(name)
            .map(|index| &self.states[index])
    }

    /// Cancelling this token stops bring-up or supervision and tears down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receive a fresh snapshot after every state change
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// State machine journal
    pub fn events(&self) -> &[OrchestratorEvent] {
        &self.events
    }

    /// Service names in the order they were started
    pub fn start_order(&self) -> Vec<String> {
        self.started
            .iter()
            .map(|&index| self.name(index).to_string())
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        let services = self
            .project
            .services()
            .iter()
            .zip(&self.states)
            .map(|(spec, state)| ServiceSnapshot {
                name: spec.name.clone(),
                status: state.status,
                pid: state.process_handle.as_ref().and_then(|h| h.pid),
                container: state.process_handle.as_ref().and_then(|h| h.container.clone()),
                start_time: state.start_time,
                last_probe_result: state.last_probe_result.clone(),
                restarts: state.restarts,
                last_error: state.last_error.clone(),
                stop_grace_ms: spec.stop_grace_period.as_millis() as u64,
            })
            .collect();

        Snapshot {
            project: self.project.name().to_string(),
            run_state: self.run_state,
            services,
            start_order: self.start_order(),
            updated_at: Utc::now(),
        }
    }

    /// Start every service, each only after its dependencies are healthy.
    ///
    /// Returns once every service is healthy (or exited cleanly without a
    /// restart). The first service that fails halts bring-up: services still
    /// starting are stopped, healthy ones keep running unless rollback is
    /// configured, and the caller gets [`StagehandError::StartupAborted`].
    pub async fn up(&mut self) -> Result<()> {
        info!(
            "Bringing up project {} ({} services)",
            self.project.name(),
            self.project.len()
        );
        self.set_run_state(RunState::BringingUp);

        loop {
            self.schedule();
            self.publish();

            if self.bring_up_complete() {
                self.set_run_state(RunState::Running);
                self.publish();
                info!("Project {} is running", self.project.name());
                return Ok(());
            }

            if let Some((index, reason)) = self.abort_cause() {
                return Err(self.abort(index, reason).await);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Bring-up of {} cancelled", self.project.name());
                    self.teardown().await;
                    return Err(StagehandError::Cancelled);
                }
                Some(report) = self.reports_rx.recv() => self.apply(report),
            }
        }
    }

    /// Keep supervising a running project until cancelled, then tear down.
    ///
    /// Crashes are handled by restart policy. Supervision also ends once no
    /// service is left running.
    pub async fn watch(&mut self) -> TeardownReport {
        loop {
            if !self.states.iter().any(RuntimeState::is_live) {
                warn!("No services left running in {}", self.project.name());
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(report) = self.reports_rx.recv() => {
                    self.apply(report);
                    self.publish();
                }
            }
        }

        self.teardown().await
    }

    /// Stop every started service in reverse start order
    pub async fn teardown(&mut self) -> TeardownReport {
        info!("Tearing down project {}", self.project.name());
        self.set_run_state(RunState::TearingDown);
        self.quiesce().await;
        self.publish();

        let mut report = TeardownReport::default();
        let order: Vec<usize> = self.started.iter().rev().copied().collect();
        for index in order {
            self.stop_service(index, &mut report).await;
        }

        // Services that never got a process
        for index in 0..self.states.len() {
            if self.states[index].status.is_active() {
                self.transition(index, ServiceStatus::Stopped);
            }
        }

        self.set_run_state(RunState::Terminated);
        self.publish();
        report
    }

    /// Alias for [`teardown`](Self::teardown)
    pub async fn down(&mut self) -> TeardownReport {
        self.teardown().await
    }

    fn name(&self, index: usize) -> &str {
        &self.project.services()[index].name
    }

    fn set_run_state(&mut self, state: RunState) {
        if self.run_state == state && !self.events.is_empty() {
            return;
        }
        self.run_state = state;
        debug!("Project {} is {}", self.project.name(), state);
        self.events.push(OrchestratorEvent::RunState {
            state,
            at: Utc::now(),
        });
    }

    fn transition(&mut self, index: usize, to: ServiceStatus) {
        let from = self.states[index].status;
        if from == to {
            return;
        }
        self.states[index].status = to;

        let name = self.name(index).to_string();
        match to {
            ServiceStatus::Failed => error!("Service {}: {} -> {}", name, from, to),
            ServiceStatus::Unhealthy => warn!("Service {}: {} -> {}", name, from, to),
            _ => info!("Service {}: {} -> {}", name, from, to),
        }

        if to == ServiceStatus::Failed && self.first_failure.is_none() {
            self.first_failure = Some(index);
        }

        self.events.push(OrchestratorEvent::Transition {
            service: name,
            from,
            to,
            at: Utc::now(),
        });
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Launch every pending service whose dependencies are all healthy
    fn schedule(&mut self) {
        if self.stopping {
            return;
        }

        let order = self.project.start_order_indices().to_vec();
        for index in order {
            if self.states[index].status != ServiceStatus::Pending {
                continue;
            }
            let ready = self
                .project
                .graph()
                .dependencies_of(index)
                .iter()
                .all(|&dep| self.states[dep].status == ServiceStatus::Healthy);
            if ready {
                self.launch(index, Duration::ZERO);
            }
        }
    }

    /// Start a new attempt; a delayed one enters `starting` once its backoff ends
    fn launch(&mut self, index: usize, delay: Duration) {
        self.states[index].generation += 1;
        self.states[index].process_handle = None;
        if delay.is_zero() {
            self.transition(index, ServiceStatus::Starting);
        } else {
            self.states[index].restart_pending = true;
            // The exited process is gone while the backoff runs
            if self.states[index].status.is_active() {
                self.transition(index, ServiceStatus::Unhealthy);
            }
        }
        if !self.started.contains(&index) {
            self.started.push(index);
        }

        let attempt = Attempt {
            index,
            generation: self.states[index].generation,
            spec: self.project.services()[index].clone(),
            delay,
            supervisor: self.supervisor.clone(),
            runner: self.runner.clone(),
            start_timeout: self.config.start_timeout,
            poll_interval: self.config.poll_interval,
            reports: self.reports_tx.clone(),
            token: self.workers_token.clone(),
        };
        self.workers.spawn(attempt.run());
    }

    fn bring_up_complete(&self) -> bool {
        self.states
            .iter()
            .all(|s| matches!(s.status, ServiceStatus::Healthy | ServiceStatus::Stopped))
    }

    /// First reason bring-up can no longer finish
    fn abort_cause(&self) -> Option<(usize, String)> {
        if let Some(index) = self.first_failure {
            let reason = self.states[index]
                .last_error
                .clone()
                .unwrap_or_else(|| "failed".to_string());
            return Some((index, reason));
        }

        let graph = self.project.graph();
        for (index, state) in self.states.iter().enumerate() {
            if state.status != ServiceStatus::Pending {
                continue;
            }
            for &dep in graph.dependencies_of(index) {
                if self.states[dep].status.is_terminal() {
                    return Some((
                        dep,
                        format!(
                            "exited before dependent service '{}' could start",
                            self.name(index)
                        ),
                    ));
                }
            }
        }

        None
    }

    async fn abort(&mut self, index: usize, reason: String) -> StagehandError {
        let service = self.name(index).to_string();
        let last_health = self.states[index].last_health();
        error!("Bring-up aborted by service {}: {}", service, reason);

        self.quiesce().await;

        if self.config.rollback_on_abort {
            self.teardown().await;
        } else {
            let mut report = TeardownReport::default();
            let in_flight: Vec<usize> = self
                .started
                .iter()
                .rev()
                .copied()
                .filter(|&i| {
                    matches!(
                        self.states[i].status,
                        ServiceStatus::Starting | ServiceStatus::Unhealthy
                    )
                })
                .collect();
            for i in in_flight {
                self.stop_service(i, &mut report).await;
            }
            self.set_run_state(RunState::Aborted);
            self.publish();
        }

        StagehandError::StartupAborted {
            service,
            reason,
            last_health,
        }
    }

    /// Cancel every worker and apply whatever they reported
    async fn quiesce(&mut self) {
        self.stopping = true;
        self.workers_token.cancel();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!("Service worker ended abnormally: {}", e);
            }
        }
        while let Ok(report) = self.reports_rx.try_recv() {
            self.apply(report);
        }
        for state in &mut self.states {
            state.restart_pending = false;
        }
    }

    async fn stop_service(&mut self, index: usize, report: &mut TeardownReport) {
        let name = self.name(index).to_string();
        let Some(handle) = self.states[index].process_handle.take() else {
            if self.states[index].status.is_active()
                || self.states[index].status == ServiceStatus::Unhealthy
            {
                self.transition(index, ServiceStatus::Stopped);
            }
            return;
        };

        let grace = self.project.services()[index].stop_grace_period;
        info!("Stopping service {}", name);
        match self.supervisor.stop(&handle, grace).await {
            Ok(outcome) => {
                if outcome.was_forced() {
                    warn!("Service {} {}", name, outcome);
                } else {
                    debug!("Service {} {}", name, outcome);
                }
                report.stopped.push((name, outcome));
            }
            Err(e) => {
                error!("Failed to stop service {}: {}", name, e);
                self.states[index].last_error = Some(e.to_string());
                report.errors.push((name, e.to_string()));
            }
        }
        self.transition(index, ServiceStatus::Stopped);
        self.publish();
    }

    fn apply(&mut self, report: WorkerReport) {
        let WorkerReport {
            index,
            generation,
            report,
        } = report;

        if self.states[index].generation != generation {
            debug!(
                "Dropping stale report for {} (attempt {})",
                self.name(index),
                generation
            );
            return;
        }

        match report {
            Report::Attempting => {
                self.states[index].restart_pending = false;
                self.transition(index, ServiceStatus::Starting);
            }
            Report::Launched { handle } => {
                self.states[index].process_handle = Some(handle);
                self.states[index].start_time = Some(Utc::now());
            }
            Report::Probe { attempt, result } => {
                self.events.push(OrchestratorEvent::Probe {
                    service: self.name(index).to_string(),
                    attempt,
                    result: result.clone(),
                    at: Utc::now(),
                });
                self.states[index].last_probe_result = Some(result);
            }
            Report::Ready => {
                if self.states[index].status == ServiceStatus::Starting {
                    self.transition(index, ServiceStatus::Healthy);
                }
            }
            Report::LaunchFailed { reason } => {
                self.states[index].process_handle = None;
                self.states[index].last_error = Some(reason);
                self.transition(index, ServiceStatus::Failed);
            }
            Report::Unhealthy { reason } => {
                self.states[index].process_handle = None;
                self.transition(index, ServiceStatus::Unhealthy);
                self.handle_failure(index, false, reason);
            }
            Report::Exited { state } => {
                self.states[index].process_handle = None;
                let reason = format!("process {}", state);
                self.handle_failure(index, state.is_clean_exit(), reason);
            }
        }
    }

    /// Apply the restart policy to a service that stopped being ready
    fn handle_failure(&mut self, index: usize, clean_exit: bool, reason: String) {
        let name = self.name(index).to_string();
        if !clean_exit {
            self.states[index].last_error = Some(reason.clone());
        }

        if self.stopping {
            self.transition(index, ServiceStatus::Stopped);
            return;
        }

        let policy = self.project.services()[index].restart_policy;
        if policy.restarts(clean_exit) {
            if self.states[index].restarts < self.config.max_restarts {
                self.states[index].restarts += 1;
                let restarts = self.states[index].restarts;
                let delay = self.config.backoff(restarts);
                warn!(
                    "Restarting service {} in {:?} ({}/{}): {}",
                    name, delay, restarts, self.config.max_restarts, reason
                );
                self.launch(index, delay);
                return;
            }
            warn!(
                "Service {} exhausted its {} restarts",
                name, self.config.max_restarts
            );
            if !clean_exit {
                self.states[index].last_error = Some(format!(
                    "{} (gave up after {} restarts)",
                    reason, self.config.max_restarts
                ));
            }
        }

        if clean_exit {
            self.transition(index, ServiceStatus::Stopped);
        } else {
            self.transition(index, ServiceStatus::Failed);
        }
    }
}

/// One start attempt of one service, run as its own task
struct Attempt {
    index: usize,
    generation: u64,
    spec: ServiceSpec,
    delay: Duration,
    supervisor: Arc<dyn Supervisor>,
    runner: HealthProbeRunner,
    start_timeout: Duration,
    poll_interval: Duration,
    reports: mpsc::UnboundedSender<WorkerReport>,
    token: CancellationToken,
}

impl Attempt {
    fn report(&self, report: Report) {
        let _ = self.reports.send(WorkerReport {
            index: self.index,
            generation: self.generation,
            report,
        });
    }

    async fn run(self) {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = sleep(self.delay) => {}
            }
        }
        if self.token.is_cancelled() {
            return;
        }
        if !self.delay.is_zero() {
            self.report(Report::Attempting);
        }

        let deadline = Instant::now() + self.start_timeout;
        // Not cancellable: a started process must always be reported
        let handle = match timeout_at(deadline, self.supervisor.start(&self.spec)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                self.report(Report::LaunchFailed {
                    reason: e.to_string(),
                });
                return;
            }
            Err(_) => {
                self.report(Report::Unhealthy {
                    reason: format!("launch did not finish within {:?}", self.start_timeout),
                });
                return;
            }
        };
        self.report(Report::Launched {
            handle: handle.clone(),
        });
        if self.token.is_cancelled() {
            return;
        }

        let target = self.supervisor.probe_target(&self.spec);
        let reports = self.reports.clone();
        let (index, generation) = (self.index, self.generation);
        let readiness = async {
            match &self.spec.health_probe {
                None => ProbeResult::Ready,
                Some(probe) => {
                    sleep(probe.start_period).await;
                    self.runner
                        .check_with(&self.spec.name, probe, &target, |attempt, result| {
                            let _ = reports.send(WorkerReport {
                                index,
                                generation,
                                report: Report::Probe {
                                    attempt,
                                    result: result.clone(),
                                },
                            });
                        })
                        .await
                }
            }
        };

        let readiness = tokio::select! {
            _ = self.token.cancelled() => return,
            state = wait_exit(self.supervisor.as_ref(), &handle, self.poll_interval) => {
                self.report(Report::Exited { state });
                return;
            }
            result = timeout_at(deadline, readiness) => result,
        };

        match readiness {
            Ok(ProbeResult::Ready) => self.report(Report::Ready),
            Ok(result) => {
                self.stop(&handle).await;
                self.report(Report::Unhealthy {
                    reason: result.to_string(),
                });
                return;
            }
            Err(_) => {
                self.stop(&handle).await;
                self.report(Report::Unhealthy {
                    reason: format!("not ready within {:?}", self.start_timeout),
                });
                return;
            }
        }

        tokio::select! {
            _ = self.token.cancelled() => {}
            state = wait_exit(self.supervisor.as_ref(), &handle, self.poll_interval) => {
                self.report(Report::Exited { state });
            }
        }
    }

    async fn stop(&self, handle: &ProcessHandle) {
        if let Err(e) = self
            .supervisor
            .stop(handle, self.spec.stop_grace_period)
            .await
        {
            warn!("Failed to stop unhealthy service {}: {}", self.spec.name, e);
        }
    }
}

/// Resolve once the process is no longer running
async fn wait_exit(
    supervisor: &dyn Supervisor,
    handle: &ProcessHandle,
    interval: Duration,
) -> RunningState {
    loop {
        match supervisor.poll(handle) {
            Ok(RunningState::Running) => {}
            Ok(state) => return state,
            Err(e) => {
                debug!("Lost track of {}: {}", handle.service, e);
                return RunningState::Crashed { signal: None };
            }
        }
        sleep(interval).await;
    }
}
