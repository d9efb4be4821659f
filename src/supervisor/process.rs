//! Local process and container supervision

use super::{signal, ExitOutcome, ProcessHandle, RunningState, Supervisor};
use crate::error::{Result, StagehandError};
use crate::health::ProbeTarget;
use crate::service::{LaunchSource, ServiceSpec};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How services are launched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerRuntime {
    /// Run the service `command` directly on the host
    Process,
    /// Run the service image through the docker CLI
    #[default]
    Docker,
}

impl FromStr for ContainerRuntime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "process" | "local" => Ok(ContainerRuntime::Process),
            "docker" => Ok(ContainerRuntime::Docker),
            other => Err(format!("unknown runtime '{}' (expected process or docker)", other)),
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerRuntime::Process => write!(f, "process"),
            ContainerRuntime::Docker => write!(f, "docker"),
        }
    }
}

/// Fully resolved launch instructions for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Environment added to the spawned process
    pub env: IndexMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// `docker build` arguments to run before launching
    pub build: Option<Vec<String>>,
    pub container: Option<String>,
}

impl LaunchPlan {
    /// Resolve how `spec` is launched under `runtime`
    pub fn resolve(project: &str, runtime: ContainerRuntime, spec: &ServiceSpec) -> Result<Self> {
        let launch_error = |reason: String| StagehandError::Launch {
            service: spec.name.clone(),
            reason,
        };

        if let LaunchSource::Build { ref context, .. } = spec.launch {
            if !context.is_dir() {
                return Err(launch_error(format!(
                    "build context {} does not exist",
                    context.display()
                )));
            }
        }

        match runtime {
            ContainerRuntime::Process => {
                let cwd = match &spec.launch {
                    LaunchSource::Image(image) => {
                        return Err(launch_error(format!(
                            "image '{}' cannot run under the process runtime",
                            image
                        )))
                    }
                    LaunchSource::Build { context, .. } => match &spec.working_dir {
                        Some(wd) => context.join(wd),
                        None => context.clone(),
                    },
                };

                let (program, args) = spec
                    .command
                    .split_first()
                    .ok_or_else(|| launch_error("no command to run".to_string()))?;

                Ok(Self {
                    program: program.clone(),
                    args: args.to_vec(),
                    env: spec.environment.clone(),
                    cwd: Some(cwd),
                    build: None,
                    container: None,
                })
            }
            ContainerRuntime::Docker => {
                let container = container_name(project, &spec.name);

                let (image, build) = match &spec.launch {
                    LaunchSource::Image(image) => (image.clone(), None),
                    LaunchSource::Build {
                        context,
                        dockerfile,
                        tag,
                    } => {
                        let tag = tag
                            .clone()
                            .unwrap_or_else(|| format!("{}-{}:latest", project, spec.name));
                        let mut build = vec!["build".to_string(), "-t".to_string(), tag.clone()];
                        if let Some(dockerfile) = dockerfile {
                            build.push("-f".to_string());
                            build.push(context.join(dockerfile).display().to_string());
                        }
                        build.push(context.display().to_string());
                        (tag, Some(build))
                    }
                };

                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    container.clone(),
                ];
                for port in &spec.ports {
                    if port.host_port.is_some() {
                        args.push("-p".to_string());
                        args.push(port.to_string());
                    } else {
                        args.push("--expose".to_string());
                        args.push(port.container_port.to_string());
                    }
                }
                for (key, value) in &spec.environment {
                    args.push("-e".to_string());
                    args.push(format!("{}={}", key, value));
                }
                if let Some(ref wd) = spec.working_dir {
                    args.push("-w".to_string());
                    args.push(wd.display().to_string());
                }
                args.push(image);
                args.extend(spec.command.iter().cloned());

                Ok(Self {
                    program: "docker".to_string(),
                    args,
                    env: IndexMap::new(),
                    cwd: None,
                    build,
                    container: Some(container),
                })
            }
        }
    }
}

/// Container name for a service of a project
pub fn container_name(project: &str, service: &str) -> String {
    format!("{}-{}", project, service)
}

/// Force-remove a container, ignoring failures
pub async fn remove_container(container: &str) {
    let result = Command::new("docker")
        .args(["rm", "-f", container])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!("docker rm -f {} failed: {}", container, e);
    }
}

/// Supervisor for host processes and `docker run` clients.
///
/// Each service runs in its own process group so a stop reaches everything
/// it spawned. Children are not killed when the supervisor is dropped, which
/// lets a detached `up` exit while services keep running.
pub struct ProcessSupervisor {
    project: String,
    runtime: ContainerRuntime,
    /// Service output goes to `<log_dir>/<service>.log` when set
    log_dir: Option<PathBuf>,
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, Child>>,
}

impl ProcessSupervisor {
    /// Create a new supervisor
    pub fn new(project: &str, runtime: ContainerRuntime) -> Self {
        Self {
            project: project.to_string(),
            runtime,
            log_dir: None,
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Capture service output under `dir`
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    fn output(&self, service: &str) -> Result<(Stdio, Stdio)> {
        match &self.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("{}.log", service)))?;
                let stderr = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(stderr)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }

    async fn build_image(&self, spec: &ServiceSpec, args: &[String]) -> Result<()> {
        info!("Building image for service: {}", spec.name);
        let (stdout, stderr) = self.output(&spec.name)?;

        let status = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| StagehandError::Launch {
                service: spec.name.clone(),
                reason: format!("failed to run docker build: {}", e),
            })?;

        if !status.success() {
            return Err(StagehandError::Launch {
                service: spec.name.clone(),
                reason: format!("docker build failed with {}", status),
            });
        }
        Ok(())
    }

    fn lock_children(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, Child>>> {
        self.children
            .lock()
            .map_err(|_| StagehandError::Lock("Failed to acquire supervisor lock".to_string()))
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&self, spec: &ServiceSpec) -> Result<ProcessHandle> {
        let plan = LaunchPlan::resolve(&self.project, self.runtime, spec)?;

        if let Some(ref build) = plan.build {
            self.build_image(spec, build).await?;
        }
        if let Some(ref container) = plan.container {
            remove_container(container).await;
        }

        let (stdout, stderr) = self.output(&spec.name)?;
        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .envs(&plan.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(false);
        if let Some(ref cwd) = plan.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn().map_err(|e| StagehandError::Launch {
            service: spec.name.clone(),
            reason: format!("failed to spawn '{}': {}", plan.program, e),
        })?;

        let pid = child.id();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_children()?.insert(id, child);

        info!(
            "Started service {} (pid {})",
            spec.name,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );

        Ok(ProcessHandle {
            id,
            service: spec.name.clone(),
            pid,
            container: plan.container,
        })
    }

    async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> Result<ExitOutcome> {
        let child = self.lock_children()?.remove(&handle.id);
        let Some(mut child) = child else {
            return Ok(ExitOutcome::AlreadyExited { code: None });
        };

        if let Some(status) = child.try_wait()? {
            return Ok(ExitOutcome::AlreadyExited {
                code: status.code(),
            });
        }

        if let Some(pid) = child.id() {
            signal::signal_group(pid, libc::SIGTERM)?;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Service {} exited with {}", handle.service, status);
                Ok(ExitOutcome::Graceful {
                    code: status.code(),
                })
            }
            Err(_) => {
                warn!(
                    "Service {} did not stop within {:?}, killing it",
                    handle.service, grace
                );
                if let Some(pid) = child.id() {
                    signal::signal_group(pid, libc::SIGKILL)?;
                }
                let _ = child.kill().await;
                if let Some(ref container) = handle.container {
                    remove_container(container).await;
                }
                Ok(ExitOutcome::Forced)
            }
        }
    }

    fn poll(&self, handle: &ProcessHandle) -> Result<RunningState> {
        let mut children = self.lock_children()?;
        let child = children
            .get_mut(&handle.id)
            .ok_or_else(|| StagehandError::ServiceNotFound(handle.service.clone()))?;

        match child.try_wait()? {
            None => Ok(RunningState::Running),
            Some(status) => {
                // Reaped; a later stop reports it as already exited
                children.remove(&handle.id);
                Ok(RunningState::from_status(status))
            }
        }
    }

    fn probe_target(&self, spec: &ServiceSpec) -> ProbeTarget {
        match self.runtime {
            ContainerRuntime::Process => ProbeTarget::local(),
            ContainerRuntime::Docker => ProbeTarget::local().exec_prefix(vec![
                "docker".to_string(),
                "exec".to_string(),
                container_name(&self.project, &spec.name),
            ]),
        }
    }
}

/// Read the captured log of a service
pub fn read_log(log_dir: &Path, service: &str) -> Result<String> {
    Ok(std::fs::read_to_string(log_dir.join(format!("{}.log", service)))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(name: &str, script: &str, context: &Path) -> ServiceSpec {
        ServiceSpec::new(
            name,
            LaunchSource::Build {
                context: context.to_path_buf(),
                dockerfile: None,
                tag: None,
            },
        )
        .command(vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_start_poll_and_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new("test", ContainerRuntime::Process);
        let spec = shell("sleeper", "exec sleep 30", dir.path());

        let handle = supervisor.start(&spec).await.unwrap();
        assert!(handle.pid.is_some());
        assert_eq!(supervisor.poll(&handle).unwrap(), RunningState::Running);

        let outcome = supervisor.stop(&handle, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::Graceful { .. }));
        assert!(!outcome.was_forced());
    }

    #[tokio::test]
    async fn test_stop_forces_after_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new("test", ContainerRuntime::Process);
        let spec = shell("stubborn", "trap '' TERM; while true; do sleep 1; done", dir.path());

        let handle = supervisor.start(&spec).await.unwrap();
        // Give the shell a moment to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let outcome = supervisor
            .stop(&handle, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Forced);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_exit_code_observed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new("test", ContainerRuntime::Process);
        let spec = shell("quitter", "exit 3", dir.path());

        let handle = supervisor.start(&spec).await.unwrap();
        let mut state = supervisor.poll(&handle).unwrap();
        for _ in 0..50 {
            if !state.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = supervisor.poll(&handle).unwrap();
        }
        assert_eq!(state, RunningState::Exited(3));
    }

    #[tokio::test]
    async fn test_exited_child_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new("test", ContainerRuntime::Process);
        let spec = shell("quitter", "exit 3", dir.path());

        for _ in 0..3 {
            let handle = supervisor.start(&spec).await.unwrap();
            while supervisor.poll(&handle).unwrap().is_running() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            assert!(supervisor.lock_children().unwrap().is_empty());
            assert!(supervisor.poll(&handle).is_err());
            let outcome = supervisor.stop(&handle, Duration::from_secs(1)).await.unwrap();
            assert_eq!(outcome, ExitOutcome::AlreadyExited { code: None });
        }
    }

    #[tokio::test]
    async fn test_environment_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let supervisor =
            ProcessSupervisor::new("test", ContainerRuntime::Process).with_log_dir(logs.clone());
        let spec = shell("printer", "echo \"db=$DB_HOST\"", dir.path()).env("DB_HOST", "db");

        let handle = supervisor.start(&spec).await.unwrap();
        for _ in 0..50 {
            if !supervisor.poll(&handle).unwrap().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(read_log(&logs, "printer").unwrap().trim(), "db=db");
    }

    #[tokio::test]
    async fn test_missing_build_context_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new("test", ContainerRuntime::Process);
        let spec = shell("ghost", "true", &dir.path().join("missing"));

        let err = supervisor.start(&spec).await.unwrap_err();
        assert!(matches!(err, StagehandError::Launch { ref service, .. } if service == "ghost"));
    }

    #[tokio::test]
    async fn test_unknown_program_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new("test", ContainerRuntime::Process);
        let spec = ServiceSpec::new(
            "nope",
            LaunchSource::Build {
                context: dir.path().to_path_buf(),
                dockerfile: None,
                tag: None,
            },
        )
        .command(vec!["/definitely/not/a/program".to_string()]);

        assert!(matches!(
            supervisor.start(&spec).await,
            Err(StagehandError::Launch { .. })
        ));
    }

    #[test]
    fn test_image_needs_container_runtime() {
        let spec = ServiceSpec::image("db", "mysql:8");
        assert!(matches!(
            LaunchPlan::resolve("app", ContainerRuntime::Process, &spec),
            Err(StagehandError::Launch { .. })
        ));
    }

    #[test]
    fn test_docker_plan() {
        let spec = ServiceSpec::image("db", "mysql:8")
            .port(3307, 3306)
            .env("MYSQL_DATABASE", "fastapi");

        let plan = LaunchPlan::resolve("app", ContainerRuntime::Docker, &spec).unwrap();
        assert_eq!(plan.program, "docker");
        assert_eq!(
            plan.args,
            vec![
                "run",
                "--rm",
                "--name",
                "app-db",
                "-p",
                "3307:3306",
                "-e",
                "MYSQL_DATABASE=fastapi",
                "mysql:8"
            ]
        );
        assert_eq!(plan.container.as_deref(), Some("app-db"));
        assert!(plan.build.is_none());
    }

    #[test]
    fn test_docker_build_plan() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ServiceSpec::new(
            "web",
            LaunchSource::Build {
                context: dir.path().to_path_buf(),
                dockerfile: Some("Dockerfile.dev".to_string()),
                tag: None,
            },
        );

        let plan = LaunchPlan::resolve("app", ContainerRuntime::Docker, &spec).unwrap();
        let build = plan.build.unwrap();
        assert_eq!(&build[..3], &["build", "-t", "app-web:latest"]);
        assert!(build.contains(&"-f".to_string()));
        assert_eq!(plan.args.last().map(String::as_str), Some("app-web:latest"));
    }
}
