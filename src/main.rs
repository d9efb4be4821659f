//! Stagehand - health-gated service bring-up
//!
//! This is the main CLI entry point for Stagehand.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use stagehand::compose::{parse_duration, parse_env_file, ComposeParser, DEFAULT_COMPOSE_FILES};
use stagehand::health::HealthProbeRunner;
use stagehand::orchestrator::{
    Orchestrator, OrchestratorConfig, RunState, ServiceStatus, Snapshot,
};
use stagehand::service::Project;
use stagehand::store::{RunRecord, StateStore};
use stagehand::supervisor::{process, signal, ContainerRuntime, ProcessSupervisor};
use stagehand::StagehandError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Stagehand - health-gated service bring-up
#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Start a compose project in dependency order, waiting for each service to be healthy", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Compose file (defaults to compose.yaml / docker-compose.yml here)
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// File with variables for ${VAR} interpolation
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Directory for the run record and service logs
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// How services are launched (docker or process)
    #[arg(long, global = true, default_value = "docker")]
    runtime: ContainerRuntime,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all services, each once its dependencies are healthy
    Up {
        /// Keep supervising until Ctrl-C, then tear everything down
        #[arg(short, long)]
        attach: bool,
        /// Stop services that did come up when bring-up fails
        #[arg(long)]
        rollback: bool,
        /// Time allowed for one service to launch and become healthy
        #[arg(long, value_parser = parse_duration, default_value = "60s")]
        start_timeout: Duration,
        /// Restarts allowed per service
        #[arg(long, default_value_t = 5)]
        max_restarts: u32,
    },

    /// Stop the recorded run in reverse start order
    Down {
        /// Grace period override for every service
        #[arg(short, long, value_parser = parse_duration)]
        timeout: Option<Duration>,
    },

    /// Show the state of each service
    #[command(alias = "ps")]
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the compose file and print the start order
    Config,

    /// Print the captured output of a service
    Logs {
        /// Service name
        service: String,
        /// Number of lines to show from the end
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<StagehandError>() {
                Some(err) if err.is_config_error() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Up {
            attach,
            rollback,
            start_timeout,
            max_restarts,
        } => {
            let project = load_project(&cli)?;
            let store = open_store(&cli, project.name())?;
            let config = OrchestratorConfig {
                start_timeout,
                max_restarts,
                rollback_on_abort: rollback,
                ..OrchestratorConfig::default()
            };
            up(project, store, cli.runtime, config, attach).await
        }
        Commands::Down { timeout } => {
            // The compose file may have changed or vanished since `up`
            let store = open_store(&cli, &recorded_project_name(&cli)?)?;
            down(&store, timeout).await
        }
        Commands::Status { json } => {
            let result = recorded_project_name(&cli)
                .and_then(|name| open_store(&cli, &name))
                .and_then(|store| status(&store, json));
            if let Err(e) = result {
                warn!("{:#}", e);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            print_config(&load_project(&cli)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs { ref service, tail } => {
            let project = load_project(&cli)?;
            if project.get(service).is_none() {
                return Err(StagehandError::ServiceNotFound(service.clone()).into());
            }
            let store = open_store(&cli, project.name())?;
            let path = store.log_path(service);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("No logs for {} at {}", service, path.display()))?;
            let lines: Vec<&str> = content.lines().collect();
            let skip = tail.map(|n| lines.len().saturating_sub(n)).unwrap_or(0);
            for line in &lines[skip..] {
                println!("{}", line);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(cli: &Cli, project: &str) -> anyhow::Result<StateStore> {
    Ok(match &cli.state_dir {
        Some(dir) => StateStore::new(dir.clone()),
        None => StateStore::default_for(project)?,
    })
}

fn compose_path(cli: &Cli) -> anyhow::Result<Option<PathBuf>> {
    if let Some(file) = &cli.file {
        return Ok(Some(file.clone()));
    }
    let working_dir = std::env::current_dir()?;
    Ok(ComposeParser::find_compose_file(&working_dir))
}

fn interpolation_vars(cli: &Cli) -> anyhow::Result<IndexMap<String, String>> {
    match &cli.env_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read env file {}", path.display()))?;
            Ok(parse_env_file(&content))
        }
        None => Ok(IndexMap::new()),
    }
}

/// Name of the project whose run record `down` and `status` act on.
///
/// Only the compose file's `name` key or its directory is consulted, so a
/// compose file that no longer validates still finds its record.
fn recorded_project_name(cli: &Cli) -> anyhow::Result<String> {
    if cli.state_dir.is_some() {
        return Ok(String::new());
    }
    let path = match compose_path(cli)? {
        Some(path) => path,
        None => std::env::current_dir()?.join(DEFAULT_COMPOSE_FILES[0]),
    };
    let vars = interpolation_vars(cli).unwrap_or_default();
    Ok(ComposeParser::project_name_of(&path, &vars))
}

fn load_project(cli: &Cli) -> anyhow::Result<Project> {
    let compose_file = match compose_path(cli)? {
        Some(path) => path,
        None => bail!(
            "No compose file found in {}",
            std::env::current_dir()?.display()
        ),
    };
    let vars = interpolation_vars(cli)?;
    Ok(ComposeParser::load(&compose_file, &vars)?)
}

async fn up(
    project: Project,
    store: StateStore,
    runtime: ContainerRuntime,
    config: OrchestratorConfig,
    attach: bool,
) -> anyhow::Result<ExitCode> {
    if let Some(record) = store.load()? {
        let live = record
            .snapshot
            .services
            .iter()
            .filter_map(|s| s.pid)
            .any(signal::is_alive);
        if live {
            bail!(
                "Project {} is already up (run {}); run `stagehand down` first",
                record.project,
                record.run_id
            );
        }
    }

    let supervisor = ProcessSupervisor::new(project.name(), runtime).with_log_dir(store.logs_dir());
    let runner = HealthProbeRunner::network()?;
    let mut orchestrator =
        Orchestrator::new(Arc::new(project), Arc::new(supervisor), runner, config);

    let run_id = Uuid::new_v4();
    let persister = spawn_persister(store.clone(), run_id, orchestrator.subscribe());
    spawn_signal_handler(orchestrator.cancel_token());

    // The record is kept only while services are left running
    let (code, keep_record) = match orchestrator.up().await {
        Ok(()) => {
            print_status(&orchestrator.snapshot());
            if attach {
                info!("Supervising; press Ctrl-C to stop");
                let report = orchestrator.watch().await;
                let code = if report.forced() {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                };
                (code, false)
            } else {
                (ExitCode::SUCCESS, true)
            }
        }
        Err(StagehandError::Cancelled) => (ExitCode::FAILURE, false),
        Err(e) => {
            error!("{}", e);
            let snapshot = orchestrator.snapshot();
            print_status(&snapshot);
            (ExitCode::FAILURE, snapshot.run_state != RunState::Terminated)
        }
    };

    let snapshot = orchestrator.snapshot();
    drop(orchestrator);
    if let Err(e) = persister.await {
        warn!("Snapshot writer ended abnormally: {}", e);
    }

    if keep_record {
        store.save(&RunRecord::new(run_id, snapshot))?;
    } else {
        store.clear()?;
    }
    Ok(code)
}

/// Persist every published snapshot while the run is being brought up
fn spawn_persister(
    store: StateStore,
    run_id: Uuid,
    mut snapshots: tokio::sync::watch::Receiver<Snapshot>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if snapshot.run_state == RunState::Terminated {
                continue;
            }
            if let Err(e) = store.save(&RunRecord::new(run_id, snapshot)) {
                warn!("Failed to save run record: {}", e);
            }
        }
    })
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal");
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn down(store: &StateStore, timeout: Option<Duration>) -> anyhow::Result<ExitCode> {
    let Some(record) = store.load()? else {
        println!("Nothing to stop");
        return Ok(ExitCode::SUCCESS);
    };

    // An attached `up` tears down on its own when signalled
    if record.owner_pid != std::process::id() && signal::is_alive(record.owner_pid) {
        info!("Asking stagehand (pid {}) to stop", record.owner_pid);
        signal::signal_process(record.owner_pid, libc::SIGTERM)?;

        let longest = record
            .snapshot
            .services
            .iter()
            .map(|s| Duration::from_millis(s.stop_grace_ms))
            .sum::<Duration>();
        let deadline = tokio::time::Instant::now() + longest + Duration::from_secs(5);
        while signal::is_alive(record.owner_pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !signal::is_alive(record.owner_pid) && store.load()?.is_none() {
            return Ok(ExitCode::SUCCESS);
        }
        warn!("stagehand (pid {}) did not finish teardown", record.owner_pid);
    }

    let mut forced = false;
    for service in record.snapshot.shutdown_order() {
        let Some(pid) = service.pid else {
            continue;
        };
        let grace = timeout.unwrap_or(Duration::from_millis(service.stop_grace_ms));
        let outcome = signal::stop_pid(pid, grace)
            .await
            .with_context(|| format!("Failed to stop {}", service.name))?;

        if outcome.was_forced() {
            forced = true;
            if let Some(ref container) = service.container {
                process::remove_container(container).await;
            }
        }
        println!("{:<20} {}", service.name, outcome);
    }

    store.clear()?;
    Ok(if forced {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn status(store: &StateStore, json: bool) -> anyhow::Result<()> {
    let Some(record) = store.load()? else {
        println!("No recorded run");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("Run {} ({})", record.run_id, record.snapshot.run_state);
        print_status(&record.snapshot);
    }
    Ok(())
}

fn print_status(snapshot: &Snapshot) {
    println!(
        "{:<20} {:<10} {:<8} {:<8} {:<20} {}",
        "SERVICE", "STATUS", "PID", "RESTARTS", "STARTED", "LAST HEALTH"
    );
    for service in &snapshot.services {
        let mut status = service.status.to_string();
        if service.status == ServiceStatus::Healthy
            && service.pid.is_some_and(|pid| !signal::is_alive(pid))
        {
            status.push('?');
        }
        println!(
            "{:<20} {:<10} {:<8} {:<8} {:<20} {}",
            service.name,
            status,
            service
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            service.restarts,
            service
                .start_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            service
                .last_probe_result
                .as_ref()
                .map(|r| r.to_string())
                .or_else(|| service.last_error.clone())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

fn print_config(project: &Project) {
    println!("Project: {}", project.name());
    for (position, spec) in project.start_order().enumerate() {
        let deps = if spec.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (after {})", spec.depends_on.join(", "))
        };
        let probe = spec
            .health_probe
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "no probe".to_string());
        println!(
            "{:>3}. {:<20} {:<30} {}{}",
            position + 1,
            spec.name,
            spec.launch.to_string(),
            probe,
            deps
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stagehand::orchestrator::ServiceSnapshot;

    const CYCLIC: &str = "services:\n  a:\n    image: x\n    depends_on: [b]\n  b:\n    image: y\n    depends_on: [a]\n";

    fn cli(dir: &std::path::Path, args: &[&str]) -> Cli {
        let file = dir.join("compose.yaml");
        let state = dir.join("state");
        let mut argv = vec![
            "stagehand".to_string(),
            "-f".to_string(),
            file.display().to_string(),
            "--state-dir".to_string(),
            state.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::parse_from(argv)
    }

    fn record() -> RunRecord {
        RunRecord::new(
            Uuid::new_v4(),
            Snapshot {
                project: "app".to_string(),
                run_state: RunState::Running,
                services: vec![ServiceSnapshot {
                    name: "a".to_string(),
                    status: ServiceStatus::Healthy,
                    pid: None,
                    container: None,
                    start_time: Some(Utc::now()),
                    last_probe_result: None,
                    restarts: 0,
                    last_error: None,
                    stop_grace_ms: 1_000,
                }],
                start_order: vec!["a".to_string()],
                updated_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn test_status_without_compose_file() {
        let dir = tempfile::tempdir().unwrap();
        let code = run(cli(dir.path(), &["status"])).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
    }

    #[tokio::test]
    async fn test_status_with_invalid_compose_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("compose.yaml"), CYCLIC).unwrap();
        StateStore::new(dir.path().join("state")).save(&record()).unwrap();

        let code = run(cli(dir.path(), &["status", "--json"])).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
    }

    #[tokio::test]
    async fn test_status_with_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(dir.path().join("state/run.json"), b"{not json").unwrap();

        let code = run(cli(dir.path(), &["status"])).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
    }

    #[tokio::test]
    async fn test_down_after_compose_file_broke() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("compose.yaml"), CYCLIC).unwrap();
        let store = StateStore::new(dir.path().join("state"));
        store.save(&record()).unwrap();

        let code = run(cli(dir.path(), &["down"])).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_config_rejects_cycle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("compose.yaml"), CYCLIC).unwrap();

        let err = run(cli(dir.path(), &["config"])).await.unwrap_err();
        let err = err.downcast_ref::<StagehandError>().unwrap();
        assert!(err.is_config_error());
    }
}
