//! Run record persistence
//!
//! `up` records what it started so that `status` and `down`, which run as
//! separate processes, can find the services again.

use crate::error::{Result, StagehandError};
use crate::orchestrator::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const RECORD_FILE: &str = "run.json";

/// Persisted state of the last `up`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub project: String,
    /// Pid of the `up` process that owns the services
    pub owner_pid: u32,
    pub updated_at: DateTime<Utc>,
    pub snapshot: Snapshot,
}

impl RunRecord {
    pub fn new(run_id: Uuid, snapshot: Snapshot) -> Self {
        Self {
            run_id,
            project: snapshot.project.clone(),
            owner_pid: std::process::id(),
            updated_at: Utc::now(),
            snapshot,
        }
    }
}

/// State directory of one project
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Default location: `<state dir>/stagehand/<project>`
    pub fn default_for(project: &str) -> Result<Self> {
        let base = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or_else(|| {
                StagehandError::InvalidConfig(
                    "Cannot determine a state directory, pass --state-dir".to_string(),
                )
            })?;
        Ok(Self::new(base.join("stagehand").join(project)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding captured service output
    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }

    pub fn log_path(&self, service: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", service))
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    /// Write the record, replacing any previous one atomically
    pub fn save(&self, record: &RunRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!("{}.tmp", RECORD_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, self.record_path())?;
        debug!("Saved run record to {}", self.record_path().display());
        Ok(())
    }

    /// The last record, if any
    pub fn load(&self) -> Result<Option<RunRecord>> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Forget the last run. Logs are kept.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(self.record_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{RunState, ServiceSnapshot, ServiceStatus};

    fn snapshot() -> Snapshot {
        Snapshot {
            project: "app".to_string(),
            run_state: RunState::Running,
            services: vec![ServiceSnapshot {
                name: "db".to_string(),
                status: ServiceStatus::Healthy,
                pid: Some(4242),
                container: Some("app-db".to_string()),
                start_time: Some(Utc::now()),
                last_probe_result: None,
                restarts: 0,
                last_error: None,
                stop_grace_ms: 10_000,
            }],
            start_order: vec!["db".to_string()],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("app"));
        assert!(store.load().unwrap().is_none());

        let record = RunRecord::new(Uuid::new_v4(), snapshot());
        store.save(&record).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.owner_pid, std::process::id());
        assert_eq!(loaded.snapshot.service("db").unwrap().pid, Some(4242));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_path_buf());
        fs::write(dir.path().join(RECORD_FILE), b"{not json").unwrap();
        assert!(matches!(store.load(), Err(StagehandError::Json(_))));
    }

    #[test]
    fn test_log_path() {
        let store = StateStore::new(PathBuf::from("/var/lib/stagehand/app"));
        assert_eq!(
            store.log_path("web"),
            PathBuf::from("/var/lib/stagehand/app/logs/web.log")
        );
    }
}
