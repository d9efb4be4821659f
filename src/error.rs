//! Error types for Stagehand

use thiserror::Error;

/// Result type for Stagehand operations
pub type Result<T> = std::result::Result<T, StagehandError>;

/// Stagehand error types
#[derive(Error, Debug)]
pub enum StagehandError {
    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Host port {port} is published by both '{first}' and '{second}'")]
    DuplicateHostPort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("Service '{0}' must have either 'image' or 'build' specified")]
    MissingLaunchSource(String),

    #[error("Dependency cycle detected between services: {}", participants.join(", "))]
    Cycle { participants: Vec<String> },

    #[error("Failed to launch service '{service}': {reason}")]
    Launch { service: String, reason: String },

    #[error("Startup aborted: service '{service}' failed ({reason}); last health: {last_health}")]
    StartupAborted {
        service: String,
        reason: String,
        last_health: String,
    },

    #[error("Bring-up cancelled")]
    Cancelled,

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StagehandError {
    /// Whether this error was raised while loading configuration, before
    /// anything was started.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            StagehandError::ComposeParse(_)
                | StagehandError::InvalidConfig(_)
                | StagehandError::UnknownDependency { .. }
                | StagehandError::DuplicateHostPort { .. }
                | StagehandError::MissingLaunchSource(_)
                | StagehandError::Cycle { .. }
        )
    }
}
