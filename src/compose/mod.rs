//! Compose file loading
//!
//! Reads a Docker Compose style YAML file and turns it into a validated
//! [`Project`](crate::service::Project).

pub mod config;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig};
pub use parser::{
    interpolate, parse_duration, parse_env_file, parse_port, ComposeParser, DEFAULT_COMPOSE_FILES,
};
