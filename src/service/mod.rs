//! Service descriptors and dependency resolution
//!
//! This module holds the immutable description of a stack: one
//! [`ServiceSpec`] per service, gathered into a validated [`Project`].

pub mod graph;
pub mod project;
pub mod spec;

pub use graph::{resolve, DependencyGraph};
pub use project::Project;
pub use spec::{
    HealthProbeSpec, LaunchSource, PortMapping, ProbeCheck, ProbeKind, Protocol, RestartPolicy,
    ServiceSpec,
};
