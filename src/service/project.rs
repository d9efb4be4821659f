//! A validated set of services

use super::graph::DependencyGraph;
use super::spec::{Protocol, ServiceSpec};
use crate::error::{Result, StagehandError};
use std::collections::HashMap;

/// Validated, immutable set of services.
///
/// Construction checks every load-time invariant: unique names, known
/// dependencies, unique published host ports and an acyclic graph.
#[derive(Debug, Clone)]
pub struct Project {
    name: String,
    services: Vec<ServiceSpec>,
    graph: DependencyGraph,
    start_order: Vec<usize>,
}

impl Project {
    /// Validate `services` and build the project
    pub fn new(name: &str, services: Vec<ServiceSpec>) -> Result<Self> {
        let mut seen = HashMap::new();
        for (i, spec) in services.iter().enumerate() {
            if spec.name.is_empty() {
                return Err(StagehandError::InvalidConfig(
                    "Service names must not be empty".to_string(),
                ));
            }
            if seen.insert(spec.name.as_str(), i).is_some() {
                return Err(StagehandError::InvalidConfig(format!(
                    "Service '{}' is declared more than once",
                    spec.name
                )));
            }
        }

        Self::check_host_ports(&services)?;

        let graph = DependencyGraph::new(&services)?;
        let start_order = graph.resolve()?;

        Ok(Self {
            name: name.to_string(),
            services,
            graph,
            start_order,
        })
    }

    fn check_host_ports(services: &[ServiceSpec]) -> Result<()> {
        let mut published: HashMap<(u16, Protocol), &str> = HashMap::new();

        for spec in services {
            for port in &spec.ports {
                let Some(host_port) = port.host_port else {
                    continue;
                };
                if let Some(first) = published.insert((host_port, port.protocol), &spec.name) {
                    return Err(StagehandError::DuplicateHostPort {
                        port: host_port,
                        first: first.to_string(),
                        second: spec.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Project name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Services in declaration order
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    /// Look up a service by name
    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.graph.index_of(name).map(|i| &self.services[i])
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Services in start order
    pub fn start_order(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.start_order.iter().map(|&i| &self.services[i])
    }

    /// Declaration indices in start order
    pub fn start_order_indices(&self) -> &[usize] {
        &self.start_order
    }

    /// Service names in start order
    pub fn start_order_names(&self) -> Vec<String> {
        self.start_order().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::spec::PortMapping;

    #[test]
    fn test_duplicate_host_port_rejected() {
        let services = vec![
            ServiceSpec::image("db", "mysql").port(3307, 3306),
            ServiceSpec::image("cache", "redis").port(3307, 6379),
        ];

        let err = Project::new("app", services).unwrap_err();
        match err {
            StagehandError::DuplicateHostPort {
                port,
                first,
                second,
            } => {
                assert_eq!(port, 3307);
                assert_eq!(first, "db");
                assert_eq!(second, "cache");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_same_port_different_protocol_allowed() {
        let mut dns = ServiceSpec::image("dns", "coredns").port(5353, 53);
        dns.ports.push(PortMapping {
            protocol: Protocol::Udp,
            ..PortMapping::published(5353, 53)
        });
        // container-only ports never collide
        dns.ports.push(PortMapping {
            host_port: None,
            ..PortMapping::published(0, 9153)
        });

        let project = Project::new("app", vec![dns]).unwrap();
        assert_eq!(project.len(), 1);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let services = vec![
            ServiceSpec::image("db", "mysql"),
            ServiceSpec::image("db", "postgres"),
        ];
        assert!(matches!(
            Project::new("app", services),
            Err(StagehandError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_cycle_rejected_at_load() {
        let services = vec![
            ServiceSpec::image("a", "busybox").depends_on("b"),
            ServiceSpec::image("b", "busybox").depends_on("a"),
        ];
        let err = Project::new("app", services).unwrap_err();
        assert!(err.is_config_error());
        assert!(matches!(err, StagehandError::Cycle { .. }));
    }

    #[test]
    fn test_start_order_and_lookup() {
        let services = vec![
            ServiceSpec::image("web", "app").depends_on("db").port(8000, 8000),
            ServiceSpec::image("db", "mysql").port(3307, 3306),
        ];
        let project = Project::new("app", services).unwrap();

        assert_eq!(project.start_order_names(), vec!["db", "web"]);
        assert_eq!(project.get("db").unwrap().first_host_port(), Some(3307));
        assert!(project.get("cache").is_none());
    }
}
