//! Dependency graph resolution
//!
//! Services are stored arena-style: the graph refers to them by their
//! declaration index, never by pointer.

use super::spec::ServiceSpec;
use crate::error::{Result, StagehandError};
use std::collections::{BTreeSet, HashMap};

/// Read-only view of the `depends_on` edges of a set of services
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Service names in declaration order
    names: Vec<String>,
    /// For each service, the services it depends on
    dependencies: Vec<Vec<usize>>,
    /// For each service, the services that depend on it
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph, failing on references to undeclared services
    pub fn new(specs: &[ServiceSpec]) -> Result<Self> {
        let index: HashMap<&str, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); specs.len()];
        let mut dependents = vec![Vec::new(); specs.len()];

        for (i, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                let j = *index.get(dep.as_str()).ok_or_else(|| {
                    StagehandError::UnknownDependency {
                        service: spec.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;

                if !dependencies[i].contains(&j) {
                    dependencies[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        Ok(Self {
            names: specs.iter().map(|s| s.name.clone()).collect(),
            dependencies,
            dependents,
        })
    }

    /// Number of services in the graph
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name of the service at `index`
    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// Declaration index of a service
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Services `index` depends on
    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Services depending on `index`
    pub fn dependents_of(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Topological order as declaration indices.
    ///
    /// Kahn's algorithm; when several services are ready at once the one
    /// declared first is taken, so the order is stable across runs.
    pub fn resolve(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.len() {
            return Err(StagehandError::Cycle {
                participants: self.cycle_participants(&in_degree),
            });
        }

        Ok(order)
    }

    /// Start order as service names
    pub fn start_order(&self) -> Result<Vec<String>> {
        Ok(self
            .resolve()?
            .into_iter()
            .map(|i| self.names[i].clone())
            .collect())
    }

    /// Shutdown order: the start order reversed
    pub fn shutdown_order(&self) -> Result<Vec<String>> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }

    /// Nodes left unresolved by Kahn's algorithm include services that only
    /// depend on a cycle. Peel those off from the dependent side until only
    /// nodes with an unresolved dependent remain.
    fn cycle_participants(&self, in_degree: &[usize]) -> Vec<String> {
        let mut remaining: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(i, _)| i)
            .collect();

        loop {
            let leaves: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&n| !self.dependents[n].iter().any(|d| remaining.contains(d)))
                .collect();
            if leaves.is_empty() {
                break;
            }
            for leaf in leaves {
                remaining.remove(&leaf);
            }
        }

        remaining.into_iter().map(|i| self.names[i].clone()).collect()
    }
}

/// Resolve the start order of a set of services
pub fn resolve(specs: &[ServiceSpec]) -> Result<Vec<String>> {
    DependencyGraph::new(specs)?.start_order()
}
