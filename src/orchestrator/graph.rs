use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::interpolate::referenced_services;
use crate::config::model::{KioskConfig, ServiceKind};

/// A node in the service dependency graph.
#[derive(Debug, Clone)]
pub struct ServiceNode {
    pub name: String,
    pub kind: ServiceKind,
    /// Position in the config file.
    pub declared: usize,
}

/// Resolves launch order from `depends_on` plus template references.
///
/// Edges point from dependency to dependent. Among services whose
/// dependencies are satisfied, backends go before the UI server and earlier
/// declarations go first, so an acyclic config always yields the same order.
#[derive(Debug)]
pub struct DependencyResolver {
    graph: DiGraph<ServiceNode, ()>,
    node_map: BTreeMap<String, NodeIndex>,
}

impl DependencyResolver {
    /// Build the graph. Fails if a service depends on a name that is not
    /// declared.
    pub fn from_config(config: &KioskConfig) -> Result<Self, String> {
        let mut graph = DiGraph::new();
        let mut node_map = BTreeMap::new();

        for (declared, svc) in config.services.iter().enumerate() {
            let idx = graph.add_node(ServiceNode {
                name: svc.name.clone(),
                kind: svc.kind,
                declared,
            });
            node_map.insert(svc.name.clone(), idx);
        }

        for svc in &config.services {
            let dependent_idx = node_map[&svc.name];
            let deps: BTreeSet<String> = svc
                .depends_on
                .iter()
                .cloned()
                .chain(referenced_services(svc))
                .collect();
            for dep in deps {
                let dep_idx = node_map.get(&dep).ok_or_else(|| {
                    format!(
                        "service '{}' depends on '{}', which is not defined",
                        svc.name, dep
                    )
                })?;
                graph.add_edge(*dep_idx, dependent_idx, ());
            }
        }

        Ok(Self { graph, node_map })
    }

    /// `Err` carries the name of a service on a cycle.
    pub fn cycle_check(&self) -> Result<(), String> {
        toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|cycle| self.graph[cycle.node_id()].name.clone())
    }

    /// Launch order, dependencies first.
    pub fn start_order(&self) -> Result<Vec<String>, String> {
        self.cycle_check()
            .map_err(|node| format!("dependency cycle detected involving '{}'", node))?;

        let mut pending: BTreeMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let incoming = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count();
                (idx, incoming)
            })
            .collect();

        let rank = |idx: NodeIndex| {
            let node = &self.graph[idx];
            (node.kind == ServiceKind::Ui, node.declared)
        };

        let mut order = Vec::with_capacity(pending.len());
        while let Some(next) = pending
            .iter()
            .filter(|(_, incoming)| **incoming == 0)
            .map(|(idx, _)| *idx)
            .min_by_key(|idx| rank(*idx))
        {
            pending.remove(&next);
            for dependent in self.graph.neighbors_directed(next, Direction::Outgoing) {
                if let Some(incoming) = pending.get_mut(&dependent) {
                    *incoming -= 1;
                }
            }
            order.push(self.graph[next].name.clone());
        }

        Ok(order)
    }

    /// Direct dependencies of `name`, in declared order.
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.node_map.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<&ServiceNode> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|d| &self.graph[d])
            .collect();
        deps.sort_by_key(|n| n.declared);
        deps.dedup_by_key(|n| n.declared);
        deps.into_iter().map(|n| n.name.clone()).collect()
    }
}
