//! Dependency graph built from a `PipelineIR`, used to determine which
//! nodes are eligible to run next in `SYNC` mode.

use crate::error::{OrchestratorError, Result};
use crate::ids::NodeId;
use crate::ir::PipelineIR;
use std::collections::{HashMap, HashSet};

/// Topologically-ordered view of a pipeline's nodes, built once per
/// `PipelineIR` and reused for every eligibility check during a run.
#[derive(Debug, Clone)]
pub struct NodeGraph {
    dependencies: HashMap<NodeId, Vec<NodeId>>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
    execution_order: Vec<Vec<NodeId>>,
}

impl NodeGraph {
    pub fn from_ir(ir: &PipelineIR) -> Result<Self> {
        let dependencies = ir.dependency_map();

        let mut dependents: HashMap<NodeId, Vec<NodeId>> =
            ir.node_ids().map(|id| (id.clone(), Vec::new())).collect();
        for (node, deps) in &dependencies {
            for dep in deps {
                dependents.entry(dep.clone()).or_default().push(node.clone());
            }
        }

        let execution_order = Self::topological_sort(&dependencies)?;

        Ok(Self {
            dependencies,
            dependents,
            execution_order,
        })
    }

    /// Nodes grouped by "wave": each inner `Vec` can run in parallel once
    /// every earlier wave has completed.
    fn topological_sort(
        dependencies: &HashMap<NodeId, Vec<NodeId>>,
    ) -> Result<Vec<Vec<NodeId>>> {
        let mut in_degree: HashMap<NodeId, usize> = dependencies
            .iter()
            .map(|(id, deps)| (id.clone(), deps.len()))
            .collect();

        let mut result = Vec::new();
        let mut processed: HashSet<NodeId> = HashSet::new();

        while processed.len() < dependencies.len() {
            let ready: Vec<NodeId> = in_degree
                .iter()
                .filter(|(id, &degree)| degree == 0 && !processed.contains(*id))
                .map(|(id, _)| id.clone())
                .collect();

            if ready.is_empty() {
                return Err(OrchestratorError::failed_precondition(
                    "dependency cycle detected in pipeline IR",
                ));
            }

            let mut wave = ready.clone();
            wave.sort();
            result.push(wave);

            for node in &ready {
                processed.insert(node.clone());
                in_degree.remove(node);
            }
            for (id, deps) in dependencies {
                if processed.contains(id) {
                    continue;
                }
                let remaining = deps.iter().filter(|d| !processed.contains(*d)).count();
                in_degree.insert(id.clone(), remaining);
            }
        }

        Ok(result)
    }

    pub fn execution_order(&self) -> &[Vec<NodeId>] {
        &self.execution_order
    }

    pub fn dependencies_of(&self, node: &NodeId) -> &[NodeId] {
        self.dependencies
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, node: &NodeId) -> &[NodeId] {
        self.dependents.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes whose every dependency is present in `completed` and that are
    /// not themselves already in `completed` — the SYNC-mode scheduling
    /// frontier.
    pub fn eligible_nodes(&self, completed: &HashSet<NodeId>) -> Vec<NodeId> {
        self.dependencies
            .keys()
            .filter(|id| !completed.contains(*id))
            .filter(|id| {
                self.dependencies_of(id)
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    /// `true` once every node is in `completed` — a SYNC pipeline is done.
    pub fn is_complete(&self, completed: &HashSet<NodeId>) -> bool {
        self.dependencies.keys().all(|id| completed.contains(id))
    }
}
