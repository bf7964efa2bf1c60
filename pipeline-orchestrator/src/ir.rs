//! Declarative pipeline definition.
//!
//! `PipelineIR` is accepted as an already-resolved value; parsing a DSL or
//! source files into one is an external collaborator's job, out of scope
//! here.

use crate::error::{OrchestratorError, Result};
use crate::ids::{NodeId, PipelineId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// `SYNC` runs a finite DAG to completion; `SYNC_ASYNC` (`Async`) drives a
/// continuous, long-running graph that never naturally terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Sync,
    Async,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "SYNC_ASYNC",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One node's declaration within a `PipelineIR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub dependencies: Vec<NodeId>,
    /// A node with no runnable executor-backed role (e.g. a purely
    /// structural grouping node). Feasible nodes are the only ones that can
    /// ever have an `ExecNodeTask` emitted for them.
    pub feasible: bool,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, dependencies: Vec<NodeId>) -> Self {
        Self {
            id: id.into(),
            dependencies,
            feasible: true,
        }
    }
}

/// Immutable declarative pipeline definition: ordered list of nodes with
/// their dependencies and an execution mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineIR {
    pub id: PipelineId,
    pub mode: ExecutionMode,
    pub nodes: Vec<NodeSpec>,
}

impl PipelineIR {
    /// Validates that every declared dependency refers to a node that is
    /// also declared in the same IR.
    pub fn new(id: PipelineId, mode: ExecutionMode, nodes: Vec<NodeSpec>) -> Result<Self> {
        let known: HashSet<&NodeId> = nodes.iter().map(|n| &n.id).collect();
        for node in &nodes {
            for dep in &node.dependencies {
                if !known.contains(dep) {
                    return Err(OrchestratorError::failed_precondition(format!(
                        "node {} depends on undeclared node {}",
                        node.id, dep
                    )));
                }
            }
        }
        Ok(Self { id, mode, nodes })
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }

    /// Map of node id to its direct dependencies, for dependency-driven
    /// scheduling.
    pub fn dependency_map(&self) -> HashMap<NodeId, Vec<NodeId>> {
        self.nodes
            .iter()
            .map(|n| (n.id.clone(), n.dependencies.clone()))
            .collect()
    }
}
