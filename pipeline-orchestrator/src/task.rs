//! Task variants placed on the task queue.

use crate::ids::{NodeId, PipelineId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Deterministic id derived from `(PipelineId, NodeId)` plus an optional run
/// identifier, so a queue lookup by id is stable across process restarts
/// without the orchestrator needing to remember anything beyond metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

/// Namespace UUID for deriving deterministic v5 task ids. Any fixed value
/// works; it only needs to be stable for the lifetime of the crate.
const TASK_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x1a, 0x3d, 0x2e, 0x9c, 0x4b, 0x4a, 0x1f, 0x8e, 0x77, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc,
]);

impl TaskId {
    pub fn for_node(pipeline: &PipelineId, node: &NodeId) -> Self {
        Self::for_node_run(pipeline, node, None)
    }

    pub fn for_node_run(pipeline: &PipelineId, node: &NodeId, run: Option<&str>) -> Self {
        let key = match run {
            Some(run) => format!("{}::{}::{}", pipeline.as_str(), node.as_str(), run),
            None => format!("{}::{}", pipeline.as_str(), node.as_str()),
        };
        Self(Uuid::new_v5(&TASK_ID_NAMESPACE, key.as_bytes()))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tagged task variant consumed by node executors and, for cancellation,
/// by the task queue itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Task {
    /// Ask the executor to run (or, if `is_cancelled`, gracefully finalize)
    /// a node.
    ExecNode {
        id: TaskId,
        pipeline: PipelineId,
        node: NodeId,
        is_cancelled: bool,
    },
    /// Ask the queue to drop/cancel a pending `ExecNode` task.
    CancelNode {
        id: TaskId,
        pipeline: PipelineId,
        node: NodeId,
    },
}

impl Task {
    pub fn exec_node(pipeline: PipelineId, node: NodeId, is_cancelled: bool) -> Self {
        let id = TaskId::for_node(&pipeline, &node);
        Task::ExecNode {
            id,
            pipeline,
            node,
            is_cancelled,
        }
    }

    pub fn cancel_node(pipeline: PipelineId, node: NodeId) -> Self {
        let id = TaskId::for_node(&pipeline, &node);
        Task::CancelNode { id, pipeline, node }
    }

    pub fn id(&self) -> TaskId {
        match self {
            Task::ExecNode { id, .. } => *id,
            Task::CancelNode { id, .. } => *id,
        }
    }

    pub fn node(&self) -> &NodeId {
        match self {
            Task::ExecNode { node, .. } => node,
            Task::CancelNode { node, .. } => node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_is_deterministic() {
        let p = PipelineId::new("pipeline1");
        let n = NodeId::new("Trainer");
        assert_eq!(TaskId::for_node(&p, &n), TaskId::for_node(&p, &n));
    }

    #[test]
    fn test_task_id_differs_by_node() {
        let p = PipelineId::new("pipeline1");
        assert_ne!(
            TaskId::for_node(&p, &NodeId::new("A")),
            TaskId::for_node(&p, &NodeId::new("B"))
        );
    }

    #[test]
    fn test_exec_and_cancel_share_id_for_same_node() {
        let p = PipelineId::new("pipeline1");
        let n = NodeId::new("Trainer");
        let exec = Task::exec_node(p.clone(), n.clone(), false);
        let cancel = Task::cancel_node(p, n);
        assert_eq!(exec.id(), cancel.id());
    }
}
