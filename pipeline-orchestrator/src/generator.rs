//! Per-mode task generation: decides, given the metadata store's current
//! view of a pipeline's nodes, which tasks (if any) belong on the queue
//! right now.
//!
//! `SYNC` pipelines are a finite DAG driven to completion by dependency
//! order; `SYNC_ASYNC` pipelines are a continuously-running graph where
//! every feasible node is kept alive until stopped.
//!
//! A generator never enqueues anything itself — it only reads, and returns
//! the batch for `PipelineOps` to enqueue in order (§4.G). It also never
//! returns a task whose id the queue already reports present.

use crate::dag::NodeGraph;
use crate::error::Result;
use crate::ids::NodeId;
use crate::ir::PipelineIR;
use crate::metadata::{ExecutionState, MetadataStore, OrchestrationFlags};
use crate::queue::TaskQueue;
use crate::task::Task;
use async_trait::async_trait;
use std::collections::HashSet;

/// Constructed fresh for each reconciliation-tick pass over one pipeline;
/// holds no state of its own between calls.
#[async_trait]
pub trait TaskGenerator: Send + Sync {
    async fn generate(
        &self,
        store: &dyn MetadataStore,
        queue: &dyn TaskQueue,
        ir: &PipelineIR,
        flags: &OrchestrationFlags,
    ) -> Result<Vec<Task>>;
}

async fn latest_state(
    store: &dyn MetadataStore,
    ir: &PipelineIR,
    node: &NodeId,
) -> Result<Option<ExecutionState>> {
    let executions = store.get_node_executions(&ir.id, node).await?;
    Ok(executions
        .into_iter()
        .max_by_key(|e| e.updated_at)
        .map(|e| e.last_known_state))
}

async fn push_if_not_queued(
    queue: &dyn TaskQueue,
    tasks: &mut Vec<Task>,
    task: Task,
) -> Result<()> {
    if !queue.contains_task_id(task.id()).await? {
        tasks.push(task);
    }
    Ok(())
}

/// `SYNC`: dependency-ordered, finite. A node is launched once every
/// dependency has an execution with `last_known_state = COMPLETE`.
/// Terminates by returning no tasks once every node is complete.
#[derive(Default)]
pub struct SyncTaskGenerator;

#[async_trait]
impl TaskGenerator for SyncTaskGenerator {
    async fn generate(
        &self,
        store: &dyn MetadataStore,
        queue: &dyn TaskQueue,
        ir: &PipelineIR,
        flags: &OrchestrationFlags,
    ) -> Result<Vec<Task>> {
        let graph = NodeGraph::from_ir(ir)?;

        let mut completed = HashSet::new();
        for node in ir.node_ids() {
            if latest_state(store, ir, node).await? == Some(ExecutionState::Complete) {
                completed.insert(node.clone());
            }
        }

        let mut tasks = Vec::new();
        for node in graph.eligible_nodes(&completed) {
            let spec = match ir.node(&node) {
                Some(s) => s,
                None => continue,
            };
            if !spec.feasible || flags.stop_initiated || flags.is_node_stop_initiated(&node) {
                continue;
            }
            push_if_not_queued(queue, &mut tasks, Task::exec_node(ir.id.clone(), node, false))
                .await?;
        }

        Ok(tasks)
    }
}

/// `SYNC_ASYNC`: every feasible node not stop-flagged and not currently
/// active is relaunched. This is a simplified stand-in for the spec's
/// input-change-driven eligibility: the data model here carries no node
/// input/checksum concept, so "eligible to fire" is read as "not already
/// running and not asked to stop" (see `DESIGN.md`).
#[derive(Default)]
pub struct AsyncTaskGenerator;

#[async_trait]
impl TaskGenerator for AsyncTaskGenerator {
    async fn generate(
        &self,
        store: &dyn MetadataStore,
        queue: &dyn TaskQueue,
        ir: &PipelineIR,
        flags: &OrchestrationFlags,
    ) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();

        for spec in &ir.nodes {
            if !spec.feasible || flags.is_node_stop_initiated(&spec.id) {
                continue;
            }
            let is_active = matches!(
                latest_state(store, ir, &spec.id).await?,
                Some(s) if s.is_active()
            );
            if is_active {
                continue;
            }
            push_if_not_queued(
                queue,
                &mut tasks,
                Task::exec_node(ir.id.clone(), spec.id.clone(), false),
            )
            .await?;
        }

        Ok(tasks)
    }
}
