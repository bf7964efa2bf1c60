//! The orchestration core's public surface: starting, stopping, and ticking
//! pipelines and nodes.
//!
//! Every public method acquires `lock` exactly once, near the top of the
//! method, and never again while it holds the guard — inner helpers accept
//! `&self` and read/write through `store`/`queue` directly rather than
//! re-locking. This keeps the "global, process-wide" lock from spec real
//! while staying sound under async: nothing holds a guard across a helper
//! that itself tries to acquire it (§5 "global re-entrant lock").
//!
//! A long-running wait (`stop_pipeline`, `stop_node`) only holds the lock
//! for each individual poll, not for the whole wait, so a concurrent
//! `generate_tasks` tick is never blocked behind someone else's timeout.

use crate::config::OrchestratorConfig;
use crate::dag::NodeGraph;
use crate::error::{OrchestratorError, Result};
use crate::generator::{AsyncTaskGenerator, SyncTaskGenerator, TaskGenerator};
use crate::ids::{NodeId, PipelineId};
use crate::ir::{ExecutionMode, PipelineIR};
use crate::metadata::{ExecutionState, MetadataStore};
use crate::pipeline_state::PipelineState;
use crate::queue::TaskQueue;
use crate::task::{Task, TaskId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Owns the metadata store, task queue, and process-wide lock that every
/// public operation in this crate funnels through.
pub struct PipelineOps {
    store: Arc<dyn MetadataStore>,
    queue: Arc<dyn TaskQueue>,
    config: OrchestratorConfig,
    lock: tokio::sync::Mutex<()>,
}

impl PipelineOps {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        queue: Arc<dyn TaskQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Starts a new execution for `ir`. `AlreadyExists` if the pipeline
    /// already has an active execution (§4.A).
    pub async fn initiate_pipeline_start(&self, ir: PipelineIR) -> Result<Uuid> {
        let _guard = self.lock.lock().await;

        if self.store.get_active_execution(&ir.id).await?.is_some() {
            return Err(OrchestratorError::already_exists(format!(
                "pipeline {} already has an active execution",
                ir.id
            )));
        }

        let mut state = PipelineState::new(self.store.clone(), ir);
        state.mark_running();
        let id = state.execution_id();
        state.commit().await?;

        tracing::info!(pipeline_execution_id = %id, "pipeline execution started");
        Ok(id)
    }

    /// Flags the whole pipeline for stop and waits for a concurrently
    /// running `generate_tasks` tick to actually drive cancellation and the
    /// terminal-state transition. This method never performs that
    /// transition itself (§4.H.2): convergence is the tick's job, this call
    /// only requests it and observes the result.
    pub async fn stop_pipeline(&self, pipeline_id: &PipelineId) -> Result<()> {
        {
            let _guard = self.lock.lock().await;
            let mut state = PipelineState::load(self.store.clone(), pipeline_id).await?;
            state.initiate_stop()?;
            state.commit().await?;
        }

        self.wait_until(pipeline_id, || async {
            Ok(self.store.get_active_execution(pipeline_id).await?.is_none())
        })
        .await?;

        tracing::info!(%pipeline_id, "pipeline execution stop converged");
        Ok(())
    }

    /// Flags a single node for stop (§4.F) and waits for it to go inactive.
    /// If the node has no active execution at all, returns immediately. If
    /// it has more than one, that is an inconsistency this method refuses to
    /// guess at.
    pub async fn stop_node(&self, pipeline_id: &PipelineId, node_id: &NodeId) -> Result<()> {
        let target_execution_id = {
            let _guard = self.lock.lock().await;
            let mut state = PipelineState::load(self.store.clone(), pipeline_id).await?;
            state.initiate_node_stop(node_id.clone())?;
            state.commit().await?;

            let active = self.active_node_executions(pipeline_id, node_id).await?;
            match active.len() {
                0 => return Ok(()),
                1 => active[0],
                _ => {
                    return Err(OrchestratorError::internal(format!(
                        "node {node_id} in pipeline {pipeline_id} has more than one active execution"
                    )))
                }
            }
        };

        self.wait_until(pipeline_id, || async {
            let executions = self.store.get_node_executions(pipeline_id, node_id).await?;
            Ok(executions
                .into_iter()
                .find(|e| e.id == target_execution_id)
                .map(|e| !e.last_known_state.is_active())
                .unwrap_or(true))
        })
        .await?;

        tracing::info!(%pipeline_id, %node_id, "node stopped");
        Ok(())
    }

    /// Clears a single node's stop flag so it becomes launchable again.
    /// `NodeExecution` creation happens in the executor, directly against
    /// the metadata store, never through this method (§5).
    pub async fn initiate_node_start(&self, pipeline_id: &PipelineId, node_id: &NodeId) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = PipelineState::load(self.store.clone(), pipeline_id).await?;

        if !state.pipeline_ir().contains_node(node_id) {
            return Err(OrchestratorError::not_found(format!(
                "node {node_id} not declared in pipeline {pipeline_id}"
            )));
        }

        state.initiate_node_start(node_id)?;
        state.commit().await?;
        Ok(())
    }

    /// One reconciliation tick over every pipeline the metadata store knows
    /// about (§4.H.2): stop-initiated pipelines get cancellation propagated
    /// and, once fully inactive, are marked `CANCELED`; active pipelines get
    /// their `NEW -> RUNNING` transition, per-node cancellations, and a
    /// fresh batch of tasks from that mode's generator.
    pub async fn generate_tasks(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let contexts = self.store.list_contexts().await?;

        for context in contexts {
            let state = match PipelineState::load_from_context(self.store.clone(), context).await {
                Ok(state) => state,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            if state.is_stop_initiated() {
                self.process_stop_initiated(state).await?;
            } else {
                self.process_active(state).await?;
            }
        }

        Ok(())
    }

    async fn process_stop_initiated(&self, state: PipelineState) -> Result<()> {
        let ir = state.pipeline_ir().clone();
        for node in ir.node_ids() {
            self.maybe_enqueue_cancellation_task(&ir, node).await?;
        }

        if self.all_nodes_inactive(&ir).await? {
            let pipeline_id = state.pipeline_id().clone();
            let mut state = state;
            state.finish(ExecutionState::Canceled)?;
            state.commit().await?;
            tracing::info!(%pipeline_id, "pipeline execution canceled");
        }

        Ok(())
    }

    async fn process_active(&self, mut state: PipelineState) -> Result<()> {
        state.mark_running();
        let ir = state.pipeline_ir().clone();
        let flags = state.execution().flags.clone();

        for node in ir.node_ids() {
            if flags.is_node_stop_initiated(node) {
                self.maybe_enqueue_cancellation_task(&ir, node).await?;
            }
        }

        let generator: Box<dyn TaskGenerator> = match ir.mode {
            ExecutionMode::Sync => Box::new(SyncTaskGenerator::default()),
            ExecutionMode::Async => Box::new(AsyncTaskGenerator::default()),
        };
        let tasks = generator
            .generate(self.store.as_ref(), self.queue.as_ref(), &ir, &flags)
            .await?;
        for task in tasks {
            self.queue.enqueue(task).await?;
        }

        if ir.mode == ExecutionMode::Sync {
            let graph = NodeGraph::from_ir(&ir)?;
            let mut completed = HashSet::new();
            for node in ir.node_ids() {
                if self.latest_node_state(&ir.id, node).await? == Some(ExecutionState::Complete) {
                    completed.insert(node.clone());
                }
            }
            if graph.is_complete(&completed) {
                let pipeline_id = state.pipeline_id().clone();
                state.finish(ExecutionState::Complete)?;
                tracing::info!(%pipeline_id, "SYNC pipeline reached completion");
            }
        }

        state.commit().await?;
        Ok(())
    }

    /// Restart-resilient cancellation of one node (§4.H.3). If the node's
    /// `ExecNodeTask` id is still present on the queue, enqueues a
    /// `CancelNodeTask` for it. Otherwise — the queue may have lost that
    /// state across a restart — falls back to the metadata store: if
    /// exactly one `NodeExecution` is active, enqueues a synthetic
    /// `ExecNodeTask{is_cancelled: true}` so the executor can still
    /// recognize and finalize it. Returns `true` if either path found live
    /// work to cancel.
    pub async fn maybe_enqueue_cancellation_task(
        &self,
        pipeline: &PipelineIR,
        node_id: &NodeId,
    ) -> Result<bool> {
        let feasible = pipeline.node(node_id).map(|n| n.feasible).unwrap_or(false);
        if !feasible {
            return Ok(false);
        }

        let exec_task_id = TaskId::for_node(&pipeline.id, node_id);
        if self.queue.contains_task_id(exec_task_id).await? {
            self.queue
                .enqueue(Task::cancel_node(pipeline.id.clone(), node_id.clone()))
                .await?;
            return Ok(true);
        }

        let active = self.active_node_executions(&pipeline.id, node_id).await?;
        match active.len() {
            0 => Ok(false),
            1 => {
                self.queue
                    .enqueue(Task::exec_node(pipeline.id.clone(), node_id.clone(), true))
                    .await?;
                Ok(true)
            }
            _ => Err(OrchestratorError::internal(format!(
                "node {node_id} in pipeline {} has more than one active execution",
                pipeline.id
            ))),
        }
    }

    async fn active_node_executions(
        &self,
        pipeline_id: &PipelineId,
        node_id: &NodeId,
    ) -> Result<Vec<Uuid>> {
        let executions = self.store.get_node_executions(pipeline_id, node_id).await?;
        Ok(executions
            .into_iter()
            .filter(|e| e.last_known_state.is_active())
            .map(|e| e.id)
            .collect())
    }

    async fn latest_node_state(
        &self,
        pipeline_id: &PipelineId,
        node: &NodeId,
    ) -> Result<Option<ExecutionState>> {
        let executions = self.store.get_node_executions(pipeline_id, node).await?;
        Ok(executions
            .into_iter()
            .max_by_key(|e| e.updated_at)
            .map(|e| e.last_known_state))
    }

    async fn node_inactive(&self, pipeline_id: &PipelineId, node_id: &NodeId) -> Result<bool> {
        let executions = self.store.get_node_executions(pipeline_id, node_id).await?;
        Ok(!executions.iter().any(|e| e.last_known_state.is_active()))
    }

    async fn all_nodes_inactive(&self, ir: &PipelineIR) -> Result<bool> {
        for node in ir.node_ids() {
            if !self.node_inactive(&ir.id, node).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Polls `condition` (each call holding the lock only for its own
    /// duration) until it returns `true` or `stop_wait_timeout` elapses.
    async fn wait_until<F, Fut>(&self, pipeline_id: &PipelineId, mut condition: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let deadline = Instant::now() + self.config.stop_wait_timeout;
        let interval = self.config.effective_poll_interval();

        loop {
            {
                let _guard = self.lock.lock().await;
                if condition().await? {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::deadline_exceeded(format!(
                    "pipeline {pipeline_id} did not inactivate within {:?}",
                    self.config.stop_wait_timeout
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NodeSpec;
    use crate::metadata::{InMemoryMetadataStore, NodeExecution};
    use crate::queue::InMemoryTaskQueue;
    use std::time::Duration;

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            stop_wait_timeout: Duration::from_millis(200),
            stop_poll_interval: Duration::from_millis(20),
            metadata_dsn: "sqlite::memory:".to_string(),
        }
    }

    fn make_ops() -> (PipelineOps, Arc<InMemoryMetadataStore>, Arc<InMemoryTaskQueue>) {
        let store = Arc::new(InMemoryMetadataStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let ops = PipelineOps::new(store.clone(), queue.clone(), fast_config());
        (ops, store, queue)
    }

    fn linear_ir() -> PipelineIR {
        PipelineIR::new(
            PipelineId::new("p1"),
            ExecutionMode::Sync,
            vec![
                NodeSpec::new("A", vec![]),
                NodeSpec::new("B", vec![NodeId::new("A")]),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_rejects_duplicate_active_execution() {
        let (ops, _store, _queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();
        let result = ops.initiate_pipeline_start(linear_ir()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_generate_tasks_only_launches_eligible_nodes() {
        let (ops, _store, queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();

        ops.generate_tasks().await.unwrap();
        assert_eq!(queue.len(), 1);
        let tasks = queue.drain();
        assert_eq!(tasks[0].node(), &NodeId::new("A"));
    }

    #[tokio::test]
    async fn test_generate_tasks_does_not_duplicate_enqueued_task() {
        let (ops, _store, queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();

        ops.generate_tasks().await.unwrap();
        ops.generate_tasks().await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_generate_tasks_sweeps_every_pipeline() {
        let (ops, _store, queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();
        ops.initiate_pipeline_start(PipelineIR::new(
            PipelineId::new("p2"),
            ExecutionMode::Sync,
            vec![NodeSpec::new("A", vec![])],
        ).unwrap())
        .await
        .unwrap();

        ops.generate_tasks().await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_pipeline_converges_once_tick_marks_it_canceled() {
        let (ops, _store, _queue) = make_ops();
        let pipeline_id = PipelineId::new("p1");
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();

        let ops = Arc::new(ops);
        let ticker_ops = ops.clone();
        let ticker = tokio::spawn(async move {
            loop {
                let _ = ticker_ops.generate_tasks().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        ops.stop_pipeline(&pipeline_id).await.unwrap();
        ticker.abort();
    }

    #[tokio::test]
    async fn test_stop_pipeline_times_out_when_node_stays_active() {
        let (ops, store, _queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();
        let node_execution = NodeExecution::new_active(PipelineId::new("p1"), NodeId::new("A"));
        store.create_node_execution(&node_execution).await.unwrap();

        let result = ops.stop_pipeline(&PipelineId::new("p1")).await;
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().code,
            crate::error::StatusCode::DeadlineExceeded
        );
    }

    #[tokio::test]
    async fn test_stop_node_returns_immediately_when_no_active_execution() {
        let (ops, _store, _queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();

        ops.stop_node(&PipelineId::new("p1"), &NodeId::new("A"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_node_errors_on_more_than_one_active_execution() {
        let (ops, store, _queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();
        store
            .create_node_execution(&NodeExecution::new_active(
                PipelineId::new("p1"),
                NodeId::new("A"),
            ))
            .await
            .unwrap();
        store
            .create_node_execution(&NodeExecution::new_active(
                PipelineId::new("p1"),
                NodeId::new("A"),
            ))
            .await
            .unwrap();

        let result = ops.stop_node(&PipelineId::new("p1"), &NodeId::new("A")).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, crate::error::StatusCode::Internal);
    }

    #[tokio::test]
    async fn test_maybe_enqueue_cancellation_task_noop_when_inactive() {
        let (ops, _store, queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();
        let ir = linear_ir();

        let enqueued = ops
            .maybe_enqueue_cancellation_task(&ir, &NodeId::new("A"))
            .await
            .unwrap();
        assert!(!enqueued);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_maybe_enqueue_cancellation_task_cancels_queued_exec_task() {
        let (ops, _store, queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();
        let ir = linear_ir();
        queue
            .enqueue(Task::exec_node(ir.id.clone(), NodeId::new("A"), false))
            .await
            .unwrap();

        let enqueued = ops
            .maybe_enqueue_cancellation_task(&ir, &NodeId::new("A"))
            .await
            .unwrap();
        assert!(enqueued);
        let tasks = queue.drain();
        assert!(matches!(tasks.as_slice(), [_, Task::CancelNode { .. }]));
    }

    #[tokio::test]
    async fn test_maybe_enqueue_cancellation_task_falls_back_to_synthetic_task_after_restart() {
        let (ops, store, queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();
        let ir = linear_ir();
        // Simulate a restart: the task queue lost its state, but the
        // metadata store still shows the node actively running.
        store
            .create_node_execution(&NodeExecution::new_active(
                PipelineId::new("p1"),
                NodeId::new("A"),
            ))
            .await
            .unwrap();

        let enqueued = ops
            .maybe_enqueue_cancellation_task(&ir, &NodeId::new("A"))
            .await
            .unwrap();
        assert!(enqueued);
        let tasks = queue.drain();
        assert!(matches!(
            tasks.as_slice(),
            [Task::ExecNode {
                is_cancelled: true,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_initiate_node_start_rejects_unknown_node() {
        let (ops, _store, _queue) = make_ops();
        ops.initiate_pipeline_start(linear_ir()).await.unwrap();

        let result = ops
            .initiate_node_start(&PipelineId::new("p1"), &NodeId::new("Ghost"))
            .await;
        assert!(result.is_err());
    }
}
