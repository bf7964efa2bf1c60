//! In-memory view over one pipeline's durable state, loaded from the
//! metadata store and written back via an explicit `commit()`.
//!
//! This replaces a Drop-based scoped-resource idiom (§9 "Scoped resource
//! acquisition"): `Drop` cannot run async code, so release is an explicit
//! step the caller must perform. `Drop` still fires a best-effort warning if
//! a loaded state was mutated but never committed, as a backstop against a
//! missing `commit()` call, not a substitute for one.

use crate::error::{OrchestratorError, Result};
use crate::ids::{NodeId, PipelineId};
use crate::ir::PipelineIR;
use crate::metadata::{
    ExecutionState, MetadataStore, OrchestratorContext, OrchestrationFlags, PipelineExecution,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Loaded, mutable view of one pipeline's context and active execution.
///
/// Mutating methods only update the in-memory copy; nothing is durable
/// until `commit()` is called.
pub struct PipelineState {
    store: Arc<dyn MetadataStore>,
    context: OrchestratorContext,
    execution: PipelineExecution,
    dirty: bool,
    committed: bool,
}

impl PipelineState {
    /// Starts a brand-new pipeline context and execution for `ir`, without
    /// persisting either; call `commit()` to make it durable.
    pub fn new(store: Arc<dyn MetadataStore>, ir: PipelineIR) -> Self {
        let now = Utc::now();
        let execution = PipelineExecution {
            id: Uuid::new_v4(),
            pipeline_id: ir.id.clone(),
            last_known_state: ExecutionState::New,
            pipeline_ir: ir,
            flags: OrchestrationFlags::default(),
            created_at: now,
            updated_at: now,
        };
        let context = OrchestratorContext {
            pipeline_id: execution.pipeline_id.clone(),
            current_execution_id: Some(execution.id),
            created_at: now,
            updated_at: now,
        };
        Self {
            store,
            context,
            execution,
            dirty: true,
            committed: false,
        }
    }

    /// Loads the current context and its active execution for `pipeline_id`.
    /// Returns `NotFound` if no context exists, or if the context's current
    /// execution is missing or no longer active.
    pub async fn load(store: Arc<dyn MetadataStore>, pipeline_id: &PipelineId) -> Result<Self> {
        let context = store
            .get_context(pipeline_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("pipeline {pipeline_id}")))?;
        Self::load_from_context(store, context).await
    }

    /// Loads an execution from an already-fetched context, re-validating
    /// that it still points at an active execution.
    pub async fn load_from_context(
        store: Arc<dyn MetadataStore>,
        context: OrchestratorContext,
    ) -> Result<Self> {
        let execution_id = context.current_execution_id.ok_or_else(|| {
            OrchestratorError::not_found(format!(
                "pipeline {} has no active execution",
                context.pipeline_id
            ))
        })?;
        let execution = store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("execution {execution_id}")))?;

        if !execution.last_known_state.is_active() {
            return Err(OrchestratorError::not_found(format!(
                "pipeline {} has no active execution (latest is {} and terminal)",
                context.pipeline_id, execution.last_known_state
            )));
        }

        Ok(Self {
            store,
            context,
            execution,
            dirty: false,
            committed: false,
        })
    }

    pub fn pipeline_id(&self) -> &PipelineId {
        &self.context.pipeline_id
    }

    pub fn pipeline_ir(&self) -> &PipelineIR {
        &self.execution.pipeline_ir
    }

    pub fn execution(&self) -> &PipelineExecution {
        &self.execution
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.context
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution.id
    }

    /// `true` if the state, as loaded, has an active execution that has not
    /// yet requested a stop.
    pub fn is_stop_initiated(&self) -> bool {
        self.execution.flags.stop_initiated
    }

    pub fn is_node_stop_initiated(&self, node: &NodeId) -> bool {
        self.execution.flags.is_node_stop_initiated(node)
    }

    /// Marks the whole pipeline for stop. Idempotent: calling twice is a
    /// no-op the second time.
    pub fn initiate_stop(&mut self) -> Result<()> {
        if self.execution.flags.stop_initiated {
            return Ok(());
        }
        self.execution.flags.stop_initiated = true;
        self.touch();
        Ok(())
    }

    /// Marks a single node for stop (§4.F "stop a specific node"). Per the
    /// interface contract, an unknown node is `INTERNAL`, not `NOT_FOUND` —
    /// the caller is expected to already know the IR it is operating on.
    pub fn initiate_node_stop(&mut self, node: NodeId) -> Result<()> {
        if !self.execution.pipeline_ir.contains_node(&node) {
            return Err(OrchestratorError::internal(format!(
                "node {node} not declared in pipeline {}",
                self.pipeline_id()
            )));
        }
        self.execution.flags.set_node_stop(node);
        self.touch();
        Ok(())
    }

    /// Clears the per-node stop flag for `node`. Idempotent. This is the
    /// counterpart to `initiate_node_stop`, not a request to create a node
    /// execution — executors create `NodeExecution` rows directly against
    /// the metadata store, never through `PipelineState` (§5).
    pub fn initiate_node_start(&mut self, node: &NodeId) -> Result<()> {
        if !self.execution.flags.is_node_stop_initiated(node) {
            return Ok(());
        }
        self.execution.flags.clear_node_stop(node);
        self.touch();
        Ok(())
    }

    /// Transitions the execution to `RUNNING`. A no-op if it already is.
    pub fn mark_running(&mut self) {
        if self.execution.last_known_state != ExecutionState::Running {
            self.execution.last_known_state = ExecutionState::Running;
            self.touch();
        }
    }

    /// Transitions the execution to a terminal state and clears the
    /// context's pointer to it, so a subsequent `start` can create a fresh
    /// execution.
    pub fn finish(&mut self, state: ExecutionState) -> Result<()> {
        if !state.is_terminal() {
            return Err(OrchestratorError::failed_precondition(format!(
                "{state} is not a terminal state"
            )));
        }
        self.execution.last_known_state = state;
        self.context.current_execution_id = None;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.execution.updated_at = Utc::now();
        self.context.updated_at = Utc::now();
        self.dirty = true;
    }

    /// Persists accumulated mutations. Idempotent; safe to call even if
    /// nothing changed.
    pub async fn commit(mut self) -> Result<()> {
        self.commit_mut().await
    }

    async fn commit_mut(&mut self) -> Result<()> {
        if self.dirty {
            self.store.upsert_execution(&self.execution).await?;
            self.store.upsert_context(&self.context).await?;
            self.dirty = false;
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        if self.dirty && !self.committed {
            tracing::warn!(
                pipeline_id = %self.pipeline_id(),
                "PipelineState dropped with uncommitted mutations; call commit() before dropping"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ExecutionMode, NodeSpec};
    use crate::metadata::InMemoryMetadataStore;

    fn sample_ir() -> PipelineIR {
        PipelineIR::new(
            PipelineId::new("pipeline1"),
            ExecutionMode::Async,
            vec![NodeSpec::new("Trainer", vec![])],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_then_commit_then_load() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let state = PipelineState::new(store.clone(), sample_ir());
        let pipeline_id = state.pipeline_id().clone();
        state.commit().await.unwrap();

        let loaded = PipelineState::load(store, &pipeline_id).await.unwrap();
        assert_eq!(loaded.pipeline_id(), &pipeline_id);
        assert!(!loaded.is_stop_initiated());
    }

    #[tokio::test]
    async fn test_initiate_stop_is_idempotent_and_persists() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let mut state = PipelineState::new(store.clone(), sample_ir());
        let pipeline_id = state.pipeline_id().clone();
        state.initiate_stop().unwrap();
        state.initiate_stop().unwrap();
        state.commit().await.unwrap();

        let loaded = PipelineState::load(store, &pipeline_id).await.unwrap();
        assert!(loaded.is_stop_initiated());
    }

    #[tokio::test]
    async fn test_load_reports_not_found_for_terminal_execution() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let mut state = PipelineState::new(store.clone(), sample_ir());
        let pipeline_id = state.pipeline_id().clone();
        state.finish(ExecutionState::Complete).unwrap();
        state.commit().await.unwrap();

        let result = PipelineState::load(store, &pipeline_id).await;
        assert_eq!(result.unwrap_err().code, crate::error::StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_load_from_context_reports_not_found_when_execution_is_terminal_but_context_stale(
    ) {
        // A context whose `current_execution_id` still points at a now-terminal
        // execution (e.g. completed via a direct executor write rather than
        // through `finish()`, which would have cleared the pointer) must be
        // reported as NOT_FOUND, not FAILED_PRECONDITION, so a reconciliation
        // sweep can skip it rather than abort (§4.F, §4.H.2).
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let state = PipelineState::new(store.clone(), sample_ir());
        let pipeline_id = state.pipeline_id().clone();
        let execution_id = state.execution_id();
        state.commit().await.unwrap();

        let mut execution = store.get_execution(execution_id).await.unwrap().unwrap();
        execution.last_known_state = ExecutionState::Complete;
        store.upsert_execution(&execution).await.unwrap();

        let context = store.get_context(&pipeline_id).await.unwrap().unwrap();
        assert!(context.current_execution_id.is_some());

        let result = PipelineState::load_from_context(store, context).await;
        assert_eq!(result.unwrap_err().code, crate::error::StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_initiate_node_stop_rejects_unknown_node() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let mut state = PipelineState::new(store, sample_ir());
        let result = state.initiate_node_stop(NodeId::new("Ghost"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_node_stop_flag_roundtrips() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let mut state = PipelineState::new(store, sample_ir());
        let node = NodeId::new("Trainer");
        assert!(!state.is_node_stop_initiated(&node));
        state.initiate_node_stop(node.clone()).unwrap();
        assert!(state.is_node_stop_initiated(&node));
        state.initiate_node_start(&node).unwrap();
        assert!(!state.is_node_stop_initiated(&node));
    }

    proptest::proptest! {
        /// For any subset of a pipeline's declared nodes, flagging each for
        /// stop and then clearing it must leave no trace behind, regardless
        /// of the order the nodes were touched in.
        #[test]
        fn test_node_stop_flags_round_trip_for_any_subset(
            flagged in proptest::collection::vec(0usize..5, 0..5),
        ) {
            let ir = PipelineIR::new(
                PipelineId::new("p1"),
                ExecutionMode::Async,
                (0..5)
                    .map(|i| NodeSpec::new(format!("N{i}"), vec![]))
                    .collect(),
            )
            .unwrap();
            let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
            let mut state = PipelineState::new(store, ir);

            let nodes: Vec<NodeId> = flagged.into_iter().map(|i| NodeId::new(format!("N{i}"))).collect();
            for node in &nodes {
                state.initiate_node_stop(node.clone()).unwrap();
            }
            for node in &nodes {
                prop_assert!(state.is_node_stop_initiated(node));
            }
            for node in &nodes {
                state.initiate_node_start(node).unwrap();
            }
            for node in &nodes {
                prop_assert!(!state.is_node_stop_initiated(node));
            }
        }
    }
}
