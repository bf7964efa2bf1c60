/*
 * Pipeline Orchestrator
 *
 * Control-plane core for running machine-learning pipelines described as a
 * declarative IR: starting and stopping executions, scheduling node tasks,
 * and tracking durable state through a pluggable metadata store.
 *
 * Architecture:
 * - Pipeline/node state machine (metadata store, SQLite by default)
 * - Task queue port (external collaborator owns the concrete backend)
 * - Per-mode task generation (SYNC finite DAG, SYNC_ASYNC continuous graph)
 * - Process-wide lock serializing mutation of a pipeline's durable state
 */

pub mod config;
pub mod dag;
pub mod error;
pub mod generator;
pub mod ids;
pub mod ir;
pub mod metadata;
pub mod ops;
pub mod pipeline_state;
pub mod queue;
pub mod task;

pub use config::OrchestratorConfig;
pub use dag::NodeGraph;
pub use error::{OrchestratorError, Result, StatusCode};
pub use generator::{AsyncTaskGenerator, SyncTaskGenerator, TaskGenerator};
pub use ids::{NodeId, PipelineId};
pub use ir::{ExecutionMode, NodeSpec, PipelineIR};
pub use metadata::{
    ExecutionState, InMemoryMetadataStore, MetadataStore, NodeExecution, OrchestrationFlags,
    OrchestratorContext, PipelineExecution, SqliteMetadataStore,
};
pub use ops::PipelineOps;
pub use pipeline_state::PipelineState;
pub use queue::{InMemoryTaskQueue, TaskQueue};
pub use task::{Task, TaskId};
