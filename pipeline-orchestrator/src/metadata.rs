//! Metadata adapter: durable records and the store trait used to read and
//! write pipelines, executions, and contexts.
//!
//! Two implementations ship: a `sqlx`-backed SQLite store for production use
//! (the same backend family the ambient stack settled on), and an in-memory
//! store, guarded by `parking_lot::Mutex`, for tests — mirroring an
//! interface-first, swappable-backing-store design.

use crate::error::{OrchestratorError, Result};
use crate::ids::{NodeId, PipelineId};
use crate::ir::PipelineIR;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Lifecycle state shared by `PipelineExecution` and `NodeExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    New,
    Running,
    Complete,
    Canceled,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::New => "NEW",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Complete => "COMPLETE",
            ExecutionState::Canceled => "CANCELED",
            ExecutionState::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(ExecutionState::New),
            "RUNNING" => Ok(ExecutionState::Running),
            "COMPLETE" => Ok(ExecutionState::Complete),
            "CANCELED" => Ok(ExecutionState::Canceled),
            "FAILED" => Ok(ExecutionState::Failed),
            _ => Err(OrchestratorError::internal(format!(
                "invalid execution state: {s}"
            ))),
        }
    }

    /// "active" means `NEW` or `RUNNING` (§3).
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionState::New | ExecutionState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Complete | ExecutionState::Canceled | ExecutionState::Failed
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured replacement for the opaque property bag: stop-initiation
/// flags, persisted as a single serialized blob property on the
/// `PipelineExecution` record (§9 "Dynamic state blobs").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationFlags {
    pub stop_initiated: bool,
    pub node_stop_initiated: HashSet<NodeId>,
}

impl OrchestrationFlags {
    pub fn is_node_stop_initiated(&self, node: &NodeId) -> bool {
        self.node_stop_initiated.contains(node)
    }

    pub fn set_node_stop(&mut self, node: NodeId) {
        self.node_stop_initiated.insert(node);
    }

    pub fn clear_node_stop(&mut self, node: &NodeId) {
        self.node_stop_initiated.remove(node);
    }
}

/// Persistent grouping record, one per active pipeline instance, pairing a
/// `PipelineId` with one `PipelineExecution`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorContext {
    pub pipeline_id: PipelineId,
    pub current_execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record for one attempted pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineExecution {
    pub id: Uuid,
    pub pipeline_id: PipelineId,
    pub last_known_state: ExecutionState,
    pub pipeline_ir: PipelineIR,
    pub flags: OrchestrationFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record for each attempted run of a node.
#[derive(Debug, Clone)]
pub struct NodeExecution {
    pub id: Uuid,
    pub pipeline_id: PipelineId,
    pub node_id: NodeId,
    pub last_known_state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn new_active(pipeline_id: PipelineId, node_id: NodeId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            node_id,
            last_known_state: ExecutionState::New,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Read/write pipelines, executions, and contexts (component E).
///
/// Implementations must provide read-your-writes visibility: a `load`
/// immediately following a committed write must observe it.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn list_contexts(&self) -> Result<Vec<OrchestratorContext>>;

    async fn get_context(&self, pipeline_id: &PipelineId) -> Result<Option<OrchestratorContext>>;

    async fn upsert_context(&self, ctx: &OrchestratorContext) -> Result<()>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<PipelineExecution>>;

    /// Latest *active* execution for a pipeline, if one exists.
    async fn get_active_execution(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<Option<PipelineExecution>>;

    async fn upsert_execution(&self, execution: &PipelineExecution) -> Result<()>;

    /// Atomic single-row state transition. Returns `false` (no-op) if the
    /// row's current state did not match `expected`.
    async fn compare_and_set_execution_state(
        &self,
        id: Uuid,
        expected: ExecutionState,
        new_state: ExecutionState,
    ) -> Result<bool>;

    async fn get_node_executions(
        &self,
        pipeline_id: &PipelineId,
        node_id: &NodeId,
    ) -> Result<Vec<NodeExecution>>;

    async fn create_node_execution(&self, execution: &NodeExecution) -> Result<()>;

    async fn update_node_execution_state(&self, id: Uuid, new_state: ExecutionState) -> Result<()>;
}

fn serialize_ir(ir: &PipelineIR) -> Result<Vec<u8>> {
    Ok(bincode::serialize(ir)?)
}

fn deserialize_ir(bytes: &[u8]) -> Result<PipelineIR> {
    Ok(bincode::deserialize(bytes)?)
}

fn serialize_flags(flags: &OrchestrationFlags) -> Result<Vec<u8>> {
    Ok(bincode::serialize(flags)?)
}

fn deserialize_flags(bytes: &[u8]) -> Result<OrchestrationFlags> {
    Ok(bincode::deserialize(bytes)?)
}

/// `sqlx`-backed SQLite implementation of the metadata store.
pub struct SqliteMetadataStore {
    pool: sqlx::SqlitePool,
}

impl SqliteMetadataStore {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = sqlx::SqlitePool::connect(dsn).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn new_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_contexts (
                pipeline_id TEXT PRIMARY KEY,
                current_execution_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_executions (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                last_known_state TEXT NOT NULL,
                pipeline_ir BLOB NOT NULL,
                flags BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_executions (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                last_known_state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<PipelineExecution> {
        use sqlx::Row;
        let id: String = row.try_get("id")?;
        let pipeline_id: String = row.try_get("pipeline_id")?;
        let state: String = row.try_get("last_known_state")?;
        let ir_bytes: Vec<u8> = row.try_get("pipeline_ir")?;
        let flags_bytes: Vec<u8> = row.try_get("flags")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        Ok(PipelineExecution {
            id: Uuid::parse_str(&id)
                .map_err(|e| OrchestratorError::internal(format!("bad execution id: {e}")))?,
            pipeline_id: PipelineId::from(pipeline_id),
            last_known_state: ExecutionState::from_str(&state)?,
            pipeline_ir: deserialize_ir(&ir_bytes)?,
            flags: deserialize_flags(&flags_bytes)?,
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn list_contexts(&self) -> Result<Vec<OrchestratorContext>> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT pipeline_id, current_execution_id, created_at, updated_at FROM orchestrator_contexts")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let pipeline_id: String = row.try_get("pipeline_id")?;
                let current_execution_id: Option<String> = row.try_get("current_execution_id")?;
                Ok(OrchestratorContext {
                    pipeline_id: PipelineId::from(pipeline_id),
                    current_execution_id: current_execution_id
                        .map(|s| {
                            Uuid::parse_str(&s).map_err(|e| {
                                OrchestratorError::internal(format!("bad execution id: {e}"))
                            })
                        })
                        .transpose()?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn get_context(&self, pipeline_id: &PipelineId) -> Result<Option<OrchestratorContext>> {
        use sqlx::Row;
        let row = sqlx::query(
            "SELECT pipeline_id, current_execution_id, created_at, updated_at FROM orchestrator_contexts WHERE pipeline_id = ?",
        )
        .bind(pipeline_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let current_execution_id: Option<String> = row.try_get("current_execution_id")?;
        Ok(Some(OrchestratorContext {
            pipeline_id: pipeline_id.clone(),
            current_execution_id: current_execution_id
                .map(|s| {
                    Uuid::parse_str(&s)
                        .map_err(|e| OrchestratorError::internal(format!("bad execution id: {e}")))
                })
                .transpose()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn upsert_context(&self, ctx: &OrchestratorContext) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_contexts (pipeline_id, current_execution_id, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(pipeline_id) DO UPDATE SET
                current_execution_id = excluded.current_execution_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(ctx.pipeline_id.as_str())
        .bind(ctx.current_execution_id.map(|id| id.to_string()))
        .bind(ctx.created_at)
        .bind(ctx.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<PipelineExecution>> {
        let row = sqlx::query(
            "SELECT id, pipeline_id, last_known_state, pipeline_ir, flags, created_at, updated_at FROM pipeline_executions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn get_active_execution(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<Option<PipelineExecution>> {
        let row = sqlx::query(
            r#"
            SELECT id, pipeline_id, last_known_state, pipeline_ir, flags, created_at, updated_at
            FROM pipeline_executions
            WHERE pipeline_id = ? AND last_known_state IN ('NEW', 'RUNNING')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn upsert_execution(&self, execution: &PipelineExecution) -> Result<()> {
        let ir_bytes = serialize_ir(&execution.pipeline_ir)?;
        let flags_bytes = serialize_flags(&execution.flags)?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_executions
                (id, pipeline_id, last_known_state, pipeline_ir, flags, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_known_state = excluded.last_known_state,
                pipeline_ir = excluded.pipeline_ir,
                flags = excluded.flags,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.pipeline_id.as_str())
        .bind(execution.last_known_state.as_str())
        .bind(ir_bytes)
        .bind(flags_bytes)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_set_execution_state(
        &self,
        id: Uuid,
        expected: ExecutionState,
        new_state: ExecutionState,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pipeline_executions SET last_known_state = ?, updated_at = ? WHERE id = ? AND last_known_state = ?",
        )
        .bind(new_state.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_node_executions(
        &self,
        pipeline_id: &PipelineId,
        node_id: &NodeId,
    ) -> Result<Vec<NodeExecution>> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT id, pipeline_id, node_id, last_known_state, created_at, updated_at FROM node_executions WHERE pipeline_id = ? AND node_id = ?",
        )
        .bind(pipeline_id.as_str())
        .bind(node_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let state: String = row.try_get("last_known_state")?;
                Ok(NodeExecution {
                    id: Uuid::parse_str(&id).map_err(|e| {
                        OrchestratorError::internal(format!("bad node execution id: {e}"))
                    })?,
                    pipeline_id: pipeline_id.clone(),
                    node_id: node_id.clone(),
                    last_known_state: ExecutionState::from_str(&state)?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn create_node_execution(&self, execution: &NodeExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_executions (id, pipeline_id, node_id, last_known_state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.pipeline_id.as_str())
        .bind(execution.node_id.as_str())
        .bind(execution.last_known_state.as_str())
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_node_execution_state(&self, id: Uuid, new_state: ExecutionState) -> Result<()> {
        sqlx::query("UPDATE node_executions SET last_known_state = ?, updated_at = ? WHERE id = ?")
            .bind(new_state.as_str())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory reference implementation used by unit and scenario tests.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    contexts: parking_lot::Mutex<HashMap<PipelineId, OrchestratorContext>>,
    executions: parking_lot::Mutex<HashMap<Uuid, PipelineExecution>>,
    node_executions: parking_lot::Mutex<HashMap<Uuid, NodeExecution>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn list_contexts(&self) -> Result<Vec<OrchestratorContext>> {
        Ok(self.contexts.lock().values().cloned().collect())
    }

    async fn get_context(&self, pipeline_id: &PipelineId) -> Result<Option<OrchestratorContext>> {
        Ok(self.contexts.lock().get(pipeline_id).cloned())
    }

    async fn upsert_context(&self, ctx: &OrchestratorContext) -> Result<()> {
        self.contexts
            .lock()
            .insert(ctx.pipeline_id.clone(), ctx.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<PipelineExecution>> {
        Ok(self.executions.lock().get(&id).cloned())
    }

    async fn get_active_execution(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<Option<PipelineExecution>> {
        Ok(self
            .executions
            .lock()
            .values()
            .filter(|e| &e.pipeline_id == pipeline_id && e.last_known_state.is_active())
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn upsert_execution(&self, execution: &PipelineExecution) -> Result<()> {
        self.executions
            .lock()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn compare_and_set_execution_state(
        &self,
        id: Uuid,
        expected: ExecutionState,
        new_state: ExecutionState,
    ) -> Result<bool> {
        let mut executions = self.executions.lock();
        match executions.get_mut(&id) {
            Some(execution) if execution.last_known_state == expected => {
                execution.last_known_state = new_state;
                execution.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_node_executions(
        &self,
        pipeline_id: &PipelineId,
        node_id: &NodeId,
    ) -> Result<Vec<NodeExecution>> {
        Ok(self
            .node_executions
            .lock()
            .values()
            .filter(|n| &n.pipeline_id == pipeline_id && &n.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn create_node_execution(&self, execution: &NodeExecution) -> Result<()> {
        self.node_executions
            .lock()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_node_execution_state(&self, id: Uuid, new_state: ExecutionState) -> Result<()> {
        let mut node_executions = self.node_executions.lock();
        let execution = node_executions
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::not_found(format!("node execution {id}")))?;
        execution.last_known_state = new_state;
        execution.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ExecutionMode, NodeSpec};

    fn sample_ir() -> PipelineIR {
        PipelineIR::new(
            PipelineId::new("pipeline1"),
            ExecutionMode::Async,
            vec![NodeSpec::new("Trainer", vec![])],
        )
        .unwrap()
    }

    fn sample_execution() -> PipelineExecution {
        let now = Utc::now();
        PipelineExecution {
            id: Uuid::new_v4(),
            pipeline_id: PipelineId::new("pipeline1"),
            last_known_state: ExecutionState::New,
            pipeline_ir: sample_ir(),
            flags: OrchestrationFlags::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrips_execution() {
        let store = InMemoryMetadataStore::new();
        let execution = sample_execution();
        store.upsert_execution(&execution).await.unwrap();

        let loaded = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.pipeline_id, execution.pipeline_id);
        assert_eq!(loaded.pipeline_ir, execution.pipeline_ir);
    }

    #[tokio::test]
    async fn test_get_active_execution_ignores_terminal() {
        let store = InMemoryMetadataStore::new();
        let mut execution = sample_execution();
        execution.last_known_state = ExecutionState::Complete;
        store.upsert_execution(&execution).await.unwrap();

        assert!(store
            .get_active_execution(&execution.pipeline_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_execution_state() {
        let store = InMemoryMetadataStore::new();
        let execution = sample_execution();
        store.upsert_execution(&execution).await.unwrap();

        let ok = store
            .compare_and_set_execution_state(execution.id, ExecutionState::New, ExecutionState::Running)
            .await
            .unwrap();
        assert!(ok);

        let stale = store
            .compare_and_set_execution_state(execution.id, ExecutionState::New, ExecutionState::Running)
            .await
            .unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn test_sqlite_store_roundtrips_execution() {
        let store = SqliteMetadataStore::new_in_memory().await.unwrap();
        let execution = sample_execution();
        store.upsert_execution(&execution).await.unwrap();

        let loaded = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.pipeline_id, execution.pipeline_id);
        assert_eq!(loaded.pipeline_ir, execution.pipeline_ir);
        assert_eq!(loaded.last_known_state, ExecutionState::New);
    }

    #[tokio::test]
    async fn test_sqlite_store_compare_and_set() {
        let store = SqliteMetadataStore::new_in_memory().await.unwrap();
        let execution = sample_execution();
        store.upsert_execution(&execution).await.unwrap();

        let ok = store
            .compare_and_set_execution_state(execution.id, ExecutionState::New, ExecutionState::Running)
            .await
            .unwrap();
        assert!(ok);

        let loaded = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_known_state, ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_sqlite_store_node_executions() {
        let store = SqliteMetadataStore::new_in_memory().await.unwrap();
        let node_execution =
            NodeExecution::new_active(PipelineId::new("pipeline1"), NodeId::new("Trainer"));
        store.create_node_execution(&node_execution).await.unwrap();

        let loaded = store
            .get_node_executions(&PipelineId::new("pipeline1"), &NodeId::new("Trainer"))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].last_known_state.is_active());

        store
            .update_node_execution_state(node_execution.id, ExecutionState::Complete)
            .await
            .unwrap();
        let loaded = store
            .get_node_executions(&PipelineId::new("pipeline1"), &NodeId::new("Trainer"))
            .await
            .unwrap();
        assert!(loaded[0].last_known_state.is_terminal());
    }
}
