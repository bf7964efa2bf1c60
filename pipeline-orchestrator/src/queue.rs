//! Task queue port.
//!
//! The concrete production queue (Kafka/SQS/etc.) is an external
//! collaborator; this crate only depends on the trait contract below, plus
//! an in-memory reference implementation used by tests.

use crate::error::Result;
use crate::task::{Task, TaskId};
use async_trait::async_trait;

/// FIFO of tasks keyed by task id, with at-least-once delivery: the queue
/// holds tasks until an executor acknowledges them.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<()>;

    async fn contains_task_id(&self, id: TaskId) -> Result<bool>;
}

/// Reference in-memory queue used by tests and by hosts that haven't wired
/// a real backend yet.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    tasks: parking_lot::Mutex<Vec<Task>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Task> {
        std::mem::take(&mut self.tasks.lock())
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn contains_task_id(&self, id: TaskId) -> Result<bool> {
        Ok(self.tasks.lock().iter().any(|t| t.id() == id))
    }
}
