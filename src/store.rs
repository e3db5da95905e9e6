//! Task store collaborator.
//!
//! The runtime never holds task records itself; it reads and mutates them
//! through [`TaskStore`]. `InMemoryTaskStore` is the reference
//! implementation used by the engine, replay and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::core::event::EventId;
use crate::core::state::{self, Applied, Outcome, TaskState};
use crate::core::task::{Task, TaskId, TaskUpdate, TreeId};
use crate::error::{Error, Result};

/// Per-tree overrides of the configured safety limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLimits {
    pub max_consecutive_calls: Option<u32>,
}

/// Storage for task records and tree metadata.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task record.
    async fn create_task(&self, task: Task) -> Result<()>;

    /// Get a task by ID
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Apply a validated state transition and return what happened.
    async fn apply_transition(
        &self,
        id: TaskId,
        event: EventId,
        to: TaskState,
        outcome: Outcome,
    ) -> Result<Applied>;

    /// Apply a non-transition field update and return the updated record.
    async fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<Task>;

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>>;

    async fn list_tree(&self, tree: TreeId) -> Result<Vec<Task>>;

    async fn list_all(&self) -> Result<Vec<Task>>;

    async fn tree_limits(&self, tree: TreeId) -> Result<Option<TreeLimits>>;

    async fn set_tree_limits(&self, tree: TreeId, limits: TreeLimits) -> Result<()>;
}

/// In-memory store ordered by task id, so listings and snapshots are
/// deterministic.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
    limits: RwLock<HashMap<TreeId, TreeLimits>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize every task record, ordered by id.
    pub async fn snapshot(&self) -> Result<String> {
        let tasks = self.tasks.read().await;
        let records: Vec<&Task> = tasks.values().collect();
        Ok(serde_json::to_string_pretty(&records)?)
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(Error::TaskExists(task.id));
        }
        tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn apply_transition(
        &self,
        id: TaskId,
        event: EventId,
        to: TaskState,
        outcome: Outcome,
    ) -> Result<Applied> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        state::apply(task, event, to, outcome)
    }

    async fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        update.apply_to(task);
        Ok(task.clone())
    }

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect())
    }

    async fn list_tree(&self, tree: TreeId) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.tree_id == tree)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn tree_limits(&self, tree: TreeId) -> Result<Option<TreeLimits>> {
        Ok(self.limits.read().await.get(&tree).copied())
    }

    async fn set_tree_limits(&self, tree: TreeId, limits: TreeLimits) -> Result<()> {
        self.limits.write().await.insert(tree, limits);
        Ok(())
    }
}
