//! Cloneable front door to a running engine.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::event::{EventKind, EventSender, HoldScope};
use crate::core::state::TaskState;
use crate::core::task::{NewTask, Task, TaskId, TreeId};
use crate::error::Result;
use crate::store::{TaskStore, TreeLimits};

/// Operator and client controls. Every mutation goes through the event
/// queue; reads go straight to the store.
#[derive(Clone)]
pub struct EngineHandle {
    events: EventSender,
    store: Arc<dyn TaskStore>,
    shutdown: CancellationToken,
}

impl EngineHandle {
    pub(crate) fn new(
        events: EventSender,
        store: Arc<dyn TaskStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            events,
            store,
            shutdown,
        }
    }

    /// Queue a new root task (or a child, if `spec.parent_id` is set).
    pub async fn submit(&self, spec: NewTask) -> Result<TaskId> {
        let id = spec.id;
        self.events
            .emit(Some(id), EventKind::TaskCreated { spec })
            .await?;
        Ok(id)
    }

    pub async fn hold(&self, scope: HoldScope) -> Result<()> {
        let target = match scope {
            HoldScope::Task(id) => Some(id),
            _ => None,
        };
        self.events
            .emit(target, EventKind::HoldRequested { scope })
            .await
    }

    /// Release a held task for one more agent turn.
    pub async fn step(&self, task: TaskId) -> Result<()> {
        self.events
            .emit(Some(task), EventKind::StepRequested {})
            .await
    }

    pub async fn cancel(&self, task: TaskId, reason: impl Into<String>) -> Result<()> {
        self.events
            .emit(
                Some(task),
                EventKind::CancelRequested {
                    reason: reason.into(),
                },
            )
            .await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.store.get_task(id).await
    }

    /// Tasks waiting for an operator.
    pub async fn list_held(&self) -> Result<Vec<Task>> {
        self.store.list_by_state(TaskState::ManualHold).await
    }

    pub async fn list_tree(&self, tree: TreeId) -> Result<Vec<Task>> {
        self.store.list_tree(tree).await
    }

    /// Per-tree override of the consecutive-call ceiling.
    pub async fn set_tree_limits(&self, tree: TreeId, limits: TreeLimits) -> Result<()> {
        self.store.set_tree_limits(tree, limits).await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled() || self.events.is_closed()
    }
}
