//! Runtime events and the bounded event queue.
//!
//! Events are the only way state changes propagate through the runtime.
//! External producers (collaborators, spawned worker calls, the deadline
//! ticker) share a cloneable [`EventSender`]; the engine is the single
//! consumer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::task::{NewTask, TaskId, TreeId};
use crate::error::{Error, Result, TaskError};

/// Monotonic event sequence number. Doubles as the logical timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one worker invocation. Equal to the id of the event that fired it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(pub u64);

impl From<EventId> for InvocationId {
    fn from(id: EventId) -> Self {
        Self(id.0)
    }
}

/// A tool call requested by the reasoning worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Scope of a manual hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum HoldScope {
    /// One task.
    Task(TaskId),
    /// Every task in a tree.
    Tree(TreeId),
    /// Every task in the system.
    System,
}

/// Type-specific event payload.
///
/// Serialized adjacently tagged so the log can store `type` and `payload`
/// as separate fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    /// A task should be created and started.
    TaskCreated {
        spec: NewTask,
    },
    /// A task in the agent loop wants its next worker turn.
    AgentTurnRequested {},
    /// A worker call returned.
    WorkerResponse {
        invocation: InvocationId,
        text: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    /// A worker call failed after all retries.
    WorkerFailed {
        invocation: InvocationId,
        error: TaskError,
        attempts: u32,
    },
    /// A task reached Completed.
    TaskCompleted {
        result: Value,
    },
    /// A task reached Failed.
    TaskFailed {
        error: TaskError,
    },
    /// Every blocker of a task is terminal.
    DependenciesResolved {
        /// The blocker whose completion released the task.
        by: TaskId,
    },
    /// A safety limit stopped a task and human input is needed.
    EscalationRequired {
        reason: String,
    },
    /// A process could not be run.
    ProcessMalformed {
        process: String,
        reason: String,
    },
    HoldRequested {
        scope: HoldScope,
    },
    StepRequested {},
    CancelRequested {
        reason: String,
    },
    DeadlineExpired {},
}

impl EventKind {
    /// The snake_case type name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskCreated { .. } => "task_created",
            EventKind::AgentTurnRequested {} => "agent_turn_requested",
            EventKind::WorkerResponse { .. } => "worker_response",
            EventKind::WorkerFailed { .. } => "worker_failed",
            EventKind::TaskCompleted { .. } => "task_completed",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::DependenciesResolved { .. } => "dependencies_resolved",
            EventKind::EscalationRequired { .. } => "escalation_required",
            EventKind::ProcessMalformed { .. } => "process_malformed",
            EventKind::HoldRequested { .. } => "hold_requested",
            EventKind::StepRequested {} => "step_requested",
            EventKind::CancelRequested { .. } => "cancel_requested",
            EventKind::DeadlineExpired {} => "deadline_expired",
        }
    }
}

/// One event on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: EventId,
    /// `None` only for system-scope control events.
    pub task_id: Option<TaskId>,
    pub kind: EventKind,
}

/// Source of event ids, owned by the consumer.
///
/// Ids are assigned when an event is taken for processing, so id order is
/// processing order and matches the event log line order.
#[derive(Debug, Clone, Default)]
pub struct EventIds(Arc<AtomicU64>);

impl EventIds {
    /// Start numbering after `last`.
    pub fn starting_after(last: u64) -> Self {
        Self(Arc::new(AtomicU64::new(last)))
    }

    pub fn next(&self) -> EventId {
        EventId(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Make sure future ids are greater than `seen`.
    pub fn observe(&self, seen: EventId) {
        self.0.fetch_max(seen.0, Ordering::SeqCst);
    }

    /// The last id handed out.
    pub fn last(&self) -> EventId {
        EventId(self.0.load(Ordering::SeqCst))
    }
}

/// An event waiting for an id.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub task_id: Option<TaskId>,
    pub kind: EventKind,
}

impl QueuedEvent {
    pub fn new(task_id: Option<TaskId>, kind: EventKind) -> Self {
        Self { task_id, kind }
    }

    pub fn stamp(self, id: EventId) -> RuntimeEvent {
        RuntimeEvent {
            id,
            task_id: self.task_id,
            kind: self.kind,
        }
    }
}

/// Cloneable producer side of the event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<QueuedEvent>,
}

impl EventSender {
    /// Enqueue an event, waiting for capacity.
    pub async fn emit(&self, task_id: Option<TaskId>, kind: EventKind) -> Result<()> {
        self.tx
            .send(QueuedEvent::new(task_id, kind))
            .await
            .map_err(|_| Error::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the event queue.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::Receiver<QueuedEvent>,
}

impl EventQueue {
    /// Create a bounded queue and its sender.
    pub fn bounded(capacity: usize) -> (EventSender, EventQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventSender { tx }, EventQueue { rx })
    }

    pub async fn recv(&mut self) -> Option<QueuedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<QueuedEvent> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}
