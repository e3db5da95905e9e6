//! Task lifecycle states and transition validation.
//!
//! Every state change in the runtime goes through [`apply`], which checks the
//! transition table, enforces result/error exclusivity on terminal states and
//! makes re-application of an already-seen event a no-op.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::event::EventId;
use crate::core::task::{Task, TransitionRecord};
use crate::error::{Error, Result, TaskError};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    ProcessAssigned,
    ReadyForAgent,
    WaitingOnDependencies,
    AgentResponding,
    ToolProcessing,
    Completed,
    Failed,
    ManualHold,
}

impl TaskState {
    pub const ALL: [TaskState; 9] = [
        TaskState::Created,
        TaskState::ProcessAssigned,
        TaskState::ReadyForAgent,
        TaskState::WaitingOnDependencies,
        TaskState::AgentResponding,
        TaskState::ToolProcessing,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::ManualHold,
    ];

    /// Completed and Failed are terminal; nothing leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::ProcessAssigned => "process_assigned",
            TaskState::ReadyForAgent => "ready_for_agent",
            TaskState::WaitingOnDependencies => "waiting_on_dependencies",
            TaskState::AgentResponding => "agent_responding",
            TaskState::ToolProcessing => "tool_processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::ManualHold => "manual_hold",
        };
        write!(f, "{}", s)
    }
}

/// Check whether `from -> to` is a legal edge.
///
/// Agent loop:
/// - Created -> ProcessAssigned
/// - ProcessAssigned -> ReadyForAgent
/// - ReadyForAgent -> AgentResponding | ManualHold
/// - AgentResponding -> ToolProcessing | Completed | Failed
/// - ToolProcessing -> WaitingOnDependencies | ReadyForAgent
/// - WaitingOnDependencies -> ReadyForAgent
/// - ManualHold -> ReadyForAgent
///
/// Process phase:
/// - ProcessAssigned -> WaitingOnDependencies | Completed
/// - WaitingOnDependencies -> ProcessAssigned
/// - ToolProcessing -> ProcessAssigned
///
/// Any non-terminal state may move to Failed.
pub fn can_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    if to == Failed {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Created, ProcessAssigned)
            | (ProcessAssigned, ReadyForAgent)
            | (ReadyForAgent, AgentResponding)
            | (ReadyForAgent, ManualHold)
            | (AgentResponding, ToolProcessing)
            | (AgentResponding, Completed)
            | (ToolProcessing, WaitingOnDependencies)
            | (ToolProcessing, ReadyForAgent)
            | (WaitingOnDependencies, ReadyForAgent)
            | (ManualHold, ReadyForAgent)
            | (ProcessAssigned, WaitingOnDependencies)
            | (ProcessAssigned, Completed)
            | (WaitingOnDependencies, ProcessAssigned)
            | (ToolProcessing, ProcessAssigned)
    )
}

/// Validate a transition, naming both states on failure.
pub fn validate(from: TaskState, to: TaskState) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::IllegalTransition { from, to })
    }
}

/// Payload accompanying a transition into a terminal state.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Outcome {
    #[default]
    None,
    Result(Value),
    Error(TaskError),
}

/// What [`apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Transitioned { from: TaskState, to: TaskState },
    /// The event was already applied; the task is unchanged.
    Duplicate,
}

/// Apply a transition caused by `event` to `task`.
///
/// One event may drive several consecutive transitions of the same task, so
/// a duplicate is either an event older than the last one applied or an
/// `(event, to)` pair already present in the history.
pub fn apply(task: &mut Task, event: EventId, to: TaskState, outcome: Outcome) -> Result<Applied> {
    let stale = task.last_event.map(|last| event < last).unwrap_or(false);
    let repeated = task
        .history
        .iter()
        .any(|rec| rec.event == event && rec.to == to);
    if stale || repeated {
        return Ok(Applied::Duplicate);
    }

    let from = task.state;
    validate(from, to)?;

    match (to, outcome) {
        (TaskState::Completed, Outcome::Result(value)) => {
            task.result = Some(value);
            task.error = None;
        }
        (TaskState::Completed, _) => {
            task.result = Some(Value::Null);
            task.error = None;
        }
        (TaskState::Failed, Outcome::Error(err)) => {
            task.result = None;
            task.error = Some(err);
        }
        (TaskState::Failed, _) => {
            return Err(Error::Validation(format!(
                "task {} cannot fail without an error",
                task.id.short()
            )));
        }
        _ => {}
    }

    task.state = to;
    task.history.push(TransitionRecord { event, from, to });
    task.last_event = Some(event);
    Ok(Applied::Transitioned { from, to })
}
