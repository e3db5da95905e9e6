use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::TaskState;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("File watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: TaskState, to: TaskState },

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Unresolved parameter: {path}")]
    UnresolvedParameter { path: String },

    #[error("Process step '{step}' failed: {message}")]
    ProcessExecution { step: String, message: String },

    #[error("Process '{process}' is malformed: {reason}")]
    ProcessMalformed { process: String, reason: String },

    #[error("Safety limit exceeded: {limit}")]
    SafetyLimitExceeded { limit: String },

    #[error("Worker invocation failed after {attempts} attempt(s): {message}")]
    WorkerInvocationFailed { attempts: u32, message: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    TaskExists(TaskId),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Event queue closed")]
    QueueClosed,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.short())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Error categories recorded on tasks and carried in event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IllegalTransition,
    CyclicDependency,
    ProcessExecution,
    ProcessMalformed,
    SafetyLimitExceeded,
    WorkerInvocationFailed,
    Cancelled,
    Timeout,
    /// The agent ended the task with `outcome = "failed"`.
    AgentReported,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::IllegalTransition => "illegal_transition",
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::ProcessExecution => "process_execution",
            ErrorKind::ProcessMalformed => "process_malformed",
            ErrorKind::SafetyLimitExceeded => "safety_limit_exceeded",
            ErrorKind::WorkerInvocationFailed => "worker_invocation_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AgentReported => "agent_reported",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Serializable error payload stored on a task's error field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, reason)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error {
    /// Category used when this error is recorded on a task.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Error::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Error::UnresolvedParameter { .. }
            | Error::ProcessExecution { .. }
            | Error::UnknownFunction(_) => ErrorKind::ProcessExecution,
            Error::ProcessMalformed { .. } | Error::ProcessNotFound(_) => {
                ErrorKind::ProcessMalformed
            }
            Error::SafetyLimitExceeded { .. } => ErrorKind::SafetyLimitExceeded,
            Error::WorkerInvocationFailed { .. } => ErrorKind::WorkerInvocationFailed,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Internal,
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError::new(self.kind(), self.to_string())
    }
}
