//! Reasoning-worker boundary.
//!
//! The worker itself is an external collaborator behind [`ReasoningWorker`].
//! The engine never awaits it on the loop: [`spawn_invocation`] runs the call
//! on its own tokio task with a timeout and retry/backoff, then reports back
//! through the event queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::core::event::{EventKind, EventSender, InvocationId, ToolCall};
use crate::core::task::{Message, TaskId};
use crate::error::{Error, ErrorKind, Result, TaskError};
use crate::orchestration::tools::ToolSpec;

/// Everything a worker sees for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub task_id: TaskId,
    pub invocation: InvocationId,
    pub agent: Option<String>,
    pub conversation: Vec<Message>,
    pub context: Vec<String>,
    pub tools: Vec<ToolSpec>,
}

/// A worker's answer: free text plus any tool calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl WorkerReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

#[async_trait]
pub trait ReasoningWorker: Send + Sync {
    async fn invoke(&self, request: WorkerRequest) -> Result<WorkerReply>;
}

/// Worker for runs with no backend attached. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedWorker;

#[async_trait]
impl ReasoningWorker for DetachedWorker {
    async fn invoke(&self, request: WorkerRequest) -> Result<WorkerReply> {
        Err(Error::WorkerInvocationFailed {
            attempts: 0,
            message: format!("no worker attached for task {}", request.task_id),
        })
    }
}

/// Timeout and retry settings for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct InvocationPolicy {
    pub timeout: Duration,
    pub retry: RetryConfig,
}

/// Call the worker, retrying failures and timeouts with backoff.
///
/// Returns the reply and the number of attempts used, or
/// `WorkerInvocationFailed` once `retry.max_attempts` is exhausted.
pub async fn invoke_with_retry(
    worker: &dyn ReasoningWorker,
    request: &WorkerRequest,
    policy: InvocationPolicy,
) -> Result<(WorkerReply, u32)> {
    let max_attempts = policy.retry.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = policy.retry.backoff(attempt - 1);
            debug!(task_id = %request.task_id, attempt, ?delay, "retrying worker call");
            tokio::time::sleep(delay).await;
        }
        match tokio::time::timeout(policy.timeout, worker.invoke(request.clone())).await {
            Ok(Ok(reply)) => return Ok((reply, attempt + 1)),
            Ok(Err(e)) => {
                warn!(task_id = %request.task_id, attempt = attempt + 1, error = %e, "worker call failed");
                last_error = e.to_string();
            }
            Err(_) => {
                warn!(task_id = %request.task_id, attempt = attempt + 1, "worker call timed out");
                last_error = Error::Timeout(policy.timeout).to_string();
            }
        }
    }

    Err(Error::WorkerInvocationFailed {
        attempts: max_attempts,
        message: last_error,
    })
}

/// Run an invocation off the engine loop and report the outcome as a
/// `worker_response` or `worker_failed` event.
pub fn spawn_invocation(
    worker: Arc<dyn ReasoningWorker>,
    request: WorkerRequest,
    policy: InvocationPolicy,
    events: EventSender,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let task_id = request.task_id;
        let invocation = request.invocation;
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(task_id = %task_id, "worker call abandoned at shutdown");
                return;
            }
            outcome = invoke_with_retry(worker.as_ref(), &request, policy) => outcome,
        };

        let kind = match outcome {
            Ok((reply, _)) => EventKind::WorkerResponse {
                invocation,
                text: reply.text,
                tool_calls: reply.tool_calls,
            },
            Err(e) => {
                let attempts = match &e {
                    Error::WorkerInvocationFailed { attempts, .. } => *attempts,
                    _ => 1,
                };
                EventKind::WorkerFailed {
                    invocation,
                    error: TaskError::new(ErrorKind::WorkerInvocationFailed, e.to_string()),
                    attempts,
                }
            }
        };
        if let Err(e) = events.emit(Some(task_id), kind).await {
            debug!(task_id = %task_id, error = %e, "engine gone before worker result");
        }
    })
}
