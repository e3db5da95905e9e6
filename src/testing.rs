//! Test doubles for the reasoning worker.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::core::event::ToolCall;
use crate::error::{Error, Result};
use crate::orchestration::worker::{ReasoningWorker, WorkerReply, WorkerRequest};

/// One scripted answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Reply(WorkerReply),
    Fail(String),
}

impl From<WorkerReply> for ScriptStep {
    fn from(reply: WorkerReply) -> Self {
        ScriptStep::Reply(reply)
    }
}

/// Replays canned replies.
///
/// Scripts registered with [`ScriptedWorker::on`] apply to tasks whose
/// instruction contains the given text; other requests take from the
/// shared script, then from the default reply.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    scripts: Mutex<Vec<(String, VecDeque<ScriptStep>)>>,
    shared: Mutex<VecDeque<ScriptStep>>,
    default_reply: Option<WorkerReply>,
    requests: Mutex<Vec<WorkerRequest>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply that calls `end_task` with `result`.
    pub fn finish(result: Value) -> WorkerReply {
        WorkerReply::text("done").with_call(ToolCall::new(
            "end_task",
            serde_json::json!({ "result": result }),
        ))
    }

    /// Script replies for tasks whose instruction contains `matcher`.
    pub fn on<I, S>(self, matcher: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ScriptStep>,
    {
        self.lock_scripts()
            .push((matcher.into(), steps.into_iter().map(Into::into).collect()));
        self
    }

    /// Append to the shared script.
    pub fn then(self, step: impl Into<ScriptStep>) -> Self {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step.into());
        self
    }

    /// Reply used once every script is exhausted.
    pub fn with_default(mut self, reply: WorkerReply) -> Self {
        self.default_reply = Some(reply);
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn invocations(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, Vec<(String, VecDeque<ScriptStep>)>> {
        self.scripts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_step(&self, instruction: &str) -> Option<ScriptStep> {
        let mut scripts = self.lock_scripts();
        for (matcher, steps) in scripts.iter_mut() {
            if instruction.contains(matcher.as_str()) {
                if let Some(step) = steps.pop_front() {
                    return Some(step);
                }
            }
        }
        drop(scripts);
        if let Some(step) = self
            .shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Some(step);
        }
        self.default_reply.clone().map(ScriptStep::Reply)
    }
}

#[async_trait]
impl ReasoningWorker for ScriptedWorker {
    async fn invoke(&self, request: WorkerRequest) -> Result<WorkerReply> {
        let instruction = request
            .conversation
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        match self.next_step(&instruction) {
            Some(ScriptStep::Reply(reply)) => Ok(reply),
            Some(ScriptStep::Fail(message)) => Err(Error::Validation(message)),
            None => Err(Error::Validation(format!(
                "no scripted reply for '{}'",
                instruction
            ))),
        }
    }
}
