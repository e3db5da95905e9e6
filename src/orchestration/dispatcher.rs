//! Turns a worker response into a plan for the engine.
//!
//! [`Dispatcher::dispatch`] is pure: it runs deterministic functions against
//! a working copy of the task and describes everything else (messages to
//! append, sub-tasks to create, how the task finishes). The engine applies
//! the plan through the store.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::core::event::{EventId, ToolCall};
use crate::core::state::TaskState;
use crate::core::task::{Message, NewTask, Task, TaskUpdate};
use crate::error::{ErrorKind, TaskError};
use crate::orchestration::tools::{ToolClass, ToolTable};
use crate::process::executor::ProcessExecutor;

/// How a terminal tool call ends the task.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Complete(Value),
    Fail(TaskError),
}

/// Everything the engine must do for one worker response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchPlan {
    /// Tool messages and deterministic updates, in call order.
    pub update: TaskUpdate,
    /// Sub-tasks to create and wait on.
    pub spawn: Vec<NewTask>,
    pub terminal: Option<TerminalOutcome>,
    /// Names of tool calls dropped because a terminal call was present.
    pub discarded: Vec<String>,
}

impl DispatchPlan {
    /// State the task ends in once the plan is applied.
    pub fn target_state(&self) -> TaskState {
        match (&self.terminal, self.spawn.is_empty()) {
            (Some(TerminalOutcome::Complete(_)), _) => TaskState::Completed,
            (Some(TerminalOutcome::Fail(_)), _) => TaskState::Failed,
            (None, false) => TaskState::WaitingOnDependencies,
            (None, true) => TaskState::ReadyForAgent,
        }
    }
}

/// Dispatches tool calls according to the tool table.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tools: Arc<ToolTable>,
    executor: Arc<ProcessExecutor>,
}

impl Dispatcher {
    pub fn new(tools: Arc<ToolTable>, executor: Arc<ProcessExecutor>) -> Self {
        Self { tools, executor }
    }

    pub fn tools(&self) -> &ToolTable {
        &self.tools
    }

    /// Build the plan for a response with `text` and `calls`.
    ///
    /// `event` is the worker response event; sub-task ids derive from it.
    pub fn dispatch(&self, task: &Task, event: EventId, text: &str, calls: &[ToolCall]) -> DispatchPlan {
        let mut plan = DispatchPlan::default();
        let terminal_at = calls
            .iter()
            .position(|c| matches!(self.tools.classify(&c.name), Some(ToolClass::Terminal)));

        // Deterministic calls see the effects of earlier ones.
        let mut working = task.clone();
        let mut next_index = 0usize;

        for (i, call) in calls.iter().enumerate() {
            if let Some(t) = terminal_at {
                if i > t {
                    plan.discarded.push(call.name.clone());
                    continue;
                }
            }

            let mut update = TaskUpdate::default();
            match self.tools.classify(&call.name) {
                None => {
                    update.messages.push(Message::tool(
                        &call.name,
                        format!("error: unknown tool '{}'", call.name),
                    ));
                }
                Some(ToolClass::Deterministic { function }) => {
                    match self
                        .executor
                        .call_function(function, &working, &call.arguments)
                    {
                        Ok(out) => {
                            update = out.update;
                            update
                                .messages
                                .push(Message::tool(&call.name, out.value.to_string()));
                        }
                        Err(e) => {
                            update
                                .messages
                                .push(Message::tool(&call.name, format!("error: {}", e)));
                        }
                    }
                }
                Some(ToolClass::ProcessTriggering { process, fan_out }) => {
                    if terminal_at.is_some() {
                        plan.discarded.push(call.name.clone());
                        continue;
                    }
                    match build_children(task, event, &mut next_index, call, process, fan_out.as_deref()) {
                        Ok(children) => {
                            let ids: Vec<String> =
                                children.iter().map(|c| c.id.short()).collect();
                            update.messages.push(Message::tool(
                                &call.name,
                                format!("started {} sub-task(s): {}", children.len(), ids.join(", ")),
                            ));
                            plan.spawn.extend(children);
                        }
                        Err(reason) => {
                            update
                                .messages
                                .push(Message::tool(&call.name, format!("error: {}", reason)));
                        }
                    }
                }
                Some(ToolClass::Terminal) => {
                    plan.terminal = Some(terminal_outcome(text, &call.arguments));
                    update
                        .messages
                        .push(Message::tool(&call.name, "task ended".to_string()));
                }
            }
            update.clone().apply_to(&mut working);
            plan.update.merge(update);
        }

        if !plan.discarded.is_empty() {
            warn!(
                task_id = %task.id,
                discarded = ?plan.discarded,
                "tool calls discarded after terminal call"
            );
        }
        plan
    }
}

fn terminal_outcome(text: &str, args: &Map<String, Value>) -> TerminalOutcome {
    let failed = args.get("outcome").and_then(Value::as_str) == Some("failed");
    if failed {
        let message = args
            .get("reason")
            .or_else(|| args.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("agent reported failure");
        return TerminalOutcome::Fail(TaskError::new(ErrorKind::AgentReported, message));
    }
    let result = match args.get("result") {
        Some(v) => v.clone(),
        None if !text.is_empty() => Value::String(text.to_string()),
        None => Value::Null,
    };
    TerminalOutcome::Complete(result)
}

/// Build the sub-task(s) for one process-triggering call.
fn build_children(
    parent: &Task,
    event: EventId,
    next_index: &mut usize,
    call: &ToolCall,
    process: &str,
    fan_out: Option<&str>,
) -> std::result::Result<Vec<NewTask>, String> {
    let Some(key) = fan_out else {
        let instruction = call
            .arguments
            .get("instruction")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} for: {}", call.name, parent.instruction));
        let child = NewTask::child(parent.id, event, *next_index, instruction)
            .with_process(process)
            .with_params(call.arguments.clone())
            .with_capabilities(strings(call.arguments.get("capabilities")));
        *next_index += 1;
        return Ok(vec![child]);
    };

    let items = match call.arguments.get(key) {
        Some(Value::Array(items)) => items,
        Some(other) => return Err(format!("argument '{}' must be a list, got {}", key, other)),
        None => return Err(format!("missing argument '{}'", key)),
    };

    let mut base = call.arguments.clone();
    base.remove(key);
    let mut children = Vec::with_capacity(items.len());
    for item in items {
        let instruction = match item {
            Value::String(s) => s.clone(),
            Value::Object(m) => m
                .get("instruction")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| item.to_string()),
            other => other.to_string(),
        };
        let mut params = base.clone();
        params.insert("item".to_string(), item.clone());
        let child = NewTask::child(parent.id, event, *next_index, instruction)
            .with_process(process)
            .with_params(params)
            .with_capabilities(strings(item.get("capabilities")));
        *next_index += 1;
        children.push(child);
    }
    Ok(children)
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
