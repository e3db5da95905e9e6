//! Step-at-a-time process interpreter.
//!
//! The executor never touches the store or the queue. Each call to
//! [`ProcessExecutor::advance`] runs exactly one step against a [`Cursor`]
//! and tells the engine what to do next: apply an update and continue,
//! suspend on a worker call or on sub-tasks, or finish the run.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::core::event::{EventId, ToolCall};
use crate::core::task::{NewTask, Task, TaskId, TaskUpdate};
use crate::error::{Error, ErrorKind, Result, TaskError};
use crate::process::condition;
use crate::process::functions::{AgentCatalog, CallContext, CallOutput, FunctionRegistry};
use crate::process::substitution::{
    lookup, render_str, substitute, substitute_list, substitute_map, substitute_str,
};
use crate::process::template::{OnError, ProcessTemplate, Step, StepKind};

/// Variables visible to substitutions and conditions.
///
/// Namespaces: `task`, `params`, `item`, and one entry per executed step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    scope: Map<String, Value>,
}

impl ExecutionContext {
    fn new(template: &ProcessTemplate, task: &Task) -> Self {
        let mut params = template.parameters.clone();
        for (k, v) in &task.params {
            params.insert(k.clone(), v.clone());
        }
        let mut scope = Map::new();
        if let Some(item) = params.get("item") {
            scope.insert("item".to_string(), item.clone());
        }
        scope.insert("params".to_string(), Value::Object(params));
        scope.insert("task".to_string(), task.to_context_value());
        Self { scope }
    }

    fn refresh_task(&mut self, task: &Task) {
        self.scope
            .insert("task".to_string(), task.to_context_value());
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.scope.insert(name.into(), value);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.scope, path)
    }

    pub fn scope(&self) -> &Map<String, Value> {
        &self.scope
    }
}

/// A worker call requested by an `invoke` step.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub step: String,
    pub prompt: String,
    pub agent: Option<String>,
    pub context: Vec<String>,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
    Worker(InvokeRequest),
    /// Create `spawn`, then wait until `spawn` and `wait` are all terminal.
    Dependencies { spawn: Vec<NewTask>, wait: Vec<TaskId> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    /// Give the task to the agent loop.
    HandOff,
    Complete(Value),
    Fail(TaskError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Continue { update: TaskUpdate },
    Suspend(Suspension),
    Finish(Finish),
}

#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Worker { step: String },
    Dependencies { step: String, tasks: Vec<TaskId> },
}

/// Position of one task within its process.
#[derive(Debug, Clone)]
pub struct Cursor {
    template: Arc<ProcessTemplate>,
    current: Option<String>,
    ctx: ExecutionContext,
    steps_run: u32,
    pending: Option<Pending>,
}

impl Cursor {
    pub fn process(&self) -> &str {
        &self.template.name
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Task ids a dependency suspension is waiting on.
    pub fn pending_tasks(&self) -> Option<&[TaskId]> {
        match &self.pending {
            Some(Pending::Dependencies { tasks, .. }) => Some(tasks),
            _ => None,
        }
    }

    pub fn awaiting_worker(&self) -> bool {
        matches!(self.pending, Some(Pending::Worker { .. }))
    }

    /// Bind a worker reply as `<step>.text` / `<step>.tool_calls` and move on.
    pub fn resume_worker(&mut self, text: &str, tool_calls: &[ToolCall]) -> Result<()> {
        let step = match self.pending.take() {
            Some(Pending::Worker { step }) => step,
            other => {
                self.pending = other;
                return Err(self.malformed("resumed a worker call that was not pending"));
            }
        };
        let calls = serde_json::to_value(tool_calls)?;
        self.ctx.bind(step.clone(), json!({ "text": text, "tool_calls": calls }));
        self.steps_run = 0;
        self.move_past(&step);
        Ok(())
    }

    /// Bind `<step>.tasks` and `<step>.results` and move on.
    ///
    /// `results` holds one `{id, state, result, error}` object per pending task.
    pub fn resume_dependencies(&mut self, results: Vec<Value>) -> Result<()> {
        let (step, tasks) = match self.pending.take() {
            Some(Pending::Dependencies { step, tasks }) => (step, tasks),
            other => {
                self.pending = other;
                return Err(self.malformed("resumed a dependency wait that was not pending"));
            }
        };
        let ids: Vec<String> = tasks.iter().map(|t| t.to_string()).collect();
        self.ctx
            .bind(step.clone(), json!({ "tasks": ids, "results": results }));
        self.steps_run = 0;
        self.move_past(&step);
        Ok(())
    }

    fn move_past(&mut self, step: &str) {
        self.current = self.template.successor(step).map(|s| s.id.clone());
    }

    fn malformed(&self, reason: impl Into<String>) -> Error {
        Error::ProcessMalformed {
            process: self.template.name.clone(),
            reason: reason.into(),
        }
    }
}

/// What one step asked for, before cursor bookkeeping.
enum Action {
    Next(TaskUpdate),
    Jump(String),
    Suspend(Suspension, Pending),
    Finish(Finish),
}

/// Interprets process templates.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    functions: Arc<FunctionRegistry>,
    agents: Arc<AgentCatalog>,
    max_steps_per_run: u32,
}

impl ProcessExecutor {
    pub fn new(
        functions: Arc<FunctionRegistry>,
        agents: Arc<AgentCatalog>,
        max_steps_per_run: u32,
    ) -> Self {
        Self {
            functions,
            agents,
            max_steps_per_run,
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn agents(&self) -> &AgentCatalog {
        &self.agents
    }

    /// Position a new cursor at the template's first step.
    pub fn start(&self, template: Arc<ProcessTemplate>, task: &Task) -> Cursor {
        let ctx = ExecutionContext::new(&template, task);
        let current = template.first_step().map(|s| s.id.clone());
        Cursor {
            template,
            current,
            ctx,
            steps_run: 0,
            pending: None,
        }
    }

    /// Run a deterministic function outside of a process.
    pub fn call_function(
        &self,
        name: &str,
        task: &Task,
        args: &Map<String, Value>,
    ) -> Result<CallOutput> {
        let ctx = CallContext {
            task,
            args,
            agents: &self.agents,
        };
        self.functions.call(name, &ctx)
    }

    /// Execute the cursor's current step.
    ///
    /// `event` is the event driving this run; spawned children derive their
    /// ids from it.
    ///
    /// # Errors
    /// `ProcessMalformed` when the run has nowhere to go, `ProcessExecution`
    /// (or `UnresolvedParameter`) when a step fails without an `on_error`
    /// handler.
    pub fn advance(&self, cursor: &mut Cursor, task: &Task, event: EventId) -> Result<StepResult> {
        if cursor.pending.is_some() {
            return Err(cursor.malformed("advanced while suspended"));
        }
        let Some(step_id) = cursor.current.clone() else {
            return Err(cursor.malformed("run ended without hand_off, complete or fail"));
        };
        let template = cursor.template.clone();
        let Some(step) = template.step(&step_id) else {
            return Err(cursor.malformed(format!("unknown step '{}'", step_id)));
        };
        if cursor.steps_run >= self.max_steps_per_run {
            return Err(Error::ProcessExecution {
                step: step_id,
                message: format!("exceeded {} steps in one run", self.max_steps_per_run),
            });
        }
        cursor.steps_run += 1;
        cursor.ctx.refresh_task(task);

        let action = match self.execute(step, &mut cursor.ctx, task, event) {
            Ok(action) => action,
            Err(err) => match &step.on_error {
                Some(OnError::Goto { step: target }) => {
                    tracing::debug!(step = %step.id, error = %err, target = %target, "step failed, jumping");
                    Action::Jump(target.clone())
                }
                Some(OnError::Continue { value }) => {
                    tracing::debug!(step = %step.id, error = %err, "step failed, continuing");
                    cursor.ctx.bind(step.id.clone(), value.clone());
                    Action::Next(TaskUpdate::default())
                }
                None => return Err(step_error(&step.id, err)),
            },
        };

        Ok(match action {
            Action::Next(update) => {
                cursor.move_past(&step.id);
                StepResult::Continue { update }
            }
            Action::Jump(target) => {
                cursor.current = Some(target);
                StepResult::Continue {
                    update: TaskUpdate::default(),
                }
            }
            Action::Suspend(suspension, pending) => {
                cursor.pending = Some(pending);
                StepResult::Suspend(suspension)
            }
            Action::Finish(finish) => {
                cursor.current = None;
                StepResult::Finish(finish)
            }
        })
    }

    fn execute(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        task: &Task,
        event: EventId,
    ) -> Result<Action> {
        match &step.kind {
            StepKind::Invoke {
                prompt,
                agent,
                context,
                tools,
            } => {
                let request = InvokeRequest {
                    step: step.id.clone(),
                    prompt: render_str(prompt, ctx.scope())?,
                    agent: match agent {
                        Some(a) => Some(render_str(a, ctx.scope())?),
                        None => task.assigned_agent.clone(),
                    },
                    context: substitute_list(context, ctx.scope())?,
                    tools: substitute_list(tools, ctx.scope())?,
                };
                Ok(Action::Suspend(
                    Suspension::Worker(request),
                    Pending::Worker {
                        step: step.id.clone(),
                    },
                ))
            }

            StepKind::Call { function, args } => {
                let args = substitute_map(args, ctx.scope())?;
                let out = self.call_function(function, task, &args)?;
                ctx.bind(step.id.clone(), out.value);
                Ok(Action::Next(out.update))
            }

            StepKind::Spawn {
                instruction,
                process,
                params,
                capabilities,
                for_each,
            } => {
                let items = match for_each {
                    Some(path) => match resolve_path_or_placeholder(path, ctx)? {
                        Value::Array(items) => Some(items),
                        other => {
                            return Err(Error::Validation(format!(
                                "for_each '{}' is not a list: {}",
                                path, other
                            )))
                        }
                    },
                    None => None,
                };

                let previous_item = ctx.scope.get("item").cloned();
                let mut children = Vec::new();
                let bindings: Vec<Option<Value>> = match items {
                    Some(items) => items.into_iter().map(Some).collect(),
                    None => vec![None],
                };
                for (index, item) in bindings.into_iter().enumerate() {
                    if let Some(item) = &item {
                        ctx.bind("item", item.clone());
                    }
                    let built = (|| -> Result<NewTask> {
                        let mut child_params = substitute_map(params, ctx.scope())?;
                        if let Some(item) = &item {
                            child_params.insert("item".to_string(), item.clone());
                        }
                        let mut child = NewTask::child(
                            task.id,
                            event,
                            index,
                            render_str(instruction, ctx.scope())?,
                        )
                        .with_params(child_params)
                        .with_capabilities(substitute_list(capabilities, ctx.scope())?);
                        child.process = match process {
                            Some(p) => Some(render_str(p, ctx.scope())?),
                            None => None,
                        };
                        Ok(child)
                    })();
                    match &previous_item {
                        Some(v) => ctx.bind("item", v.clone()),
                        None => {
                            ctx.scope.remove("item");
                        }
                    }
                    children.push(built?);
                }

                if children.is_empty() {
                    ctx.bind(step.id.clone(), json!({ "tasks": [], "results": [] }));
                    return Ok(Action::Next(TaskUpdate::default()));
                }
                let tasks = children.iter().map(|c| c.id).collect();
                Ok(Action::Suspend(
                    Suspension::Dependencies {
                        spawn: children,
                        wait: Vec::new(),
                    },
                    Pending::Dependencies {
                        step: step.id.clone(),
                        tasks,
                    },
                ))
            }

            StepKind::Condition {
                expr,
                then,
                otherwise,
            } => {
                let target = if condition::evaluate(expr, ctx.scope())? {
                    then
                } else {
                    otherwise
                };
                Ok(Action::Jump(target.clone()))
            }

            StepKind::Wait { tasks } => {
                let ids = match substitute(tasks, ctx.scope())? {
                    Value::Null => Vec::new(),
                    Value::String(s) => vec![parse_task_id(&s)?],
                    Value::Array(items) => items
                        .iter()
                        .map(|v| match v {
                            Value::String(s) => parse_task_id(s),
                            other => Err(Error::Validation(format!(
                                "wait expects task ids, got {}",
                                other
                            ))),
                        })
                        .collect::<Result<Vec<_>>>()?,
                    other => {
                        return Err(Error::Validation(format!(
                            "wait expects task ids, got {}",
                            other
                        )))
                    }
                };
                if ids.is_empty() {
                    ctx.bind(step.id.clone(), json!({ "tasks": [], "results": [] }));
                    return Ok(Action::Next(TaskUpdate::default()));
                }
                Ok(Action::Suspend(
                    Suspension::Dependencies {
                        spawn: Vec::new(),
                        wait: ids.clone(),
                    },
                    Pending::Dependencies {
                        step: step.id.clone(),
                        tasks: ids,
                    },
                ))
            }

            StepKind::HandOff {} => Ok(Action::Finish(Finish::HandOff)),

            StepKind::Complete { result } => {
                Ok(Action::Finish(Finish::Complete(substitute(result, ctx.scope())?)))
            }

            StepKind::Fail { message } => Ok(Action::Finish(Finish::Fail(TaskError::new(
                ErrorKind::ProcessExecution,
                render_str(message, ctx.scope())?,
            )))),
        }
    }
}

fn resolve_path_or_placeholder(path: &str, ctx: &ExecutionContext) -> Result<Value> {
    if path.contains("{{") {
        return substitute_str(path, ctx.scope());
    }
    ctx.get(path)
        .cloned()
        .ok_or_else(|| Error::UnresolvedParameter {
            path: path.to_string(),
        })
}

fn parse_task_id(s: &str) -> Result<TaskId> {
    s.parse()
        .map_err(|_| Error::Validation(format!("'{}' is not a task id", s)))
}

/// Attach the step id to errors that don't carry one.
fn step_error(step: &str, err: Error) -> Error {
    match err {
        Error::UnresolvedParameter { .. }
        | Error::ProcessExecution { .. }
        | Error::ProcessMalformed { .. } => err,
        other => Error::ProcessExecution {
            step: step.to_string(),
            message: other.to_string(),
        },
    }
}
