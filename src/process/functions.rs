//! Deterministic functions callable from `call` steps and deterministic tools.
//!
//! Functions are synchronous and side-effect free apart from the
//! [`TaskUpdate`] they return; the engine applies that update through the
//! task store.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AgentProfile;
use crate::core::task::{Task, TaskUpdate};
use crate::error::{Error, Result};

/// Configured agents, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    agents: Vec<AgentProfile>,
    /// Tools offered to agents whose profile lists none.
    default_tools: Vec<String>,
}

impl AgentCatalog {
    pub fn new(agents: Vec<AgentProfile>, default_tools: Vec<String>) -> Self {
        Self {
            agents,
            default_tools,
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agents(&self) -> &[AgentProfile] {
        &self.agents
    }

    /// Pick the agent matching the most of `wanted`. Ties go to the agent
    /// listed first; with no overlap at all the first agent is chosen.
    pub fn select(&self, wanted: &[String]) -> Option<&AgentProfile> {
        let mut best: Option<(&AgentProfile, usize)> = None;
        for agent in &self.agents {
            let score = wanted
                .iter()
                .filter(|c| agent.capabilities.contains(c))
                .count();
            match best {
                Some((_, top)) if top >= score => {}
                _ => best = Some((agent, score)),
            }
        }
        best.map(|(agent, _)| agent)
    }

    /// Tools for an agent: its own list, or the catalog default.
    pub fn tools_for(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(agent) if !agent.tools.is_empty() => agent.tools.clone(),
            _ => self.default_tools.clone(),
        }
    }
}

/// Inputs to a deterministic function.
pub struct CallContext<'a> {
    pub task: &'a Task,
    pub args: &'a Map<String, Value>,
    pub agents: &'a AgentCatalog,
}

impl CallContext<'_> {
    /// Read a string-or-array argument as a list of strings.
    pub fn strings(&self, key: &str) -> Result<Vec<String>> {
        match self.args.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(vec![s.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(Error::Validation(format!(
                        "argument '{}' must hold strings, got {}",
                        key, other
                    ))),
                })
                .collect(),
            Some(other) => Err(Error::Validation(format!(
                "argument '{}' must be a string or list, got {}",
                key, other
            ))),
        }
    }

    fn agent_name(&self) -> Option<String> {
        self.args
            .get("agent")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.task.assigned_agent.clone())
    }
}

/// Output of a deterministic function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOutput {
    /// Bound as the step output, or rendered into a tool message.
    pub value: Value,
    pub update: TaskUpdate,
}

pub trait DeterministicFunction: Send + Sync {
    fn call(&self, ctx: &CallContext<'_>) -> Result<CallOutput>;
}

impl<F> DeterministicFunction for F
where
    F: Fn(&CallContext<'_>) -> Result<CallOutput> + Send + Sync,
{
    fn call(&self, ctx: &CallContext<'_>) -> Result<CallOutput> {
        self(ctx)
    }
}

/// Named deterministic functions.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn DeterministicFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in function.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("assign_agent", assign_agent);
        registry.register("gather_context", gather_context);
        registry.register("gather_tools", gather_tools);
        registry.register("add_context", add_context);
        registry.register("add_tools", add_tools);
        registry.register("task_info", task_info);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, function: impl DeterministicFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn call(&self, name: &str, ctx: &CallContext<'_>) -> Result<CallOutput> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
        function.call(ctx)
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

/// Choose an agent by capability. Keeps an existing assignment.
fn assign_agent(ctx: &CallContext<'_>) -> Result<CallOutput> {
    if let Some(agent) = &ctx.task.assigned_agent {
        return Ok(CallOutput {
            value: json!({ "agent": agent }),
            update: TaskUpdate::default(),
        });
    }

    let mut wanted = ctx.strings("capabilities")?;
    if wanted.is_empty() {
        wanted = ctx.task.capabilities.clone();
    }
    let agent = ctx
        .agents
        .select(&wanted)
        .ok_or_else(|| Error::Validation("no agents are configured".to_string()))?;

    Ok(CallOutput {
        value: json!({ "agent": agent.name, "capabilities": wanted }),
        update: TaskUpdate {
            assigned_agent: Some(agent.name.clone()),
            ..Default::default()
        },
    })
}

/// Attach the assigned agent's standing context plus any `documents` argument.
fn gather_context(ctx: &CallContext<'_>) -> Result<CallOutput> {
    let mut documents = ctx
        .agent_name()
        .and_then(|name| ctx.agents.get(&name))
        .map(|agent| agent.context.clone())
        .unwrap_or_default();
    documents.extend(ctx.strings("documents")?);
    Ok(CallOutput {
        value: json!(documents),
        update: TaskUpdate {
            context: documents,
            ..Default::default()
        },
    })
}

/// Offer the assigned agent's tools plus any `tools` argument.
fn gather_tools(ctx: &CallContext<'_>) -> Result<CallOutput> {
    let mut tools = ctx
        .agent_name()
        .map(|name| ctx.agents.tools_for(&name))
        .unwrap_or_default();
    tools.extend(ctx.strings("tools")?);
    Ok(CallOutput {
        value: json!(tools),
        update: TaskUpdate {
            tools,
            ..Default::default()
        },
    })
}

fn add_context(ctx: &CallContext<'_>) -> Result<CallOutput> {
    let mut documents = ctx.strings("documents")?;
    documents.extend(ctx.strings("document")?);
    if documents.is_empty() {
        return Err(Error::Validation(
            "add_context needs 'documents' or 'document'".to_string(),
        ));
    }
    Ok(CallOutput {
        value: json!({ "added": documents, "count": documents.len() }),
        update: TaskUpdate {
            context: documents,
            ..Default::default()
        },
    })
}

fn add_tools(ctx: &CallContext<'_>) -> Result<CallOutput> {
    let tools = ctx.strings("tools")?;
    if tools.is_empty() {
        return Err(Error::Validation("add_tools needs 'tools'".to_string()));
    }
    Ok(CallOutput {
        value: json!({ "added": tools, "count": tools.len() }),
        update: TaskUpdate {
            tools,
            ..Default::default()
        },
    })
}

fn task_info(ctx: &CallContext<'_>) -> Result<CallOutput> {
    Ok(CallOutput {
        value: ctx.task.to_context_value(),
        update: TaskUpdate::default(),
    })
}
