//! Task data model for the runtime core.
//!
//! Tasks are the units of schedulable work. Each task tracks its state,
//! assignment, conversation, dependency set and final outcome. Records are
//! mutated only through the task store; nothing in the core deletes them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::core::event::EventId;
use crate::core::state::TaskState;
use crate::error::TaskError;

/// Unique identifier for a task.
///
/// Root tasks get a random UUID at submission. Sub-tasks get a UUID v5
/// derived from their parent, the creating event and their position, so a
/// replayed event log recreates the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new random task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a child id from its parent, the event that created it and its index.
    pub fn derived(parent: TaskId, event: EventId, index: usize) -> Self {
        let name = format!("{}:{}", event.0, index);
        Self(Uuid::new_v5(&parent.0, name.as_bytes()))
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a task tree: the id of the externally submitted root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(pub Uuid);

impl From<TaskId> for TreeId {
    fn from(id: TaskId) -> Self {
        Self(id.0)
    }
}

impl std::fmt::Display for TreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One role-tagged entry in a task's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool name for `Role::Tool` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool: None,
        }
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool: Some(name.into()),
        }
    }
}

/// Specification for a task that has not been created yet.
///
/// Collaborators submit these for root tasks; the dispatcher and the
/// process executor build them for sub-tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    pub instruction: String,
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Time budget in milliseconds, enforced by the engine's deadline check.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl NewTask {
    /// Create a root task spec with a fresh id.
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            parent_id: None,
            instruction: instruction.into(),
            process: None,
            params: Map::new(),
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            context: Vec::new(),
            tools: Vec::new(),
            deadline_ms: None,
        }
    }

    /// Create a child spec whose id is derived from the parent and event.
    pub fn child(
        parent: TaskId,
        event: EventId,
        index: usize,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::derived(parent, event, index),
            parent_id: Some(parent),
            ..Self::new(instruction)
        }
    }

    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.process = Some(process.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }
}

/// One applied state change, kept for audit and duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub event: EventId,
    pub from: TaskState,
    pub to: TaskState,
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tree_id: TreeId,
    pub parent_id: Option<TaskId>,
    /// Depth in the task tree (0 = root).
    pub depth: u32,
    pub state: TaskState,
    pub assigned_agent: Option<String>,
    /// Immutable once set; no update path touches it.
    pub instruction: String,
    pub conversation: Vec<Message>,
    pub additional_context: BTreeSet<String>,
    pub additional_tools: BTreeSet<String>,
    pub process: Option<String>,
    pub params: Map<String, Value>,
    pub capabilities: Vec<String>,
    /// Outstanding blockers, in insertion order.
    pub dependencies: Vec<TaskId>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub deadline_ms: Option<u64>,
    pub history: Vec<TransitionRecord>,
    /// Highest event applied to this task; anything at or below is a replay.
    pub last_event: Option<EventId>,
}

impl Task {
    /// Build a task record in `Created` from its spec.
    pub fn from_spec(spec: NewTask, tree_id: TreeId, depth: u32) -> Self {
        let mut dependencies = Vec::new();
        for dep in spec.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
        Self {
            id: spec.id,
            tree_id,
            parent_id: spec.parent_id,
            depth,
            state: TaskState::Created,
            assigned_agent: None,
            instruction: spec.instruction,
            conversation: Vec::new(),
            additional_context: spec.context.into_iter().collect(),
            additional_tools: spec.tools.into_iter().collect(),
            process: spec.process,
            params: spec.params,
            capabilities: spec.capabilities,
            dependencies,
            result: None,
            error: None,
            deadline_ms: spec.deadline_ms,
            history: Vec::new(),
            last_event: None,
        }
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check if the task has no outstanding blockers.
    pub fn is_unblocked(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Project the task into the JSON shape used by `task.*` substitutions.
    pub fn to_context_value(&self) -> Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "tree_id": self.tree_id.to_string(),
            "parent_id": self.parent_id.map(|p| p.to_string()),
            "state": self.state.to_string(),
            "instruction": self.instruction,
            "assigned_agent": self.assigned_agent,
            "process": self.process,
            "params": Value::Object(self.params.clone()),
            "capabilities": self.capabilities,
            "context": self.additional_context.iter().collect::<Vec<_>>(),
            "tools": self.additional_tools.iter().collect::<Vec<_>>(),
            "dependencies": self.dependencies.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        })
    }
}

/// Field changes that do not move the task between states.
///
/// Every field is additive: conversation, context and tools only grow, and
/// there is no way to rewrite the instruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_dependencies: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_dependencies: Vec<TaskId>,
    /// Non-terminal error note, e.g. the reason for a safety hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_error: Option<TaskError>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        *self == TaskUpdate::default()
    }

    pub fn message(msg: Message) -> Self {
        Self {
            messages: vec![msg],
            ..Default::default()
        }
    }

    /// Merge another update into this one, keeping append order.
    pub fn merge(&mut self, other: TaskUpdate) {
        if other.assigned_agent.is_some() {
            self.assigned_agent = other.assigned_agent;
        }
        if other.process.is_some() {
            self.process = other.process;
        }
        if other.note_error.is_some() {
            self.note_error = other.note_error;
        }
        self.messages.extend(other.messages);
        self.context.extend(other.context);
        self.tools.extend(other.tools);
        self.add_dependencies.extend(other.add_dependencies);
        self.remove_dependencies.extend(other.remove_dependencies);
    }

    /// Apply the update to a task record.
    pub fn apply_to(self, task: &mut Task) {
        if let Some(agent) = self.assigned_agent {
            task.assigned_agent = Some(agent);
        }
        if let Some(process) = self.process {
            task.process = Some(process);
        }
        task.conversation.extend(self.messages);
        task.additional_context.extend(self.context);
        task.additional_tools.extend(self.tools);
        for dep in self.add_dependencies {
            if !task.dependencies.contains(&dep) {
                task.dependencies.push(dep);
            }
        }
        if !self.remove_dependencies.is_empty() {
            task.dependencies
                .retain(|d| !self.remove_dependencies.contains(d));
        }
        if let Some(err) = self.note_error {
            if !task.state.is_terminal() {
                task.error = Some(err);
            }
        }
    }
}
