//! Core data types: tasks, states, events and the dependency graph.

pub mod dag;
pub mod event;
pub mod event_log;
pub mod state;
pub mod task;

pub use dag::{DependencyGraph, EdgeOutcome};
pub use event::{
    EventId, EventIds, EventKind, EventQueue, EventSender, HoldScope, InvocationId, QueuedEvent,
    RuntimeEvent, ToolCall,
};
pub use event_log::{EventLog, EventRecord};
pub use state::{Applied, Outcome, TaskState};
pub use task::{Message, NewTask, Role, Task, TaskId, TaskUpdate, TransitionRecord, TreeId};
