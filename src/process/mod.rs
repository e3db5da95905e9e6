//! Process templates and their interpreter.
//!
//! A process is a graph of steps that mixes deterministic orchestration
//! (`call`, `spawn`, `wait`, `condition`) with worker calls (`invoke`).
//! Templates are data: loaded from TOML/JSON, validated, and executed one
//! step at a time by [`ProcessExecutor`].

pub mod builtin;
pub mod condition;
pub mod executor;
pub mod functions;
pub mod registry;
pub mod substitution;
pub mod template;

pub use executor::{
    Cursor, ExecutionContext, Finish, InvokeRequest, ProcessExecutor, StepResult, Suspension,
};
pub use functions::{AgentCatalog, CallContext, CallOutput, DeterministicFunction, FunctionRegistry};
pub use registry::{InMemoryProcessRegistry, ProcessRegistry};
pub use template::{OnError, ProcessTemplate, Step, StepKind};
