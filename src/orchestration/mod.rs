//! Orchestration layer: the event loop and everything it drives.
//!
//! [`RuntimeEngine`] consumes the event queue. Worker replies are turned
//! into task updates by the [`Dispatcher`], and [`SafetyManager`] gates
//! every worker call. Operators and clients talk to a running engine
//! through an [`EngineHandle`].

pub mod dispatcher;
pub mod engine;
pub mod handle;
pub mod replay;
pub mod safety;
pub mod tools;
pub mod worker;

pub use dispatcher::{DispatchPlan, Dispatcher, TerminalOutcome};
pub use engine::{Collaborators, RuntimeEngine};
pub use handle::EngineHandle;
pub use replay::{replay, replay_file, ReplayOutcome};
pub use safety::{SafetyManager, SafetyViolation};
pub use tools::{ToolClass, ToolSpec, ToolTable};
pub use worker::{
    invoke_with_retry, spawn_invocation, DetachedWorker, InvocationPolicy, ReasoningWorker,
    WorkerReply, WorkerRequest,
};
