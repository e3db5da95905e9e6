//! The runtime engine.
//!
//! A single consumer drains the event queue and dispatches each event to one
//! handler. Handlers never block on the worker: an invocation is spawned on
//! its own tokio task, a continuation is stored under the task id, and the
//! reply comes back as a `worker_response` event.
//!
//! Events derived while handling another event go to an internal backlog
//! that is drained before the channel, so the consumer never waits on its
//! own bounded queue. Ids are assigned when an event is taken for
//! processing; the event log is written in that order.

use notify::RecommendedWatcher;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::dag::{DependencyGraph, EdgeOutcome};
use crate::core::event::{
    EventId, EventIds, EventKind, EventQueue, EventSender, HoldScope, InvocationId, QueuedEvent,
    RuntimeEvent, ToolCall,
};
use crate::core::event_log::EventLog;
use crate::core::state::{Applied, Outcome, TaskState};
use crate::core::task::{Message, NewTask, Task, TaskId, TaskUpdate, TreeId};
use crate::error::{Error, ErrorKind, Result, TaskError};
use crate::orchestration::dispatcher::{DispatchPlan, Dispatcher, TerminalOutcome};
use crate::orchestration::handle::EngineHandle;
use crate::orchestration::safety::SafetyManager;
use crate::orchestration::tools::{ToolSpec, ToolTable};
use crate::orchestration::worker::{
    spawn_invocation, InvocationPolicy, ReasoningWorker, WorkerRequest,
};
use crate::process::executor::{Cursor, Finish, InvokeRequest, ProcessExecutor, StepResult, Suspension};
use crate::process::functions::{AgentCatalog, FunctionRegistry};
use crate::process::registry::{InMemoryProcessRegistry, ProcessRegistry};
use crate::store::{InMemoryTaskStore, TaskStore};

/// External collaborators the engine runs against.
pub struct Collaborators {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<dyn ProcessRegistry>,
    pub worker: Arc<dyn ReasoningWorker>,
    pub functions: FunctionRegistry,
    /// Keeps `runtime.process_dir` hot reload alive for the engine's lifetime.
    pub watcher: Option<RecommendedWatcher>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn ProcessRegistry>,
        worker: Arc<dyn ReasoningWorker>,
    ) -> Self {
        Self {
            store,
            registry,
            worker,
            functions: FunctionRegistry::builtin(),
            watcher: None,
        }
    }

    /// In-memory store over `registry`, with `runtime.process_dir` loaded
    /// into it and watched for changes.
    pub fn from_config(
        config: &Config,
        registry: InMemoryProcessRegistry,
        worker: Arc<dyn ReasoningWorker>,
    ) -> Result<Self> {
        let watcher = match &config.runtime.process_dir {
            Some(dir) => {
                registry.load_dir(dir)?;
                Some(registry.watch(dir)?)
            }
            None => None,
        };
        let mut collaborators = Self::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(registry),
            worker,
        );
        collaborators.watcher = watcher;
        Ok(collaborators)
    }

    /// In-memory store and the built-in processes.
    pub fn in_memory(worker: Arc<dyn ReasoningWorker>) -> Result<Self> {
        Ok(Self::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryProcessRegistry::with_builtins()?),
            worker,
        ))
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }
}

/// Where a suspended task resumes.
#[derive(Debug)]
enum Continuation {
    /// Blocked on its initial dependencies; the process has not started.
    Start,
    /// Process `invoke` step waiting for its agent turn.
    ProcessReady { cursor: Cursor, request: InvokeRequest },
    /// Process `invoke` step with a worker call in flight.
    ProcessWorker { cursor: Cursor, invocation: InvocationId },
    /// Process suspended on sub-tasks or existing tasks.
    ProcessWait { cursor: Cursor },
    /// Agent-loop worker call in flight.
    AgentTurn { invocation: InvocationId },
    /// Agent loop waiting on the sub-tasks its tool calls created.
    AgentWait { waiting: Vec<TaskId> },
}

impl Continuation {
    fn invocation(&self) -> Option<InvocationId> {
        match self {
            Continuation::ProcessWorker { invocation, .. } | Continuation::AgentTurn { invocation } => {
                Some(*invocation)
            }
            _ => None,
        }
    }
}

/// Event-driven runtime core.
pub struct RuntimeEngine {
    config: Config,
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn ProcessRegistry>,
    worker: Arc<dyn ReasoningWorker>,
    executor: Arc<ProcessExecutor>,
    dispatcher: Dispatcher,
    safety: SafetyManager,
    graph: DependencyGraph,
    continuations: HashMap<TaskId, Continuation>,
    backlog: VecDeque<QueuedEvent>,
    ids: EventIds,
    sender: EventSender,
    queue: EventQueue,
    log: Option<EventLog>,
    replay: bool,
    shutdown: CancellationToken,
    invocations: HashMap<TaskId, JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl RuntimeEngine {
    /// Build an engine from validated configuration.
    ///
    /// # Errors
    /// Fails if the configuration is invalid, a deterministic tool names an
    /// unknown function, or the event log cannot be opened.
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let functions = Arc::new(collaborators.functions);
        let tools = Arc::new(ToolTable::from_config(&config.tools, &functions)?);
        let default_tools: Vec<String> = tools.names().map(str::to_string).collect();
        let agents = Arc::new(AgentCatalog::new(config.agents.clone(), default_tools));
        let executor = Arc::new(ProcessExecutor::new(
            functions,
            agents,
            config.runtime.max_steps_per_run,
        ));

        let missing = tools.missing_processes(collaborators.registry.as_ref());
        if !missing.is_empty() {
            warn!(?missing, "tools reference processes the registry does not have");
        }
        if collaborators
            .registry
            .get(&config.runtime.default_process)
            .is_err()
        {
            warn!(process = %config.runtime.default_process, "default process is not registered");
        }

        let (sender, queue) = EventQueue::bounded(config.runtime.queue_capacity);
        let log = match &config.runtime.event_log {
            Some(path) => Some(EventLog::open(path)?),
            None => None,
        };

        Ok(Self {
            safety: SafetyManager::new(config.safety),
            dispatcher: Dispatcher::new(tools, executor.clone()),
            executor,
            store: collaborators.store,
            registry: collaborators.registry,
            worker: collaborators.worker,
            graph: DependencyGraph::new(),
            continuations: HashMap::new(),
            backlog: VecDeque::new(),
            ids: EventIds::default(),
            sender,
            queue,
            log,
            replay: false,
            shutdown: CancellationToken::new(),
            invocations: HashMap::new(),
            _watcher: collaborators.watcher,
            config,
        })
    }

    /// Switch to replay mode: derived events are dropped (they are already
    /// in the log), workers are never invoked and nothing is logged.
    pub fn into_replay(mut self) -> Self {
        self.replay = true;
        self.log = None;
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(self.sender.clone(), self.store.clone(), self.shutdown.clone())
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn safety(&self) -> &SafetyManager {
        &self.safety
    }

    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// Id of the last event processed.
    pub fn last_event(&self) -> EventId {
        self.ids.last()
    }

    /// Whether the task has a stored continuation.
    pub fn is_suspended(&self, task: TaskId) -> bool {
        self.continuations.contains_key(&task)
    }

    /// Consume events until shutdown is requested.
    pub async fn run(&mut self) -> Result<()> {
        let period = Duration::from_millis(self.config.runtime.deadline_check_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            queue_capacity = self.config.runtime.queue_capacity,
            default_process = %self.config.runtime.default_process,
            "engine started"
        );

        loop {
            if let Some(next) = self.backlog.pop_front() {
                self.process_queued(next).await;
                continue;
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                queued = self.queue.recv() => match queued {
                    Some(queued) => self.process_queued(queued).await,
                    None => break,
                },
                _ = ticker.tick() => self.check_deadlines(),
            }
        }

        self.stop();
        info!(last_event = %self.ids.last(), "engine stopped");
        Ok(())
    }

    /// Process events until the backlog and queue are empty and no worker
    /// call is outstanding. Returns the number of events processed.
    pub async fn run_until_idle(&mut self) -> usize {
        let mut processed = 0;
        loop {
            if let Some(next) = self.backlog.pop_front() {
                self.process_queued(next).await;
                processed += 1;
                continue;
            }
            if let Some(next) = self.queue.try_recv() {
                self.process_queued(next).await;
                processed += 1;
                continue;
            }
            self.invocations.retain(|_, handle| !handle.is_finished());
            if self.invocations.is_empty() {
                // A call that just finished has already enqueued its result.
                match self.queue.try_recv() {
                    Some(next) => {
                        self.process_queued(next).await;
                        processed += 1;
                        continue;
                    }
                    None => break,
                }
            }
            match self.queue.recv().await {
                Some(next) => {
                    self.process_queued(next).await;
                    processed += 1;
                }
                None => break,
            }
        }
        processed
    }

    /// Queue `deadline_expired` for every task past its deadline.
    pub fn check_deadlines(&mut self) {
        if self.replay {
            return;
        }
        for id in self.safety.expired(Instant::now()) {
            self.emit(Some(id), EventKind::DeadlineExpired {});
        }
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
        for (_, handle) in self.invocations.drain() {
            handle.abort();
        }
    }

    async fn process_queued(&mut self, queued: QueuedEvent) {
        let event = queued.stamp(self.ids.next());
        self.process_event(event).await;
    }

    /// Log and handle one event. Handler errors are recorded on the task the
    /// event targets; they never stop the loop.
    pub async fn process_event(&mut self, event: RuntimeEvent) {
        self.ids.observe(event.id);
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&event) {
                error!(event = %event.id, error = %e, "failed to write event log");
            }
        }
        debug!(
            event = %event.id,
            kind = event.kind.name(),
            task_id = ?event.task_id,
            "processing event"
        );

        let id = event.id;
        let task_id = event.task_id;
        if let Err(err) = self.handle_event(event).await {
            self.record_failure(id, task_id, err).await;
        }
    }

    async fn handle_event(&mut self, event: RuntimeEvent) -> Result<()> {
        let e = event.id;
        let name = event.kind.name();
        let target = || {
            event
                .task_id
                .ok_or_else(|| Error::Validation(format!("{} event has no task id", name)))
        };

        match event.kind.clone() {
            EventKind::TaskCreated { spec } => self.on_task_created(e, spec).await,
            EventKind::AgentTurnRequested {} => self.on_agent_turn(e, target()?).await,
            EventKind::WorkerResponse {
                invocation,
                text,
                tool_calls,
            } => {
                self.on_worker_response(e, target()?, invocation, text, tool_calls)
                    .await
            }
            EventKind::WorkerFailed {
                invocation,
                error,
                attempts,
            } => {
                self.on_worker_failed(e, target()?, invocation, error, attempts)
                    .await
            }
            EventKind::TaskCompleted { .. } | EventKind::TaskFailed { .. } => {
                self.on_terminal(target()?).await
            }
            EventKind::DependenciesResolved { by } => {
                self.on_dependencies_resolved(e, target()?, by).await
            }
            EventKind::HoldRequested { scope } => self.on_hold(e, scope).await,
            EventKind::StepRequested {} => self.on_step(e, target()?).await,
            EventKind::CancelRequested { reason } => {
                self.cancel_tree(e, target()?, TaskError::cancelled(reason))
                    .await
            }
            EventKind::DeadlineExpired {} => {
                let id = target()?;
                let budget = self
                    .store
                    .get_task(id)
                    .await?
                    .and_then(|t| t.deadline_ms)
                    .unwrap_or_default();
                let err = TaskError::new(
                    ErrorKind::Timeout,
                    format!("deadline of {} ms exceeded", budget),
                );
                self.cancel_tree(e, id, err).await
            }
            EventKind::EscalationRequired { reason } => {
                warn!(task_id = ?event.task_id, %reason, "escalation required");
                Ok(())
            }
            EventKind::ProcessMalformed { process, reason } => {
                warn!(task_id = ?event.task_id, %process, %reason, "process malformed");
                Ok(())
            }
        }
    }

    // Handlers

    async fn on_task_created(&mut self, e: EventId, spec: NewTask) -> Result<()> {
        if self.store.get_task(spec.id).await?.is_some() {
            debug!(task_id = %spec.id, "task already exists");
            return Ok(());
        }

        let (tree, depth) = match spec.parent_id {
            Some(parent) => {
                let parent = self.require(parent).await?;
                (parent.tree_id, parent.depth + 1)
            }
            None => (TreeId::from(spec.id), 0),
        };
        let task = Task::from_spec(spec, tree, depth);
        let id = task.id;
        let deps = task.dependencies.clone();
        let deadline = task.deadline_ms;
        let process = task
            .process
            .clone()
            .unwrap_or_else(|| self.config.runtime.default_process.clone());
        self.store.create_task(task).await?;
        self.graph.add_task(id);
        info!(task_id = %id, tree = %tree, depth, process = %process, "task created");

        if let (Some(ms), false) = (deadline, self.replay) {
            self.safety
                .arm_deadline(id, Duration::from_millis(ms), Instant::now());
        }

        for dep in &deps {
            if self.store.get_task(*dep).await?.is_none() {
                return Err(Error::TaskNotFound(*dep));
            }
        }
        let edges: Vec<(TaskId, TaskId)> = deps.iter().map(|d| (id, *d)).collect();
        let outcomes = self.graph.add_dependencies(&edges)?;
        let satisfied: Vec<TaskId> = deps
            .iter()
            .zip(&outcomes)
            .filter(|(_, o)| **o == EdgeOutcome::AlreadySatisfied)
            .map(|(d, _)| *d)
            .collect();

        self.store
            .update_task(
                id,
                TaskUpdate {
                    process: Some(process),
                    remove_dependencies: satisfied,
                    ..Default::default()
                },
            )
            .await?;
        self.transition(id, e, TaskState::ProcessAssigned, Outcome::None)
            .await?;

        if self.graph.is_blocked(id) {
            self.transition(id, e, TaskState::WaitingOnDependencies, Outcome::None)
                .await?;
            self.continuations.insert(id, Continuation::Start);
            debug!(task_id = %id, blockers = self.graph.outstanding(id), "task waiting before process start");
            return Ok(());
        }
        self.start_process(e, id).await
    }

    async fn on_agent_turn(&mut self, e: EventId, id: TaskId) -> Result<()> {
        let task = self.require(id).await?;
        if task.state != TaskState::ReadyForAgent {
            debug!(task_id = %id, state = %task.state, "agent turn no longer applies");
            return Ok(());
        }

        let limits = self.store.tree_limits(task.tree_id).await?;
        match self.safety.check(&task, limits) {
            Ok(()) => self.invoke(e, task).await,
            Err(violation) => {
                self.transition(id, e, TaskState::ManualHold, Outcome::None)
                    .await?;
                if violation.needs_escalation() {
                    self.store
                        .update_task(
                            id,
                            TaskUpdate {
                                note_error: Some(violation.to_task_error()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    warn!(task_id = %id, reason = %violation, "safety limit reached, task held");
                    self.emit(
                        Some(id),
                        EventKind::EscalationRequired {
                            reason: violation.to_string(),
                        },
                    );
                } else {
                    info!(task_id = %id, reason = %violation, "task held");
                }
                Ok(())
            }
        }
    }

    async fn invoke(&mut self, e: EventId, task: Task) -> Result<()> {
        let id = task.id;
        let invocation = InvocationId::from(e);
        let (request, continuation) = match self.continuations.remove(&id) {
            Some(Continuation::ProcessReady { cursor, request }) => (
                self.worker_request(&task, invocation, request.agent.clone(), &request.context, &request.tools),
                Continuation::ProcessWorker { cursor, invocation },
            ),
            _ => (
                self.worker_request(&task, invocation, task.assigned_agent.clone(), &[], &[]),
                Continuation::AgentTurn { invocation },
            ),
        };

        self.safety.begin_invocation(&task);
        self.transition(id, e, TaskState::AgentResponding, Outcome::None)
            .await?;
        self.continuations.insert(id, continuation);
        debug!(
            task_id = %id,
            invocation = invocation.0,
            consecutive = self.safety.consecutive(task.tree_id),
            in_flight = self.safety.in_flight(),
            "invoking worker"
        );

        if !self.replay {
            let handle = spawn_invocation(
                self.worker.clone(),
                request,
                self.policy(),
                self.sender.clone(),
                self.shutdown.child_token(),
            );
            self.invocations.insert(id, handle);
        }
        Ok(())
    }

    async fn on_worker_response(
        &mut self,
        e: EventId,
        id: TaskId,
        invocation: InvocationId,
        text: String,
        tool_calls: Vec<ToolCall>,
    ) -> Result<()> {
        let Some(continuation) = self.take_continuation(id, invocation) else {
            warn!(task_id = %id, invocation = invocation.0, "ignoring stale worker reply");
            return Ok(());
        };
        self.finish_invocation(id);

        if !text.is_empty() {
            self.store
                .update_task(id, TaskUpdate::message(Message::assistant(text.clone())))
                .await?;
        }

        match continuation {
            Continuation::ProcessWorker { mut cursor, .. } => {
                self.transition(id, e, TaskState::ToolProcessing, Outcome::None)
                    .await?;
                self.transition(id, e, TaskState::ProcessAssigned, Outcome::None)
                    .await?;
                cursor.resume_worker(&text, &tool_calls)?;
                let task = self.require(id).await?;
                self.run_process(e, task, cursor).await
            }
            _ => self.apply_dispatch(e, id, &text, &tool_calls).await,
        }
    }

    async fn apply_dispatch(
        &mut self,
        e: EventId,
        id: TaskId,
        text: &str,
        calls: &[ToolCall],
    ) -> Result<()> {
        let task = self.require(id).await?;
        let plan = self.dispatcher.dispatch(&task, e, text, calls);
        debug!(task_id = %id, calls = calls.len(), target = %plan.target_state(), "tool calls dispatched");
        let DispatchPlan {
            update,
            spawn,
            terminal,
            discarded,
        } = plan;
        if !discarded.is_empty() {
            debug!(task_id = %id, count = discarded.len(), "tool calls discarded");
        }

        if let Some(terminal) = terminal {
            self.safety.record_terminal(task.tree_id);
            if !update.is_empty() {
                self.store.update_task(id, update).await?;
            }
            return match terminal {
                TerminalOutcome::Complete(result) => self.complete(e, id, result).await,
                TerminalOutcome::Fail(err) => self.fail_task(e, id, err).await,
            };
        }

        self.transition(id, e, TaskState::ToolProcessing, Outcome::None)
            .await?;
        if !update.is_empty() {
            self.store.update_task(id, update).await?;
        }

        if spawn.is_empty() {
            self.transition(id, e, TaskState::ReadyForAgent, Outcome::None)
                .await?;
            self.emit(Some(id), EventKind::AgentTurnRequested {});
            return Ok(());
        }

        let children: Vec<TaskId> = spawn.iter().map(|c| c.id).collect();
        let edges: Vec<(TaskId, TaskId)> = children.iter().map(|c| (id, *c)).collect();
        self.graph.add_dependencies(&edges)?;
        self.store
            .update_task(
                id,
                TaskUpdate {
                    add_dependencies: children.clone(),
                    ..Default::default()
                },
            )
            .await?;
        self.transition(id, e, TaskState::WaitingOnDependencies, Outcome::None)
            .await?;
        info!(task_id = %id, count = children.len(), "sub-tasks spawned");
        self.continuations
            .insert(id, Continuation::AgentWait { waiting: children });
        for spec in spawn {
            self.emit(Some(spec.id), EventKind::TaskCreated { spec });
        }
        Ok(())
    }

    async fn on_worker_failed(
        &mut self,
        e: EventId,
        id: TaskId,
        invocation: InvocationId,
        error: TaskError,
        attempts: u32,
    ) -> Result<()> {
        if self.take_continuation(id, invocation).is_none() {
            warn!(task_id = %id, invocation = invocation.0, "ignoring stale worker failure");
            return Ok(());
        }
        self.finish_invocation(id);
        error!(task_id = %id, attempts, error = %error, "worker invocation failed");
        self.fail_task(e, id, error).await
    }

    async fn on_terminal(&mut self, id: TaskId) -> Result<()> {
        self.safety.release(id);
        if let Some(task) = self.store.get_task(id).await? {
            let tree = self.store.list_tree(task.tree_id).await?;
            if tree.iter().all(|t| t.is_finished()) {
                self.safety.forget_tree(task.tree_id);
            }
        }
        self.continuations.remove(&id);
        if let Some(handle) = self.invocations.remove(&id) {
            handle.abort();
        }

        let dependents = self.graph.dependents(id);
        let ready = self.graph.resolve(id);
        for dependent in dependents {
            let Some(task) = self.store.get_task(dependent).await? else {
                continue;
            };
            if !task.is_finished() {
                self.store
                    .update_task(
                        dependent,
                        TaskUpdate {
                            remove_dependencies: vec![id],
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        for dependent in ready {
            self.emit(Some(dependent), EventKind::DependenciesResolved { by: id });
        }
        Ok(())
    }

    async fn on_dependencies_resolved(&mut self, e: EventId, id: TaskId, by: TaskId) -> Result<()> {
        let task = self.require(id).await?;
        if task.state != TaskState::WaitingOnDependencies {
            debug!(task_id = %id, state = %task.state, "dependency resolution no longer applies");
            return Ok(());
        }
        if self.graph.is_blocked(id) {
            debug!(task_id = %id, "still blocked");
            return Ok(());
        }
        debug!(task_id = %id, by = %by, "dependencies resolved");

        match self.continuations.remove(&id) {
            Some(Continuation::Start) => {
                self.transition(id, e, TaskState::ProcessAssigned, Outcome::None)
                    .await?;
                self.start_process(e, id).await
            }
            Some(Continuation::ProcessWait { mut cursor }) => {
                let pending = cursor
                    .pending_tasks()
                    .map(<[TaskId]>::to_vec)
                    .unwrap_or_default();
                let results = self.dependency_results(&pending).await?;
                cursor.resume_dependencies(results)?;
                self.transition(id, e, TaskState::ProcessAssigned, Outcome::None)
                    .await?;
                let task = self.require(id).await?;
                self.run_process(e, task, cursor).await
            }
            other => {
                let waiting = match other {
                    Some(Continuation::AgentWait { waiting }) => waiting,
                    _ => {
                        warn!(task_id = %id, "no continuation for waiting task, returning it to the agent");
                        Vec::new()
                    }
                };
                let mut update = TaskUpdate::default();
                for dep in &waiting {
                    let child = self.require(*dep).await?;
                    update.messages.push(Message::system(summarize(&child)));
                }
                if !update.is_empty() {
                    self.store.update_task(id, update).await?;
                }
                self.transition(id, e, TaskState::ReadyForAgent, Outcome::None)
                    .await?;
                self.emit(Some(id), EventKind::AgentTurnRequested {});
                Ok(())
            }
        }
    }

    async fn on_hold(&mut self, e: EventId, scope: HoldScope) -> Result<()> {
        self.safety.hold(scope);
        let ready = self.store.list_by_state(TaskState::ReadyForAgent).await?;
        let mut held = 0;
        for task in ready.iter().filter(|t| covers(scope, t)) {
            self.transition(task.id, e, TaskState::ManualHold, Outcome::None)
                .await?;
            held += 1;
        }
        info!(?scope, held, "hold requested");
        Ok(())
    }

    async fn on_step(&mut self, e: EventId, id: TaskId) -> Result<()> {
        let task = self.require(id).await?;
        if task.state != TaskState::ManualHold {
            debug!(task_id = %id, state = %task.state, "step on a task that is not held");
            return Ok(());
        }
        self.safety.clear_hold(&task);
        self.transition(id, e, TaskState::ReadyForAgent, Outcome::None)
            .await?;
        info!(task_id = %id, "task stepped");
        self.emit(Some(id), EventKind::AgentTurnRequested {});
        Ok(())
    }

    /// Fail `root` and every non-terminal descendant with `err`.
    async fn cancel_tree(&mut self, e: EventId, root: TaskId, err: TaskError) -> Result<()> {
        let task = self.require(root).await?;
        let tree = self.store.list_tree(task.tree_id).await?;

        let mut doomed = vec![root];
        let mut i = 0;
        while i < doomed.len() {
            let current = doomed[i];
            doomed.extend(
                tree.iter()
                    .filter(|t| t.parent_id == Some(current))
                    .map(|t| t.id),
            );
            i += 1;
        }

        for id in &doomed {
            self.safety.forget(*id);
            self.fail_task(e, *id, err.clone()).await?;
        }
        info!(task_id = %root, count = doomed.len(), reason = %err, "task cancelled");
        Ok(())
    }

    // Process execution

    async fn start_process(&mut self, e: EventId, id: TaskId) -> Result<()> {
        let task = self.require(id).await?;
        let name = task
            .process
            .clone()
            .unwrap_or_else(|| self.config.runtime.default_process.clone());
        let template = self.registry.get(&name)?;
        debug!(task_id = %id, process = %name, version = %template.version, "starting process");
        let cursor = self.executor.start(template, &task);
        self.run_process(e, task, cursor).await
    }

    async fn run_process(&mut self, e: EventId, mut task: Task, mut cursor: Cursor) -> Result<()> {
        let id = task.id;
        loop {
            match self.executor.advance(&mut cursor, &task, e)? {
                StepResult::Continue { update } => {
                    if !update.is_empty() {
                        task = self.store.update_task(id, update).await?;
                    }
                }
                StepResult::Suspend(Suspension::Worker(request)) => {
                    self.store
                        .update_task(id, TaskUpdate::message(Message::user(request.prompt.clone())))
                        .await?;
                    self.transition(id, e, TaskState::ReadyForAgent, Outcome::None)
                        .await?;
                    debug!(task_id = %id, step = %request.step, "process waiting on worker");
                    self.continuations
                        .insert(id, Continuation::ProcessReady { cursor, request });
                    self.emit(Some(id), EventKind::AgentTurnRequested {});
                    return Ok(());
                }
                StepResult::Suspend(Suspension::Dependencies { spawn, wait }) => {
                    for w in &wait {
                        if self.store.get_task(*w).await?.is_none() {
                            return Err(Error::TaskNotFound(*w));
                        }
                    }
                    let blockers: Vec<TaskId> = spawn
                        .iter()
                        .map(|c| c.id)
                        .chain(wait.iter().copied())
                        .collect();
                    let edges: Vec<(TaskId, TaskId)> = blockers.iter().map(|b| (id, *b)).collect();
                    let outcomes = self.graph.add_dependencies(&edges)?;
                    let outstanding: Vec<TaskId> = blockers
                        .iter()
                        .zip(&outcomes)
                        .filter(|(_, o)| **o != EdgeOutcome::AlreadySatisfied)
                        .map(|(b, _)| *b)
                        .collect();

                    if outstanding.is_empty() {
                        let pending = cursor
                            .pending_tasks()
                            .map(<[TaskId]>::to_vec)
                            .unwrap_or_default();
                        let results = self.dependency_results(&pending).await?;
                        cursor.resume_dependencies(results)?;
                        continue;
                    }

                    self.store
                        .update_task(
                            id,
                            TaskUpdate {
                                add_dependencies: outstanding.clone(),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.transition(id, e, TaskState::WaitingOnDependencies, Outcome::None)
                        .await?;
                    debug!(task_id = %id, spawned = spawn.len(), waiting = outstanding.len(), "process waiting on tasks");
                    self.continuations
                        .insert(id, Continuation::ProcessWait { cursor });
                    for spec in spawn {
                        self.emit(Some(spec.id), EventKind::TaskCreated { spec });
                    }
                    return Ok(());
                }
                StepResult::Finish(Finish::HandOff) => {
                    self.transition(id, e, TaskState::ReadyForAgent, Outcome::None)
                        .await?;
                    debug!(task_id = %id, agent = ?task.assigned_agent, "process handed off");
                    self.emit(Some(id), EventKind::AgentTurnRequested {});
                    return Ok(());
                }
                StepResult::Finish(Finish::Complete(result)) => {
                    return self.complete(e, id, result).await;
                }
                StepResult::Finish(Finish::Fail(err)) => {
                    return self.fail_task(e, id, err).await;
                }
            }
        }
    }

    async fn dependency_results(&self, ids: &[TaskId]) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let task = self.require(*id).await?;
            results.push(json!({
                "id": task.id.to_string(),
                "state": task.state.to_string(),
                "result": task.result,
                "error": task.error,
            }));
        }
        Ok(results)
    }

    // Helpers

    async fn complete(&mut self, e: EventId, id: TaskId, result: Value) -> Result<()> {
        if let Applied::Transitioned { .. } = self
            .transition(id, e, TaskState::Completed, Outcome::Result(result.clone()))
            .await?
        {
            info!(task_id = %id, "task completed");
            self.emit(Some(id), EventKind::TaskCompleted { result });
        }
        Ok(())
    }

    async fn fail_task(&mut self, e: EventId, id: TaskId, err: TaskError) -> Result<()> {
        let task = self.require(id).await?;
        if task.is_finished() {
            return Ok(());
        }
        self.continuations.remove(&id);
        if let Some(handle) = self.invocations.remove(&id) {
            handle.abort();
        }
        if let Applied::Transitioned { from, .. } = self
            .transition(id, e, TaskState::Failed, Outcome::Error(err.clone()))
            .await?
        {
            warn!(task_id = %id, from = %from, error = %err, "task failed");
            self.emit(Some(id), EventKind::TaskFailed { error: err });
        }
        Ok(())
    }

    async fn record_failure(&mut self, e: EventId, task_id: Option<TaskId>, err: Error) {
        let malformed = match &err {
            Error::ProcessMalformed { process, reason } => Some((process.clone(), reason.clone())),
            Error::ProcessNotFound(process) => {
                Some((process.clone(), "no such process".to_string()))
            }
            _ => None,
        };
        if let Some((process, reason)) = malformed {
            self.emit(task_id, EventKind::ProcessMalformed { process, reason });
        }

        let Some(id) = task_id else {
            error!(event = %e, error = %err, "event handler failed");
            return;
        };
        error!(task_id = %id, event = %e, error = %err, "event handler failed");
        match self.store.get_task(id).await {
            Ok(Some(task)) if !task.is_finished() => {
                if let Err(fail_err) = self.fail_task(e, id, err.to_task_error()).await {
                    error!(task_id = %id, error = %fail_err, "could not record failure");
                }
            }
            Ok(_) => {}
            Err(store_err) => error!(task_id = %id, error = %store_err, "could not load task"),
        }
    }

    async fn transition(
        &self,
        id: TaskId,
        e: EventId,
        to: TaskState,
        outcome: Outcome,
    ) -> Result<Applied> {
        let applied = self.store.apply_transition(id, e, to, outcome).await?;
        match applied {
            Applied::Transitioned { from, to } => {
                debug!(task_id = %id, event = %e, from = %from, to = %to, "transition")
            }
            Applied::Duplicate => debug!(task_id = %id, event = %e, to = %to, "duplicate transition ignored"),
        }
        Ok(applied)
    }

    async fn require(&self, id: TaskId) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or(Error::TaskNotFound(id))
    }

    fn emit(&mut self, task_id: Option<TaskId>, kind: EventKind) {
        if self.replay {
            return;
        }
        self.backlog.push_back(QueuedEvent::new(task_id, kind));
    }

    fn take_continuation(&mut self, id: TaskId, invocation: InvocationId) -> Option<Continuation> {
        match self.continuations.get(&id) {
            Some(c) if c.invocation() == Some(invocation) => self.continuations.remove(&id),
            _ => None,
        }
    }

    fn finish_invocation(&mut self, id: TaskId) {
        self.safety.end_invocation(id);
        self.invocations.remove(&id);
    }

    fn policy(&self) -> InvocationPolicy {
        InvocationPolicy {
            timeout: self.config.safety.worker_timeout(),
            retry: self.config.retry,
        }
    }

    fn worker_request(
        &self,
        task: &Task,
        invocation: InvocationId,
        agent: Option<String>,
        extra_context: &[String],
        extra_tools: &[String],
    ) -> WorkerRequest {
        let mut conversation = Vec::with_capacity(task.conversation.len() + 1);
        conversation.push(Message::user(task.instruction.clone()));
        conversation.extend(task.conversation.iter().cloned());

        let mut context: Vec<String> = task.additional_context.iter().cloned().collect();
        for doc in extra_context {
            if !context.contains(doc) {
                context.push(doc.clone());
            }
        }

        let names: BTreeSet<&String> = task.additional_tools.iter().chain(extra_tools).collect();
        let tools = names
            .into_iter()
            .map(|name| {
                self.dispatcher
                    .tools()
                    .spec(name)
                    .cloned()
                    .unwrap_or_else(|| ToolSpec {
                        name: name.clone(),
                        description: None,
                        parameters: Value::Null,
                    })
            })
            .collect();

        WorkerRequest {
            task_id: task.id,
            invocation,
            agent,
            conversation,
            context,
            tools,
        }
    }
}

impl Drop for RuntimeEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn covers(scope: HoldScope, task: &Task) -> bool {
    match scope {
        HoldScope::Task(id) => task.id == id,
        HoldScope::Tree(tree) => task.tree_id == tree,
        HoldScope::System => true,
    }
}

/// System message reporting a finished dependency to its parent.
fn summarize(task: &Task) -> String {
    let outcome = match (&task.result, &task.error) {
        (_, Some(err)) if task.state == TaskState::Failed => format!("failed: {}", err),
        (Some(Value::String(s)), _) => format!("completed: {}", s),
        (Some(v), _) => format!("completed: {}", v),
        (None, _) => task.state.to_string(),
    };
    format!("Sub-task {} ({}) {}", task.id.short(), task.instruction, outcome)
}
