//! Safety limits on worker usage.
//!
//! The `SafetyManager` is owned by the engine loop and consulted before every
//! worker invocation. It tracks consecutive invocations per tree, in-flight
//! invocations system-wide, manual hold flags and task deadlines.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SafetyConfig;
use crate::core::event::HoldScope;
use crate::core::task::{Task, TaskId, TreeId};
use crate::error::{Error, ErrorKind, TaskError};
use crate::store::TreeLimits;

/// Why a worker invocation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyViolation {
    /// The tree used up its consecutive-call budget.
    ConsecutiveCalls { tree: TreeId, limit: u32 },
    /// Every worker slot is busy.
    Concurrency { limit: usize },
    /// A manual hold covers the task.
    Held { scope: HoldScope },
}

impl SafetyViolation {
    /// Whether a ceiling was hit. Operator holds are not escalated.
    pub fn needs_escalation(&self) -> bool {
        !matches!(self, SafetyViolation::Held { .. })
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError::new(ErrorKind::SafetyLimitExceeded, self.to_string())
    }
}

impl std::fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyViolation::ConsecutiveCalls { tree, limit } => write!(
                f,
                "tree {} reached {} consecutive worker calls",
                tree, limit
            ),
            SafetyViolation::Concurrency { limit } => {
                write!(f, "{} worker calls already in flight", limit)
            }
            SafetyViolation::Held { scope } => match scope {
                HoldScope::Task(id) => write!(f, "task {} is on hold", id.short()),
                HoldScope::Tree(tree) => write!(f, "tree {} is on hold", tree),
                HoldScope::System => write!(f, "system is on hold"),
            },
        }
    }
}

impl From<SafetyViolation> for Error {
    fn from(v: SafetyViolation) -> Self {
        Error::SafetyLimitExceeded {
            limit: v.to_string(),
        }
    }
}

/// Counters, holds and deadlines for the running system.
#[derive(Debug)]
pub struct SafetyManager {
    config: SafetyConfig,
    consecutive: HashMap<TreeId, u32>,
    in_flight: HashSet<TaskId>,
    holds: HashSet<HoldScope>,
    /// Tasks stepped while a tree or system hold is active; each may take
    /// one more turn.
    passes: HashSet<TaskId>,
    deadlines: BTreeMap<TaskId, Instant>,
}

impl SafetyManager {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            consecutive: HashMap::new(),
            in_flight: HashSet::new(),
            holds: HashSet::new(),
            passes: HashSet::new(),
            deadlines: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Decide whether `task` may invoke the worker now.
    pub fn check(&self, task: &Task, limits: Option<TreeLimits>) -> Result<(), SafetyViolation> {
        if let Some(scope) = self.hold_covering(task) {
            return Err(SafetyViolation::Held { scope });
        }

        let limit = limits
            .and_then(|l| l.max_consecutive_calls)
            .unwrap_or(self.config.max_consecutive_calls);
        if self.consecutive(task.tree_id) >= limit {
            return Err(SafetyViolation::ConsecutiveCalls {
                tree: task.tree_id,
                limit,
            });
        }

        if self.in_flight.len() >= self.config.max_concurrent_workers {
            return Err(SafetyViolation::Concurrency {
                limit: self.config.max_concurrent_workers,
            });
        }
        Ok(())
    }

    fn hold_covering(&self, task: &Task) -> Option<HoldScope> {
        let own = HoldScope::Task(task.id);
        if self.holds.contains(&own) {
            return Some(own);
        }
        if self.passes.contains(&task.id) {
            return None;
        }
        [HoldScope::Tree(task.tree_id), HoldScope::System]
            .into_iter()
            .find(|scope| self.holds.contains(scope))
    }

    pub fn begin_invocation(&mut self, task: &Task) {
        *self.consecutive.entry(task.tree_id).or_insert(0) += 1;
        self.in_flight.insert(task.id);
        self.passes.remove(&task.id);
    }

    /// Returns whether the task had an invocation in flight.
    pub fn end_invocation(&mut self, task: TaskId) -> bool {
        self.in_flight.remove(&task)
    }

    /// A terminal tool call resets the tree's consecutive counter.
    pub fn record_terminal(&mut self, tree: TreeId) {
        self.consecutive.remove(&tree);
    }

    /// Drop per-task state once the task is terminal.
    pub fn release(&mut self, task: TaskId) {
        self.in_flight.remove(&task);
        self.deadlines.remove(&task);
    }

    /// Drop the counter of a tree whose tasks are all terminal.
    pub fn forget_tree(&mut self, tree: TreeId) {
        self.consecutive.remove(&tree);
    }

    /// Drop every trace of a task, including its own hold flag.
    pub fn forget(&mut self, task: TaskId) {
        self.release(task);
        self.holds.remove(&HoldScope::Task(task));
        self.passes.remove(&task);
    }

    pub fn hold(&mut self, scope: HoldScope) {
        self.holds.insert(scope);
    }

    /// Manual step: clear the task's own hold, let it past any tree or
    /// system hold for one turn, and reset its tree counter.
    pub fn clear_hold(&mut self, task: &Task) {
        self.holds.remove(&HoldScope::Task(task.id));
        if self.hold_covering(task).is_some() {
            self.passes.insert(task.id);
        }
        self.consecutive.remove(&task.tree_id);
    }

    pub fn is_held(&self, task: &Task) -> bool {
        self.hold_covering(task).is_some()
    }

    pub fn holds(&self) -> impl Iterator<Item = &HoldScope> {
        self.holds.iter()
    }

    pub fn consecutive(&self, tree: TreeId) -> u32 {
        self.consecutive.get(&tree).copied().unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, task: TaskId) -> bool {
        self.in_flight.contains(&task)
    }

    /// Number of trees with a live consecutive-call counter.
    pub fn tracked_trees(&self) -> usize {
        self.consecutive.len()
    }

    pub fn arm_deadline(&mut self, task: TaskId, budget: Duration, now: Instant) {
        self.deadlines.insert(task, now + budget);
    }

    /// Remove and return every task whose deadline is at or before `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<TaskId> {
        let due: Vec<TaskId> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.deadlines.remove(id);
        }
        due
    }

    pub fn has_deadlines(&self) -> bool {
        !self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::NewTask;

    fn config(consecutive: u32, concurrent: usize) -> SafetyConfig {
        SafetyConfig {
            max_consecutive_calls: consecutive,
            max_concurrent_workers: concurrent,
            ..Default::default()
        }
    }

    fn root() -> Task {
        let spec = NewTask::new("root");
        let id = spec.id;
        Task::from_spec(spec, TreeId::from(id), 0)
    }

    fn child_of(parent: &Task) -> Task {
        let spec = NewTask::new("child");
        Task::from_spec(spec, parent.tree_id, parent.depth + 1)
    }

    #[test]
    fn test_consecutive_limit_per_tree() {
        let mut safety = SafetyManager::new(config(3, 100));
        let task = root();
        for _ in 0..3 {
            assert!(safety.check(&task, None).is_ok());
            safety.begin_invocation(&task);
            safety.end_invocation(task.id);
        }
        let violation = safety.check(&task, None).unwrap_err();
        assert!(matches!(violation, SafetyViolation::ConsecutiveCalls { limit: 3, .. }));
        assert!(violation.needs_escalation());

        // Another tree is unaffected.
        assert!(safety.check(&root(), None).is_ok());

        safety.record_terminal(task.tree_id);
        assert!(safety.check(&task, None).is_ok());
    }

    #[test]
    fn test_tree_override() {
        let mut safety = SafetyManager::new(config(10, 100));
        let task = root();
        safety.begin_invocation(&task);
        safety.end_invocation(task.id);
        let limits = TreeLimits {
            max_consecutive_calls: Some(1),
        };
        assert!(safety.check(&task, Some(limits)).is_err());
        assert!(safety.check(&task, Some(TreeLimits::default())).is_ok());
    }

    #[test]
    fn test_concurrency_ceiling_escalates() {
        let mut safety = SafetyManager::new(config(10, 1));
        let a = root();
        let b = root();
        safety.begin_invocation(&a);
        let violation = safety.check(&b, None).unwrap_err();
        assert_eq!(violation, SafetyViolation::Concurrency { limit: 1 });
        assert!(violation.needs_escalation());

        assert!(safety.end_invocation(a.id));
        assert!(safety.check(&b, None).is_ok());
    }

    #[test]
    fn test_operator_hold_does_not_escalate() {
        let violation = SafetyViolation::Held {
            scope: HoldScope::System,
        };
        assert!(!violation.needs_escalation());
    }

    #[test]
    fn test_forget_tree_drops_counter() {
        let mut safety = SafetyManager::new(config(10, 10));
        let task = root();
        safety.begin_invocation(&task);
        safety.end_invocation(task.id);
        assert_eq!(safety.tracked_trees(), 1);
        safety.forget_tree(task.tree_id);
        assert_eq!(safety.tracked_trees(), 0);
        assert_eq!(safety.consecutive(task.tree_id), 0);
    }

    #[test]
    fn test_hold_scopes() {
        let mut safety = SafetyManager::new(config(10, 10));
        let parent = root();
        let child = child_of(&parent);
        let other = root();

        safety.hold(HoldScope::Tree(parent.tree_id));
        assert!(safety.is_held(&parent));
        assert!(safety.is_held(&child));
        assert!(!safety.is_held(&other));

        safety.hold(HoldScope::System);
        assert_eq!(
            safety.check(&other, None),
            Err(SafetyViolation::Held {
                scope: HoldScope::System
            })
        );
    }

    #[test]
    fn test_step_grants_one_turn_under_tree_hold() {
        let mut safety = SafetyManager::new(config(10, 10));
        let task = root();
        safety.hold(HoldScope::Tree(task.tree_id));
        safety.clear_hold(&task);
        assert!(safety.check(&task, None).is_ok());
        safety.begin_invocation(&task);
        safety.end_invocation(task.id);
        assert!(safety.check(&task, None).is_err());
    }

    #[test]
    fn test_clear_hold_resets_counter() {
        let mut safety = SafetyManager::new(config(1, 10));
        let task = root();
        safety.hold(HoldScope::Task(task.id));
        safety.begin_invocation(&task);
        safety.end_invocation(task.id);
        safety.clear_hold(&task);
        assert_eq!(safety.consecutive(task.tree_id), 0);
        assert!(safety.check(&task, None).is_ok());
    }

    #[test]
    fn test_release_and_forget() {
        let mut safety = SafetyManager::new(config(10, 10));
        let task = root();
        safety.begin_invocation(&task);
        safety.hold(HoldScope::Task(task.id));
        safety.arm_deadline(task.id, Duration::from_secs(1), Instant::now());
        safety.release(task.id);
        assert_eq!(safety.in_flight(), 0);
        assert!(!safety.has_deadlines());
        assert!(safety.is_held(&task));
        safety.forget(task.id);
        assert!(!safety.is_held(&task));
    }

    #[test]
    fn test_deadlines_expire_once() {
        let mut safety = SafetyManager::new(config(10, 10));
        let a = TaskId::new();
        let b = TaskId::new();
        let start = Instant::now();
        safety.arm_deadline(a, Duration::from_millis(100), start);
        safety.arm_deadline(b, Duration::from_millis(500), start);

        assert!(safety.expired(start).is_empty());
        assert_eq!(safety.expired(start + Duration::from_millis(100)), vec![a]);
        assert!(safety.expired(start + Duration::from_millis(200)).is_empty());
        assert_eq!(safety.expired(start + Duration::from_secs(1)), vec![b]);
    }

    #[test]
    fn test_violation_into_error() {
        let err: Error = SafetyViolation::Concurrency { limit: 4 }.into();
        assert!(matches!(err, Error::SafetyLimitExceeded { .. }));
        assert_eq!(err.kind(), ErrorKind::SafetyLimitExceeded);
    }
}
