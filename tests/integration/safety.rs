//! Safety integration tests: call ceilings, worker concurrency, holds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use conductor::config::Config;
use conductor::core::event_log::EventLog;
use conductor::core::event::HoldScope;
use conductor::core::task::{NewTask, TreeId};
use conductor::core::TaskState;
use conductor::error::{ErrorKind, Result};
use conductor::orchestration::{ReasoningWorker, WorkerReply, WorkerRequest};
use conductor::store::TreeLimits;
use conductor::testing::ScriptedWorker;
use tempfile::TempDir;
use tokio_test::assert_ok;

use crate::fixtures::{finish, logged_config, Harness};

/// Records how many calls overlap.
#[derive(Default)]
struct Overlap {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ReasoningWorker for Overlap {
    async fn invoke(&self, _request: WorkerRequest) -> Result<WorkerReply> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ScriptedWorker::finish(json!("ok")))
    }
}

/// Test: Scenario C
/// Given a tree with a consecutive-call ceiling of 10
/// When the worker keeps answering without a terminal tool call
/// Then the 11th attempt holds the task instead of invoking the worker
#[tokio::test]
async fn test_consecutive_ceiling_holds_eleventh_attempt() {
    let worker = Arc::new(ScriptedWorker::new().with_default(WorkerReply::text("still thinking")));
    let mut h = Harness::new(worker.clone());

    let spec = NewTask::new("Think forever");
    let id = spec.id;
    let tree = TreeId::from(id);
    h.handle
        .set_tree_limits(
            tree,
            TreeLimits {
                max_consecutive_calls: Some(10),
            },
        )
        .await
        .unwrap();
    h.run(spec).await;

    let task = h.task(id).await;
    assert_eq!(worker.invocations(), 10);
    assert_eq!(task.state, TaskState::ManualHold);
    assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::SafetyLimitExceeded);
    assert_eq!(h.engine.safety().consecutive(tree), 10);

    let held = h.handle.list_held().await.unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].id, id);

    // Stepping resets the counter: ten more calls, then held again.
    assert_ok!(h.handle.step(id).await);
    h.settle().await;
    assert_eq!(worker.invocations(), 20);
    assert_eq!(h.task(id).await.state, TaskState::ManualHold);
}

#[tokio::test]
async fn test_terminal_call_resets_tree_counter() {
    let mut config = Config::default();
    config.safety.max_consecutive_calls = 3;
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("Outline the talk", [WorkerReply::text("hmm"), WorkerReply::text("ok"), finish("outline")]),
    );
    let mut h = Harness::with_config(config, worker.clone());
    let id = h.run(NewTask::new("Outline the talk")).await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(worker.invocations(), 3);
    assert_eq!(h.engine.safety().consecutive(task.tree_id), 0);
}

/// Test: Concurrency ceiling
/// Given a system-wide ceiling of one in-flight worker call
/// When a second task asks for a turn while the first is in flight
/// Then the second task is held and escalated instead of invoking the worker
#[tokio::test]
async fn test_concurrency_ceiling_holds_and_escalates() {
    let dir = TempDir::new().unwrap();
    let mut config = logged_config(&dir);
    config.safety.max_concurrent_workers = 1;
    let log = config.runtime.event_log.clone().unwrap();
    let worker = Arc::new(Overlap::default());
    let mut h = Harness::with_config(config, worker.clone());

    let first = h.handle.submit(NewTask::new("first")).await.unwrap();
    let second = h.handle.submit(NewTask::new("second")).await.unwrap();
    h.settle().await;

    assert_eq!(h.task(first).await.state, TaskState::Completed);
    let held = h.task(second).await;
    assert_eq!(held.state, TaskState::ManualHold);
    assert_eq!(held.error.as_ref().unwrap().kind, ErrorKind::SafetyLimitExceeded);
    assert_eq!(worker.peak.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.safety().in_flight(), 0);

    let escalations: Vec<_> = EventLog::read(&log)
        .unwrap()
        .into_iter()
        .filter(|r| r.event_type == "escalation_required")
        .collect();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].task_id, Some(second));

    // A step releases the held task once a slot is free.
    assert_ok!(h.handle.step(second).await);
    h.settle().await;
    assert_eq!(h.task(second).await.state, TaskState::Completed);
}

/// Test: Step only releases held tasks
/// Given a tree that has used some of its consecutive-call budget
/// When a step arrives for a task that is not on hold
/// Then the tree counter is untouched and the ceiling still applies
#[tokio::test]
async fn test_step_on_unheld_task_keeps_ceiling() {
    let mut config = Config::default();
    config.safety.max_consecutive_calls = 2;
    let worker = Arc::new(ScriptedWorker::new().with_default(WorkerReply::text("still thinking")));
    let mut h = Harness::with_config(config, worker.clone());

    let spec = NewTask::new("Think forever");
    let id = spec.id;
    h.handle.submit(spec).await.unwrap();
    // Queued behind the task's first events, before it reaches the ceiling.
    h.handle.step(id).await.unwrap();
    h.settle().await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::ManualHold);
    assert_eq!(worker.invocations(), 2);
    assert_eq!(h.engine.safety().consecutive(task.tree_id), 2);
}

#[tokio::test]
async fn test_system_hold_and_single_step() {
    let worker = Arc::new(
        ScriptedWorker::new()
            .then(WorkerReply::text("first pass"))
            .then(finish("done")),
    );
    let mut h = Harness::new(worker.clone());
    h.handle.hold(HoldScope::System).await.unwrap();
    let id = h.run(NewTask::new("Draft the memo")).await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::ManualHold);
    assert!(task.error.is_none());
    assert_eq!(worker.invocations(), 0);

    // One step buys exactly one turn while the system hold stays on.
    assert_ok!(h.handle.step(id).await);
    h.settle().await;
    assert_eq!(worker.invocations(), 1);
    assert_eq!(h.task(id).await.state, TaskState::ManualHold);

    assert_ok!(h.handle.step(id).await);
    h.settle().await;
    assert_eq!(worker.invocations(), 2);
    assert_eq!(h.task(id).await.state, TaskState::Completed);
}

#[tokio::test]
async fn test_tree_hold_leaves_other_trees_running() {
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("held tree", [finish("held")])
            .on("free tree", [finish("free")]),
    );
    let mut h = Harness::new(worker.clone());

    let held = NewTask::new("held tree");
    let held_id = held.id;
    h.handle
        .hold(HoldScope::Tree(TreeId::from(held_id)))
        .await
        .unwrap();
    h.handle.submit(held).await.unwrap();
    let free_id = h.run(NewTask::new("free tree")).await;

    assert_eq!(h.task(held_id).await.state, TaskState::ManualHold);
    assert_eq!(h.task(free_id).await.state, TaskState::Completed);
    assert_eq!(worker.invocations(), 1);
}
