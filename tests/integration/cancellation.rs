//! Cancellation, deadline and isolation tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use conductor::config::Config;
use conductor::core::task::NewTask;
use conductor::core::TaskState;
use conductor::error::{ErrorKind, Result};
use conductor::orchestration::{ReasoningWorker, WorkerReply, WorkerRequest};
use conductor::testing::{ScriptStep, ScriptedWorker};

use crate::fixtures::{decompose, finish, wait_for, Harness};

/// Decomposes "Compile" tasks, finishes "Independent" ones and never
/// answers anything else.
struct Stalling;

#[async_trait]
impl ReasoningWorker for Stalling {
    async fn invoke(&self, request: WorkerRequest) -> Result<WorkerReply> {
        let instruction = request
            .conversation
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if instruction.starts_with("Compile") {
            return Ok(decompose(&["part one", "part two"]));
        }
        if instruction.starts_with("Independent") {
            return Ok(ScriptedWorker::finish(json!("independent")));
        }
        std::future::pending::<()>().await;
        Ok(WorkerReply::default())
    }
}

/// Test: Cancel a waiting parent
/// Given a parent waiting on two sub-tasks whose worker calls never return
/// When the parent is cancelled
/// Then parent and sub-tasks fail as cancelled and an unrelated tree completes
#[tokio::test]
async fn test_cancel_reaches_descendants_only() {
    let mut h = Harness::new(Arc::new(Stalling));
    let handle = h.handle.clone();

    let parent = handle.submit(NewTask::new("Compile the dossier")).await.unwrap();
    let other = handle.submit(NewTask::new("Independent work")).await.unwrap();

    let driver = async {
        let task = wait_for(&handle, parent, |t| t.state == TaskState::WaitingOnDependencies).await;
        loop {
            let children: Vec<_> = handle
                .list_tree(task.tree_id)
                .await
                .unwrap()
                .into_iter()
                .filter(|t| t.parent_id == Some(parent))
                .collect();
            if children.len() == 2
                && children.iter().all(|c| c.state == TaskState::AgentResponding)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.cancel(parent, "operator").await.unwrap();
    };
    tokio::join!(h.engine.run_until_idle(), driver);

    let task = h.task(parent).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::Cancelled);

    let children = h.children(parent).await;
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.state, TaskState::Failed);
        assert_eq!(child.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    }

    assert_eq!(h.task(other).await.state, TaskState::Completed);
    assert_eq!(h.engine.safety().in_flight(), 0);
}

#[tokio::test]
async fn test_deadline_cancels_stalled_task() {
    let mut config = Config::default();
    config.runtime.deadline_check_ms = 10;
    let mut h = Harness::with_config(config, Arc::new(Stalling));
    let handle = h.handle.clone();

    let id = handle
        .submit(NewTask::new("Stall until the deadline").with_deadline_ms(50))
        .await
        .unwrap();

    let driver = async {
        let task = wait_for(&handle, id, |t| t.is_finished()).await;
        handle.shutdown();
        task
    };
    let (run, task) = tokio::join!(h.engine.run(), driver);
    run.unwrap();

    assert_eq!(task.state, TaskState::Failed);
    let error = task.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.message.contains("50 ms"));
}

#[tokio::test]
async fn test_worker_failure_stays_in_its_tree() {
    let mut config = Config::default();
    config.retry.max_attempts = 1;
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("Broken task", [ScriptStep::Fail("backend down".to_string())])
            .on("Healthy task", [finish("fine")]),
    );
    let mut h = Harness::with_config(config, worker);

    let broken = h.handle.submit(NewTask::new("Broken task")).await.unwrap();
    let healthy = h.handle.submit(NewTask::new("Healthy task")).await.unwrap();
    h.settle().await;

    let failed = h.task(broken).await;
    assert_eq!(failed.state, TaskState::Failed);
    let error = failed.error.unwrap();
    assert_eq!(error.kind, ErrorKind::WorkerInvocationFailed);
    assert!(error.message.contains("backend down"));

    let ok = h.task(healthy).await;
    assert_eq!(ok.state, TaskState::Completed);
    assert_eq!(ok.result, Some(json!("fine")));
    assert_ne!(ok.tree_id, failed.tree_id);
}

#[tokio::test]
async fn test_cancel_of_finished_task_is_a_no_op() {
    let mut h = Harness::new(Arc::new(ScriptedWorker::new().then(finish("done"))));
    let id = h.run(NewTask::new("Quick task")).await;
    let before = h.task(id).await;

    h.handle.cancel(id, "too late").await.unwrap();
    h.settle().await;

    assert_eq!(h.task(id).await, before);
}
