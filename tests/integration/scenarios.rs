//! End-to-end scenarios: default process, agent loop, sub-task fan-out.

use std::sync::Arc;

use serde_json::json;

use conductor::core::dag::{DependencyGraph, EdgeOutcome};
use conductor::core::event::{EventId, EventKind, RuntimeEvent, ToolCall};
use conductor::core::task::{NewTask, Role, TaskId};
use conductor::core::TaskState;
use conductor::error::{Error, ErrorKind};
use conductor::orchestration::WorkerReply;
use conductor::testing::ScriptedWorker;

use crate::fixtures::{decompose, finish, Harness};

/// Test: Scenario A
/// Given a task with no dependencies and the default process
/// When its creation event is handled
/// Then it is READY_FOR_AGENT with an agent assigned and the worker untouched
#[tokio::test]
async fn test_default_process_reaches_agent_without_worker() {
    let worker = Arc::new(ScriptedWorker::new().then(finish("done")));
    let mut h = Harness::new(worker.clone());

    let spec = NewTask::new("Summarize the meeting notes");
    let id = spec.id;
    h.engine
        .process_event(RuntimeEvent {
            id: EventId(1),
            task_id: Some(id),
            kind: EventKind::TaskCreated { spec },
        })
        .await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::ReadyForAgent);
    assert_eq!(task.assigned_agent.as_deref(), Some("generalist"));
    assert!(task.additional_tools.contains("end_task"));
    assert_eq!(worker.invocations(), 0);

    // The queued agent turn then runs the worker once.
    h.settle().await;
    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(worker.invocations(), 1);
}

/// Test: Scenario B
/// Given a worker reply calling decompose(parts=[alpha, beta])
/// When the reply is dispatched
/// Then two sub-tasks exist and the parent waits until both terminate
#[tokio::test]
async fn test_decompose_waits_for_both_parts() {
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("Write the report", [decompose(&["alpha section", "beta section"]), finish("report")])
            .on("alpha section", [finish("alpha done")])
            .on("beta section", [finish("beta done")]),
    );
    let mut h = Harness::new(worker.clone());
    let parent = h.run(NewTask::new("Write the report")).await;

    let task = h.task(parent).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.result, Some(json!("report")));
    assert!(task.dependencies.is_empty());

    let children = h.children(parent).await;
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.state == TaskState::Completed));
    assert!(children.iter().all(|c| c.depth == 1 && c.tree_id == task.tree_id));
    assert!(children.iter().all(|c| c.process.as_deref() == Some("decompose")));

    // The parent left WAITING_ON_DEPENDENCIES only after both children finished.
    let waited = task
        .history
        .iter()
        .find(|r| r.from == TaskState::WaitingOnDependencies)
        .expect("parent waited");
    assert_eq!(waited.to, TaskState::ReadyForAgent);
    for child in &children {
        let finished = child.history.last().expect("child history").event;
        assert!(finished < waited.event);
    }

    // Its next turn saw one report per part.
    let requests = worker.requests();
    let second = requests
        .iter()
        .filter(|r| r.task_id == parent)
        .nth(1)
        .expect("second parent turn");
    let reports: Vec<&str> = second
        .conversation
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().any(|r| r.contains("alpha done")));
    assert!(reports.iter().any(|r| r.contains("beta done")));
}

/// Test: Scenario D
/// Given A blocked-by B
/// When B blocked-by A is added in the same batch
/// Then the batch is rejected and neither edge remains
#[test]
fn test_mutual_dependency_rejected() {
    let a = TaskId::new();
    let b = TaskId::new();
    let mut graph = DependencyGraph::new();
    graph.add_task(a);
    graph.add_task(b);

    let err = graph.add_dependencies(&[(a, b), (b, a)]).unwrap_err();
    assert!(matches!(err, Error::CyclicDependency { .. }));
    assert!(graph.blockers(a).is_empty());
    assert!(graph.blockers(b).is_empty());
    assert_eq!(graph.dependency_count(), 0);

    // Adding them one at a time rejects only the second.
    assert_eq!(graph.add_dependency(a, b).unwrap(), EdgeOutcome::Added);
    assert!(graph.add_dependency(b, a).is_err());
    assert_eq!(graph.blockers(a), vec![b]);
    assert!(graph.blockers(b).is_empty());
}

#[tokio::test]
async fn test_failed_child_does_not_fail_parent() {
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("Plan the trip", [decompose(&["book flights", "book hotel"]), finish("planned")])
            .on("book flights", [finish("flights booked")])
            .on(
                "book hotel",
                [WorkerReply::text("no rooms").with_call(ToolCall::new(
                    "end_task",
                    json!({"outcome": "failed", "reason": "no rooms left"}),
                ))],
            ),
    );
    let mut h = Harness::new(worker.clone());
    let parent = h.run(NewTask::new("Plan the trip")).await;

    let task = h.task(parent).await;
    assert_eq!(task.state, TaskState::Completed);

    let children = h.children(parent).await;
    let hotel = children
        .iter()
        .find(|c| c.instruction == "book hotel")
        .expect("hotel child");
    assert_eq!(hotel.state, TaskState::Failed);
    assert_eq!(hotel.error.as_ref().unwrap().kind, ErrorKind::AgentReported);

    let second = worker
        .requests()
        .into_iter()
        .filter(|r| r.task_id == parent)
        .nth(1)
        .expect("second parent turn");
    assert!(second
        .conversation
        .iter()
        .any(|m| m.content.contains("failed") && m.content.contains("no rooms left")));
}

#[tokio::test]
async fn test_request_context_completes_without_worker() {
    let worker = Arc::new(ScriptedWorker::new().on(
        "Plan the launch",
        [
            WorkerReply::text("need the style guide").with_call(ToolCall::new(
                "request_context",
                json!({"documents": ["style-guide"]}),
            )),
            finish("launch plan"),
        ],
    ));
    let mut h = Harness::new(worker.clone());
    let parent = h.run(NewTask::new("Plan the launch")).await;

    assert_eq!(h.task(parent).await.state, TaskState::Completed);
    let children = h.children(parent).await;
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.state, TaskState::Completed);
    assert_eq!(
        child.result.as_ref().unwrap()["summary"],
        json!("Attached 1 document(s)")
    );
    // Only the parent's two turns reached the worker.
    assert_eq!(worker.invocations(), 2);
}

#[tokio::test]
async fn test_deterministic_tools_feed_next_turn() {
    let worker = Arc::new(ScriptedWorker::new().on(
        "Review the draft",
        [
            WorkerReply::text("").with_call(ToolCall::new(
                "add_context",
                json!({"documents": ["draft-v2"]}),
            )),
            finish("reviewed"),
        ],
    ));
    let mut h = Harness::new(worker.clone());
    let id = h.run(NewTask::new("Review the draft")).await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert!(task.additional_context.contains("draft-v2"));

    let requests = worker.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].context.contains(&"draft-v2".to_string()));
    assert!(requests[1]
        .conversation
        .iter()
        .any(|m| m.role == Role::Tool && m.tool.as_deref() == Some("add_context")));
}

#[tokio::test]
async fn test_task_waits_on_declared_dependency() {
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("gather data", [finish("data")])
            .on("analyse data", [finish("analysis")]),
    );
    let mut h = Harness::new(worker.clone());
    let first = NewTask::new("gather data");
    let first_id = first.id;
    let second = NewTask::new("analyse data").with_dependencies(vec![first_id]);
    let second_id = second.id;

    h.handle.submit(first).await.unwrap();
    h.handle.submit(second).await.unwrap();
    h.settle().await;

    let a = h.task(first_id).await;
    let b = h.task(second_id).await;
    assert_eq!(a.state, TaskState::Completed);
    assert_eq!(b.state, TaskState::Completed);
    assert!(b.history.iter().any(|r| r.to == TaskState::WaitingOnDependencies));
    let started = b
        .history
        .iter()
        .find(|r| r.from == TaskState::WaitingOnDependencies)
        .unwrap()
        .event;
    assert!(a.history.last().unwrap().event < started);
}

#[tokio::test]
async fn test_unknown_process_is_reported_and_fails() {
    let mut h = Harness::new(Arc::new(ScriptedWorker::new()));
    let id = h.run(NewTask::new("x").with_process("no-such-process")).await;

    let task = h.task(id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error.unwrap().kind, ErrorKind::ProcessMalformed);
}
