//! Event log replay tests.

use std::sync::Arc;

use tempfile::TempDir;

use conductor::core::event_log::EventLog;
use conductor::core::task::NewTask;
use conductor::core::TaskState;
use conductor::orchestration::{replay, replay_file, Collaborators};
use conductor::process::InMemoryProcessRegistry;
use conductor::store::InMemoryTaskStore;
use conductor::testing::ScriptedWorker;

use crate::fixtures::{decompose, finish, logged_config, Harness};

fn collaborators(store: Arc<InMemoryTaskStore>) -> Collaborators {
    Collaborators::new(
        store,
        Arc::new(InMemoryProcessRegistry::with_builtins().unwrap()),
        Arc::new(ScriptedWorker::new()),
    )
}

/// Test: Replay determinism
/// Given the event log of a run with fan-out, failures and tool calls
/// When the log is replayed twice into fresh stores
/// Then both snapshots are byte-identical to each other and to the live run
#[tokio::test]
async fn test_replay_reproduces_live_state() {
    let dir = TempDir::new().unwrap();
    let config = logged_config(&dir);
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("Write the guide", [decompose(&["install step", "usage step"]), finish("guide")])
            .on("install step", [finish("install written")])
            .on("usage step", [conductor::testing::ScriptStep::Fail("flaky".to_string())])
            .with_default(finish("fallback")),
    );
    let mut live_config = config.clone();
    live_config.retry.max_attempts = 1;
    let mut h = Harness::with_config(live_config, worker);
    let root = h.run(NewTask::new("Write the guide")).await;
    h.run(NewTask::new("Second root")).await;

    assert_eq!(h.task(root).await.state, TaskState::Completed);
    let live = h.store.snapshot().await.unwrap();
    let log = config.runtime.event_log.clone().unwrap();
    drop(h);

    let first_store = Arc::new(InMemoryTaskStore::new());
    let first = replay_file(&log, config.clone(), collaborators(first_store.clone()))
        .await
        .unwrap();
    let second_store = Arc::new(InMemoryTaskStore::new());
    let second = replay_file(&log, config.clone(), collaborators(second_store.clone()))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.events, EventLog::read(&log).unwrap().len());
    let a = first_store.snapshot().await.unwrap();
    let b = second_store.snapshot().await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a, live);
}

#[tokio::test]
async fn test_replay_of_prefix_matches_intermediate_state() {
    let dir = TempDir::new().unwrap();
    let config = logged_config(&dir);
    let worker = Arc::new(ScriptedWorker::new().then(finish("done")));
    let mut h = Harness::with_config(config.clone(), worker);
    let id = h.run(NewTask::new("Short task")).await;
    drop(h);

    let log = config.runtime.event_log.clone().unwrap();
    let records = EventLog::read(&log).unwrap();
    // created, agent turn, worker response, task_completed
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].event_type, "task_created");

    let store = Arc::new(InMemoryTaskStore::new());
    replay(records[..2].to_vec(), config, collaborators(store.clone()))
        .await
        .unwrap();
    let task = conductor::store::TaskStore::get_task(store.as_ref(), id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.state, TaskState::AgentResponding);
}
