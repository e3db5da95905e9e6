//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building an engine over an in-memory store and a scripted worker
//! - Canned worker replies
//! - Polling a running engine

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use conductor::config::Config;
use conductor::core::event::ToolCall;
use conductor::core::task::{NewTask, Task, TaskId};
use conductor::orchestration::{Collaborators, EngineHandle, ReasoningWorker, RuntimeEngine, WorkerReply};
use conductor::process::InMemoryProcessRegistry;
use conductor::store::{InMemoryTaskStore, TaskStore};
use conductor::testing::ScriptedWorker;

/// An engine wired to an in-memory store.
pub struct Harness {
    pub engine: RuntimeEngine,
    pub handle: EngineHandle,
    pub store: Arc<InMemoryTaskStore>,
}

impl Harness {
    pub fn new(worker: Arc<dyn ReasoningWorker>) -> Self {
        Self::with_config(Config::default(), worker)
    }

    pub fn with_config(config: Config, worker: Arc<dyn ReasoningWorker>) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = InMemoryProcessRegistry::with_builtins().expect("builtin processes");
        let collaborators = Collaborators::new(store.clone(), Arc::new(registry), worker);
        let engine = RuntimeEngine::new(config, collaborators).expect("engine");
        let handle = engine.handle();
        Self {
            engine,
            handle,
            store,
        }
    }

    /// Submit a task and process everything that follows from it.
    pub async fn run(&mut self, spec: NewTask) -> TaskId {
        let id = self.handle.submit(spec).await.expect("submit");
        self.settle().await;
        id
    }

    pub async fn settle(&mut self) -> usize {
        self.engine.run_until_idle().await
    }

    pub async fn task(&self, id: TaskId) -> Task {
        self.store
            .get_task(id)
            .await
            .expect("store")
            .expect("task exists")
    }

    pub async fn children(&self, parent: TaskId) -> Vec<Task> {
        let parent = self.task(parent).await;
        self.store
            .list_tree(parent.tree_id)
            .await
            .expect("store")
            .into_iter()
            .filter(|t| t.parent_id == Some(parent.id))
            .collect()
    }
}

/// A worker reply that calls `decompose` with the given parts.
pub fn decompose(parts: &[&str]) -> WorkerReply {
    WorkerReply::text("splitting").with_call(ToolCall::new("decompose", json!({ "parts": parts })))
}

pub fn finish(result: &str) -> WorkerReply {
    ScriptedWorker::finish(json!(result))
}

/// Default config with the event log in `dir`.
pub fn logged_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.runtime.event_log = Some(dir.path().join("events.jsonl"));
    config
}

/// Poll the store until `check` holds or five seconds pass.
pub async fn wait_for<F>(handle: &EngineHandle, id: TaskId, check: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(task) = handle.get_task(id).await.expect("store") {
            if check(&task) {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on task {}",
            id
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
