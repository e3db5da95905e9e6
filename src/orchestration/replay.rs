//! Rebuild task state by feeding a recorded event log through the engine.
//!
//! Replay runs the same handlers as live operation. Derived events are not
//! re-emitted (the log already holds them, in processing order) and the
//! worker is never called: its replies are `worker_response` records.

use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::core::event::{EventId, RuntimeEvent};
use crate::core::event_log::{EventLog, EventRecord};
use crate::error::{Error, Result};
use crate::orchestration::engine::{Collaborators, RuntimeEngine};
use crate::orchestration::worker::DetachedWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub events: usize,
    pub last_event: EventId,
}

/// Apply `records` in order to `collaborators.store`.
///
/// Tree limit overrides are not events; set them on the store first if the
/// recorded run used any.
pub async fn replay(
    records: Vec<EventRecord>,
    mut config: Config,
    mut collaborators: Collaborators,
) -> Result<ReplayOutcome> {
    config.runtime.event_log = None;
    collaborators.worker = Arc::new(DetachedWorker);
    let mut engine = RuntimeEngine::new(config, collaborators)?.into_replay();

    let mut last = EventId(0);
    let mut events = 0;
    for record in records {
        let event = RuntimeEvent::try_from(record)?;
        if event.id <= last {
            return Err(Error::Validation(format!(
                "event log out of order: {} after {}",
                event.id, last
            )));
        }
        last = event.id;
        engine.process_event(event).await;
        events += 1;
    }

    info!(events, last_event = %last, "replay finished");
    Ok(ReplayOutcome {
        events,
        last_event: last,
    })
}

/// Read a log file and replay it.
pub async fn replay_file(
    path: impl AsRef<Path>,
    config: Config,
    collaborators: Collaborators,
) -> Result<ReplayOutcome> {
    let records = EventLog::read(path)?;
    replay(records, config, collaborators).await
}
