//! Append-only JSON-lines event log.
//!
//! Every processed event is written as one line:
//! `{id, type, task_id, timestamp, payload, recorded_at}`. The log is the
//! input to replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::event::{EventId, EventKind, RuntimeEvent};
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub task_id: Option<TaskId>,
    /// Logical timestamp (same as `id`).
    pub timestamp: u64,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

impl From<&RuntimeEvent> for EventRecord {
    fn from(event: &RuntimeEvent) -> Self {
        let (event_type, payload) = match serde_json::to_value(&event.kind) {
            Ok(Value::Object(mut map)) => (
                map.remove("type")
                    .and_then(|t| t.as_str().map(str::to_string))
                    .unwrap_or_else(|| event.kind.name().to_string()),
                map.remove("payload").unwrap_or(Value::Null),
            ),
            _ => (event.kind.name().to_string(), Value::Null),
        };
        Self {
            id: event.id.0,
            event_type,
            task_id: event.task_id,
            timestamp: event.id.0,
            payload,
            recorded_at: Utc::now(),
        }
    }
}

impl TryFrom<EventRecord> for RuntimeEvent {
    type Error = Error;

    fn try_from(record: EventRecord) -> Result<Self> {
        let kind: EventKind = serde_json::from_value(serde_json::json!({
            "type": record.event_type,
            "payload": record.payload,
        }))?;
        Ok(RuntimeEvent {
            id: EventId(record.id),
            task_id: record.task_id,
            kind,
        })
    }
}

/// Writer for the event log file.
pub struct EventLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl EventLog {
    /// Open (or create) a log for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush it to disk.
    pub fn append(&mut self, event: &RuntimeEvent) -> Result<()> {
        let record = EventRecord::from(event);
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read every record from a log, skipping blank lines.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<EventRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{InvocationId, ToolCall};
    use crate::core::task::NewTask;
    use tempfile::TempDir;

    #[test]
    fn test_record_fields() {
        let id = TaskId::new();
        let event = RuntimeEvent {
            id: EventId(12),
            task_id: Some(id),
            kind: EventKind::TaskCompleted {
                result: serde_json::json!("done"),
            },
        };
        let record = EventRecord::from(&event);
        assert_eq!(record.id, 12);
        assert_eq!(record.timestamp, 12);
        assert_eq!(record.event_type, "task_completed");
        assert_eq!(record.payload["result"], "done");

        let line = serde_json::to_value(&record).unwrap();
        assert_eq!(line["type"], "task_completed");
        assert!(line.get("recorded_at").is_some());
    }

    #[test]
    fn test_log_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let spec = NewTask::new("summarize");
        let task_id = spec.id;

        let events = vec![
            RuntimeEvent {
                id: EventId(1),
                task_id: Some(task_id),
                kind: EventKind::TaskCreated { spec },
            },
            RuntimeEvent {
                id: EventId(2),
                task_id: Some(task_id),
                kind: EventKind::WorkerResponse {
                    invocation: InvocationId(1),
                    text: "ok".to_string(),
                    tool_calls: vec![ToolCall::new("end_task", serde_json::json!({}))],
                },
            },
        ];

        let mut log = EventLog::open(&path).unwrap();
        for event in &events {
            log.append(event).unwrap();
        }
        drop(log);

        let records = EventLog::read(&path).unwrap();
        assert_eq!(records.len(), 2);
        let restored: Vec<RuntimeEvent> = records
            .into_iter()
            .map(RuntimeEvent::try_from)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(restored, events);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let record = EventRecord {
            id: 1,
            event_type: "mystery".to_string(),
            task_id: None,
            timestamp: 1,
            payload: Value::Null,
            recorded_at: Utc::now(),
        };
        assert!(RuntimeEvent::try_from(record).is_err());
    }
}
