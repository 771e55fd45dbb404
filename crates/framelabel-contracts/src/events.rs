use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Lifecycle events of one labeling run, one line each in `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        input_dir: String,
        output_dir: String,
        concurrency: usize,
        client: String,
    },
    ScanCompleted {
        candidates: usize,
        done: usize,
        cached: usize,
        pending: usize,
        skipped_snapshots: usize,
    },
    ItemLabeled {
        item_id: String,
        malformed: bool,
    },
    ItemFailed {
        item_id: String,
        error: String,
    },
    AggregationCompleted {
        drained: usize,
        rejected: usize,
        labels: usize,
        snapshot: Option<String>,
    },
    RunFinished {
        status: String,
        completed: usize,
        failed: usize,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::ScanCompleted { .. } => "scan_completed",
            Self::ItemLabeled { .. } => "item_labeled",
            Self::ItemFailed { .. } => "item_failed",
            Self::AggregationCompleted { .. } => "aggregation_completed",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

/// Append-only writer for `events.jsonl`.
///
/// Every line carries `type`, `run_id` and `ts` next to the event fields.
/// Clones share one file handle lock so lines from different threads never
/// interleave.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event: &RunEvent) -> anyhow::Result<Value> {
        let mut line = Map::new();
        line.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(fields) = serde_json::to_value(event)? {
            for (key, value) in fields {
                line.insert(key, value);
            }
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let encoded = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_tagged_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let emitted = writer.emit(&RunEvent::ItemFailed {
            item_id: "frame_0001".to_string(),
            error: "timeout".to_string(),
        })?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("item_failed".to_string()));
        assert_eq!(parsed["run_id"], Value::String("run-123".to_string()));
        assert_eq!(parsed["item_id"], Value::String("frame_0001".to_string()));
        assert_eq!(parsed["error"], Value::String("timeout".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn kind_matches_serialized_tag() -> anyhow::Result<()> {
        let event = RunEvent::AggregationCompleted {
            drained: 2,
            rejected: 0,
            labels: 3,
            snapshot: None,
        };
        let value = serde_json::to_value(&event)?;
        assert_eq!(value["type"], Value::String(event.kind().to_string()));
        assert_eq!(value["snapshot"], Value::Null);
        Ok(())
    }

    #[test]
    fn emit_appends_lines_across_clones() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");
        let clone = writer.clone();

        writer.emit(&RunEvent::ItemLabeled {
            item_id: "a".to_string(),
            malformed: false,
        })?;
        clone.emit(&RunEvent::RunFinished {
            status: "ok".to_string(),
            completed: 1,
            failed: 0,
        })?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["type"], Value::String("item_labeled".to_string()));
        assert_eq!(second["type"], Value::String("run_finished".to_string()));
        assert_eq!(second["completed"], Value::from(1));
        Ok(())
    }
}
