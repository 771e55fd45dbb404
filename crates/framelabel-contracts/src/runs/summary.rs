use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithFailures,
    NoNewWork,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithFailures => "completed_with_failures",
            Self::NoNewWork => "no_new_work",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: String,
    pub finished_at: String,
    pub candidates: u64,
    pub pending: u64,
    pub completed: u64,
    pub labels: u64,
    pub failed: Vec<FailedItem>,
    pub malformed: Vec<String>,
    pub not_started: Vec<String>,
    /// Ids whose cache entries were unreadable and moved aside; they are
    /// pending again.
    #[serde(default)]
    pub rejected: Vec<String>,
    pub snapshot_path: Option<String>,
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, FailedItem, RunStatus, RunSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let summary = RunSummary {
            run_id: "run-123".to_string(),
            status: RunStatus::CompletedWithFailures,
            started_at: "2026-10-19T00:00:00+00:00".to_string(),
            finished_at: "2026-10-19T00:10:00+00:00".to_string(),
            candidates: 3,
            pending: 3,
            completed: 2,
            labels: 2,
            failed: vec![FailedItem {
                id: "f1".to_string(),
                error: "remote call failed".to_string(),
            }],
            malformed: Vec::new(),
            not_started: Vec::new(),
            rejected: vec!["f2".to_string()],
            snapshot_path: Some("/out/snapshots/labels_x.json".to_string()),
        };
        let mut extra = Map::new();
        extra.insert("client".to_string(), Value::String("dryrun".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["status"], json!(RunStatus::CompletedWithFailures.as_str()));
        assert_eq!(parsed["failed"][0]["id"], json!("f1"));
        assert_eq!(parsed["rejected"], json!(["f2"]));
        assert_eq!(parsed["client"], json!("dryrun"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
