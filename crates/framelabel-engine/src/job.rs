use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use framelabel_contracts::events::{EventWriter, RunEvent};
use framelabel_contracts::labels::LabelSet;
use framelabel_contracts::runs::summary::{write_summary, FailedItem, RunStatus, RunSummary};
use serde_json::{Map, Value};

use crate::aggregator::aggregate_cache;
use crate::client::LabelClient;
use crate::config::LabelJobConfig;
use crate::pool::{ShutdownHandle, WorkerPool};
use crate::processor::ItemProcessor;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub candidates: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: Vec<FailedItem>,
    pub not_started: Vec<String>,
    /// Ids whose unreadable cache entries were moved aside this run.
    pub rejected: Vec<String>,
    /// The label set written as the current artifact (empty when there was
    /// no work).
    pub labels: LabelSet,
    pub snapshot_path: Option<PathBuf>,
}

impl RunOutcome {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// One resumable labeling run over `config.input_dir`.
pub struct LabelJob {
    config: LabelJobConfig,
    client: Arc<dyn LabelClient>,
    run_id: String,
    events: EventWriter,
    shutdown: ShutdownHandle,
}

impl LabelJob {
    pub fn new(config: LabelJobConfig, client: Arc<dyn LabelClient>) -> Self {
        let run_id = new_run_id();
        let events = EventWriter::new(config.layout.events(), run_id.clone());
        Self {
            config,
            client,
            run_id,
            events,
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &LabelJobConfig {
        &self.config
    }

    /// Requesting shutdown stops new dispatches; finished items are still
    /// aggregated.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn run(&self) -> Result<RunOutcome> {
        let started_at = now_utc_iso();
        let layout = &self.config.layout;
        self.events.emit(&RunEvent::RunStarted {
            input_dir: self.config.input_dir.to_string_lossy().to_string(),
            output_dir: layout.root().to_string_lossy().to_string(),
            concurrency: self.config.concurrency,
            client: self.client.name().to_string(),
        })?;
        tracing::info!(run_id = %self.run_id, client = self.client.name(), "run started");

        let scan = self.config.scanner().scan(&self.config.input_dir)?;
        self.events.emit(&RunEvent::ScanCompleted {
            candidates: scan.candidates.len(),
            done: scan.done.len(),
            cached: scan.cached.len(),
            pending: scan.pending.len(),
            skipped_snapshots: scan.skipped_snapshots.len(),
        })?;

        let mut outcome = RunOutcome {
            run_id: self.run_id.clone(),
            status: RunStatus::NoNewWork,
            candidates: scan.candidates.len(),
            dispatched: 0,
            completed: 0,
            failed: Vec::new(),
            not_started: Vec::new(),
            rejected: Vec::new(),
            labels: LabelSet::new(),
            snapshot_path: None,
        };

        if !scan.has_new_work() && !layout.cache().exists() {
            tracing::info!("no new work");
            self.finish(&started_at, &outcome, scan.pending.len())?;
            return Ok(outcome);
        }

        let processor = Arc::new(
            ItemProcessor::new(
                Arc::clone(&self.client),
                self.config.prompt.clone(),
                layout.cache(),
            )
            .with_max_image_dim(self.config.max_image_dim),
        );
        let pool = WorkerPool::new(self.config.concurrency)
            .with_deadline(self.config.deadline)
            .with_shutdown(self.shutdown.clone());

        outcome.dispatched = scan.pending.len();
        let events = self.events.clone();
        let report = pool.run(scan.pending.clone(), processor, |item, result| {
            let event = match result {
                Ok(label) => RunEvent::ItemLabeled {
                    item_id: item.id.clone(),
                    malformed: label.is_none(),
                },
                Err(err) => RunEvent::ItemFailed {
                    item_id: item.id.clone(),
                    error: err.to_string(),
                },
            };
            if let Err(err) = events.emit(&event) {
                tracing::warn!(item_id = %item.id, error = %err, "event write failed");
            }
        })?;

        let aggregation = aggregate_cache(layout, report.results)?;
        self.events.emit(&RunEvent::AggregationCompleted {
            drained: aggregation.drained,
            rejected: aggregation.rejected.len(),
            labels: aggregation.labels.len(),
            snapshot: Some(aggregation.snapshot_path.to_string_lossy().to_string()),
        })?;

        outcome.completed = report.completed;
        outcome.failed = report.failed;
        outcome.not_started = report.not_started;
        outcome.rejected = aggregation.rejected;
        outcome.labels = aggregation.labels;
        outcome.snapshot_path = Some(aggregation.snapshot_path);
        outcome.status = if !outcome.not_started.is_empty() {
            RunStatus::Interrupted
        } else if !outcome.failed.is_empty() {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        };

        for failed in &outcome.failed {
            tracing::warn!(item_id = %failed.id, error = %failed.error, "not labeled this run");
        }
        self.finish(&started_at, &outcome, scan.pending.len())?;
        Ok(outcome)
    }

    fn finish(&self, started_at: &str, outcome: &RunOutcome, pending: usize) -> Result<()> {
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            status: outcome.status.clone(),
            started_at: started_at.to_string(),
            finished_at: now_utc_iso(),
            candidates: outcome.candidates as u64,
            pending: pending as u64,
            completed: outcome.completed as u64,
            labels: outcome.labels.len() as u64,
            failed: outcome.failed.clone(),
            malformed: outcome.labels.malformed_ids(),
            not_started: outcome.not_started.clone(),
            rejected: outcome.rejected.clone(),
            snapshot_path: outcome
                .snapshot_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
        };
        let mut extra = Map::new();
        extra.insert(
            "client".to_string(),
            Value::String(self.client.name().to_string()),
        );
        write_summary(&self.config.layout.summary(), &summary, Some(&extra))?;

        self.events.emit(&RunEvent::RunFinished {
            status: outcome.status.as_str().to_string(),
            completed: outcome.completed,
            failed: outcome.failed.len(),
        })?;
        tracing::info!(
            run_id = %self.run_id,
            status = outcome.status.as_str(),
            completed = outcome.completed,
            failed = outcome.failed.len(),
            "run finished"
        );
        Ok(())
    }
}

fn new_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{stamp}-{}", &suffix[..8])
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
