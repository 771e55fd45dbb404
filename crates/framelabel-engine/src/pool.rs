use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use framelabel_contracts::labels::{LabelResult, LabelSet, WorkItem};
use framelabel_contracts::runs::summary::FailedItem;

use crate::config::DEFAULT_CONCURRENCY;
use crate::error::ItemError;
use crate::processor::ItemProcessor;

type Completion = (WorkItem, Result<LabelResult, ItemError>);

/// Cooperative stop signal. Once requested, workers start no new items;
/// items already in flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    /// Successful results in completion order.
    pub results: LabelSet,
    pub completed: usize,
    pub failed: Vec<FailedItem>,
    /// Items never started because of a shutdown or deadline.
    pub not_started: Vec<String>,
}

impl PoolReport {
    pub fn interrupted(&self) -> bool {
        !self.not_started.is_empty()
    }
}

pub struct WorkerPool {
    concurrency: usize,
    deadline: Option<Duration>,
    shutdown: ShutdownHandle,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            deadline: None,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Stop starting new items once `deadline` has elapsed since `run` began.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs `processor` over `pending` on up to `concurrency` threads.
    ///
    /// `observe` is called on the calling thread for each outcome as it
    /// arrives. Item failures are collected in the report; a cache write
    /// failure stops new work and is returned as the error once in-flight
    /// items have drained.
    pub fn run<F>(
        &self,
        pending: Vec<WorkItem>,
        processor: Arc<ItemProcessor>,
        mut observe: F,
    ) -> Result<PoolReport>
    where
        F: FnMut(&WorkItem, &Result<LabelResult, ItemError>),
    {
        let mut report = PoolReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        let started = Instant::now();
        let worker_count = self.concurrency.min(pending.len());

        let (job_tx, job_rx) = mpsc::channel::<WorkItem>();
        for item in pending {
            if job_tx.send(item).is_err() {
                break;
            }
        }
        drop(job_tx);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (done_tx, done_rx) = mpsc::channel::<Completion>();

        let mut handles = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let jobs = Arc::clone(&job_rx);
            let done = done_tx.clone();
            let processor = Arc::clone(&processor);
            let shutdown = self.shutdown.clone();
            let spawned = thread::Builder::new()
                .name(format!("framelabel-worker-{idx}"))
                .spawn(move || worker_loop(&jobs, &done, &processor, &shutdown));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => tracing::error!(worker = idx, error = %err, "worker spawn failed"),
            }
        }
        drop(done_tx);
        if handles.is_empty() {
            bail!("no worker threads could be started");
        }
        tracing::info!(workers = handles.len(), "worker pool started");

        let mut fatal: Option<ItemError> = None;
        loop {
            let next = match self.deadline {
                Some(limit) if !self.shutdown.is_requested() => {
                    let wait = limit.saturating_sub(started.elapsed());
                    match done_rx.recv_timeout(wait) {
                        Ok(completion) => Some(completion),
                        Err(RecvTimeoutError::Timeout) => {
                            tracing::warn!(
                                deadline_s = limit.as_secs_f64(),
                                "deadline reached; no new items will start"
                            );
                            self.shutdown.request();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => None,
                    }
                }
                _ => done_rx.recv().ok(),
            };
            let Some((item, outcome)) = next else {
                break;
            };

            observe(&item, &outcome);
            match outcome {
                Ok(result) => {
                    report.completed += 1;
                    report.results.insert(item.id, result);
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(item_id = %item.id, error = %err, "stopping run");
                    self.shutdown.request();
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        item_id = %item.id,
                        error = %err,
                        "item failed; it stays pending"
                    );
                    report.failed.push(FailedItem {
                        id: item.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }

        if let Ok(jobs) = job_rx.lock() {
            report.not_started = jobs.try_iter().map(|item| item.id).collect();
        }
        if !report.not_started.is_empty() {
            tracing::warn!(count = report.not_started.len(), "items left for the next run");
        }

        if let Some(err) = fatal {
            return Err(err.into());
        }
        Ok(report)
    }
}

fn worker_loop(
    jobs: &Mutex<Receiver<WorkItem>>,
    done: &Sender<Completion>,
    processor: &ItemProcessor,
    shutdown: &ShutdownHandle,
) {
    loop {
        if shutdown.is_requested() {
            break;
        }
        let next = match jobs.lock() {
            Ok(queue) => queue.try_recv(),
            Err(_) => break,
        };
        let Ok(item) = next else {
            break;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&item)))
            .unwrap_or_else(|payload| {
                Err(ItemError::Panicked {
                    id: item.id.clone(),
                    message: panic_message(&*payload),
                })
            });
        if done.send((item, outcome)).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
