//! Download engine: the facade the presentation layer drives.
//!
//! Owns the board, the worker pool, the router, and the queue store. Batches
//! are started from the board (`start_selected`) or from an explicit list
//! (`start_immediate`); each batch gets its own cancel token and its own
//! monitor task. Only one batch runs at a time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::backend::ExtractionBackend;
use crate::batch::{BatchMonitor, Summary, DEFAULT_POLL_INTERVAL};
use crate::board::{AddReport, TaskBoard};
use crate::config::{EngineConfig, MAX_CONCURRENT, MIN_CONCURRENT};
use crate::control::{CancelToken, TaskControl};
use crate::dispatch::{UiEvent, UiSender};
use crate::event::ProgressEvent;
use crate::executor::TaskExecutor;
use crate::platform::Platform;
use crate::pool::WorkerPool;
use crate::queue_store::{QueueStore, QueueStoreError};
use crate::retry::RetryPolicy;
use crate::router::{ProgressRouter, ProgressSink};
use crate::sync::lock;
use crate::task::{Task, TaskId, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a download batch is already running")]
    BatchRunning,
    #[error("no pending or retryable tasks to start")]
    NothingToStart,
}

/// Applies events to the board, then forwards them to the UI.
struct BoardSink {
    board: Arc<TaskBoard>,
    ui: UiSender,
}

impl ProgressSink for BoardSink {
    fn publish(&self, event: ProgressEvent) {
        if !self.board.apply(&event) {
            tracing::trace!(task_id = %event.task_id, phase = %event.phase, "event for removed or settled row");
            return;
        }
        let _ = self.ui.send(UiEvent::Task(event));
    }
}

/// A running batch. Dropping the ticket does not cancel the batch.
pub struct BatchTicket {
    task_ids: Vec<TaskId>,
    cancel: CancelToken,
    monitor: JoinHandle<Summary>,
}

impl BatchTicket {
    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    /// Cancel every task of this batch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the batch summary.
    pub async fn wait(self) -> Summary {
        let total = self.task_ids.len();
        match self.monitor.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, "batch monitor failed");
                Summary {
                    total,
                    errored: total,
                    ..Summary::default()
                }
            }
        }
    }
}

/// What [`DownloadEngine::recover_queue`] restored.
#[derive(Debug, Default)]
pub struct RecoverReport {
    pub restored: usize,
    pub skipped: usize,
    pub warning: Option<QueueStoreError>,
}

pub struct DownloadEngine {
    config: EngineConfig,
    download_dir: PathBuf,
    board: Arc<TaskBoard>,
    control: Arc<TaskControl>,
    router: Arc<ProgressRouter>,
    pool: WorkerPool,
    store: QueueStore,
    ui: UiSender,
    batch_running: Arc<AtomicBool>,
    batch_cancel: Mutex<Option<CancelToken>>,
    batch_poll: Duration,
}

impl DownloadEngine {
    /// Build the engine from configuration. Must be called inside a Tokio
    /// runtime. Creates the download directory if needed.
    pub fn new(config: EngineConfig, backend: Arc<dyn ExtractionBackend>, ui: UiSender) -> Result<Self> {
        let download_dir = config.resolve_download_path()?;
        let queue_path = match &config.queue_file {
            Some(p) => p.clone(),
            None => QueueStore::default_path().context("locate queue file")?,
        };
        let router = ProgressRouter::new();
        let policy = RetryPolicy::from_config(&config.retry_config());
        let executor = Arc::new(TaskExecutor::new(backend, Arc::clone(&router), policy));
        let control = Arc::new(TaskControl::new());
        let pool = WorkerPool::new(executor, Arc::clone(&control), config.effective_max_concurrent());
        tracing::info!(
            download_dir = %download_dir.display(),
            queue = %queue_path.display(),
            workers = pool.max_workers(),
            "engine ready"
        );
        Ok(Self {
            config,
            download_dir,
            board: Arc::new(TaskBoard::new()),
            control,
            router,
            pool,
            store: QueueStore::new(queue_path),
            ui,
            batch_running: Arc::new(AtomicBool::new(false)),
            batch_cancel: Mutex::new(None),
            batch_poll: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How often batch monitors poll their handles.
    pub fn with_batch_poll_interval(mut self, interval: Duration) -> Self {
        self.batch_poll = interval;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn board(&self) -> &Arc<TaskBoard> {
        &self.board
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn router(&self) -> &Arc<ProgressRouter> {
        &self.router
    }

    pub fn is_batch_running(&self) -> bool {
        self.batch_running.load(Ordering::Acquire)
    }

    fn status(&self, message: impl Into<String>) {
        let _ = self.ui.send(UiEvent::Status(message.into()));
    }

    fn sink(&self) -> Arc<dyn ProgressSink> {
        Arc::new(BoardSink {
            board: Arc::clone(&self.board),
            ui: self.ui.clone(),
        })
    }

    /// Add URLs to the list. `platform: None` detects each URL's platform.
    pub fn add_urls<S: AsRef<str>>(&self, urls: &[S], platform: Option<Platform>) -> AddReport {
        let report = self.board.add_urls(urls, platform, &self.download_dir);
        for id in &report.added {
            self.store.unmark_removed(id);
            if let Some(task) = self.board.get(id) {
                let _ = self.ui.send(UiEvent::Task(
                    ProgressEvent::new(id.clone(), TaskStatus::Pending).with_description(task.url),
                ));
            }
        }
        self.status(report.status_message());
        report
    }

    /// Start every `Pending`/`Errored`/`Cancelled` row as one batch.
    pub fn start_selected(&self) -> Result<BatchTicket, EngineError> {
        self.claim_batch()?;
        let tasks = self.board.select_for_download();
        if tasks.is_empty() {
            self.batch_running.store(false, Ordering::Release);
            self.status("No pending or retryable tasks.");
            return Err(EngineError::NothingToStart);
        }
        for t in &tasks {
            let _ = self
                .ui
                .send(UiEvent::Task(ProgressEvent::new(t.id().clone(), TaskStatus::Pending)));
        }
        self.status(format!("Starting {} selected downloads...", tasks.len()));
        Ok(self.launch(tasks))
    }

    /// Start the given tasks right away, adding them to the list if needed.
    /// Tasks already queued or running, and repeated ids, are skipped.
    pub fn start_immediate(&self, tasks: Vec<Task>) -> Result<BatchTicket, EngineError> {
        self.claim_batch()?;
        let mut batch: Vec<Task> = Vec::new();
        for mut task in tasks {
            if batch.iter().any(|t| t.id() == task.id()) {
                continue;
            }
            if task.output_dir.as_os_str().is_empty() {
                task.output_dir = self.download_dir.clone();
            }
            self.store.unmark_removed(task.id());
            if let Some(prepared) = self.board.prepare_immediate(task) {
                batch.push(prepared);
            }
        }
        if batch.is_empty() {
            self.batch_running.store(false, Ordering::Release);
            self.status("No valid tasks to start.");
            return Err(EngineError::NothingToStart);
        }
        self.status(format!("Starting {} downloads...", batch.len()));
        Ok(self.launch(batch))
    }

    fn claim_batch(&self) -> Result<(), EngineError> {
        self.batch_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| EngineError::BatchRunning)
    }

    fn launch(&self, tasks: Vec<Task>) -> BatchTicket {
        let cancel = CancelToken::new();
        *lock(&self.batch_cancel) = Some(cancel.clone());

        let sink = self.sink();
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id().clone()).collect();
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|t| self.pool.submit(t, Arc::clone(&sink), &cancel))
            .collect();

        let monitor = BatchMonitor::new(self.ui.clone(), self.board.clone()).with_poll_interval(self.batch_poll);
        let running = Arc::clone(&self.batch_running);
        let batch = cancel.clone();
        let handle = tokio::spawn(async move {
            let summary = monitor.watch(handles, &batch).await;
            running.store(false, Ordering::Release);
            summary
        });
        BatchTicket {
            task_ids,
            cancel,
            monitor: handle,
        }
    }

    /// Cancel the running batch. Returns false when no batch is running.
    pub fn request_cancel(&self) -> bool {
        if !self.is_batch_running() {
            return false;
        }
        match lock(&self.batch_cancel).as_ref() {
            Some(token) => {
                token.cancel();
                tracing::info!("batch cancellation requested");
                self.status("Cancelling downloads...");
                true
            }
            None => false,
        }
    }

    /// Cancel one queued or running task.
    pub fn cancel_task(&self, id: &TaskId) -> bool {
        self.control.request_cancel(id)
    }

    /// Remove a row. A running task is cancelled and counts as an error in its
    /// batch; the id is excluded from later queue saves.
    pub fn remove_task(&self, id: &TaskId) -> Option<Task> {
        self.store.mark_removed(id);
        if self.control.request_cancel(id) {
            tracing::info!(task_id = %id, "removed while queued or running");
        }
        self.board.remove(id)
    }

    /// Change the pool size; returns the effective size (clamped to [1, 10]).
    pub fn resize_pool(&self, max_concurrent: usize) -> usize {
        let n = max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT);
        self.pool.resize(n);
        n
    }

    /// Restore the saved queue onto the board. Called once at startup.
    pub fn recover_queue(&self) -> RecoverReport {
        let outcome = self.store.load(&self.board.open_ids());
        let mut report = RecoverReport {
            skipped: outcome.skipped,
            warning: outcome.warning,
            ..RecoverReport::default()
        };
        for entry in outcome.entries {
            let task = entry.into_task(&self.download_dir);
            let id = task.id().clone();
            let status = task.status;
            let description = task.description.clone();
            if self.board.insert(task) {
                report.restored += 1;
                let mut event = ProgressEvent::new(id, status);
                event.description = description;
                let _ = self.ui.send(UiEvent::Task(event));
            } else {
                report.skipped += 1;
            }
        }
        match &report.warning {
            Some(w @ QueueStoreError::InvalidEntries { .. }) => {
                self.status(format!("Restored {} unfinished tasks; {w}", report.restored));
            }
            Some(w) => self.status(format!("Saved queue could not be loaded: {w}")),
            None if report.restored > 0 => {
                self.status(format!("Restored {} unfinished tasks.", report.restored));
            }
            None => {}
        }
        report
    }

    /// Save unfinished tasks. Returns how many were written.
    pub fn save_queue(&self) -> Result<usize> {
        self.store.save(&self.board.snapshot())
    }

    /// Stop the engine and save the queue. Graceful waits for every task;
    /// otherwise running tasks are cancelled and saved as `Pending`.
    pub async fn shutdown(&self, graceful: bool) -> Result<usize> {
        let tasks = if graceful {
            self.pool.shutdown(true).await;
            self.board.snapshot()
        } else {
            // Snapshot first: cancelled rows would otherwise be saved as Cancelled.
            let tasks = self.board.snapshot();
            self.request_cancel();
            self.pool.shutdown(false).await;
            tasks
        };
        let saved = self.store.save(&tasks)?;
        tracing::info!(graceful, saved, "engine shut down");
        Ok(saved)
    }
}
