//! Batch monitor: waits on a batch of task handles and reports its outcome.
//!
//! Each monitor owns its own [`BatchState`]; two overlapping batches never
//! share counters.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::control::CancelToken;
use crate::dispatch::{summary_status, UiEvent, UiSender};
use crate::pool::TaskHandle;
use crate::task::{TaskId, TaskStatus};

/// Progress published when a batch starts.
pub const START_PERCENT: u8 = 5;
/// Default interval between handle polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    /// Errored, removed mid-run, or ended without a recorded final status.
    pub errored: usize,
    pub cancelled: usize,
    /// The batch-wide cancel was requested.
    pub was_cancelled: bool,
}

/// Where the monitor reads a task's final recorded status.
pub trait StatusSource: Send + Sync {
    /// `None` when the task is no longer tracked (e.g. removed by the user).
    fn final_status(&self, id: &TaskId) -> Option<TaskStatus>;
}

/// Counters for one batch.
#[derive(Debug, Default)]
pub struct BatchState {
    total: usize,
    recorded: HashMap<TaskId, TaskStatus>,
    finished: usize,
}

impl BatchState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Record a task's final status. Non-terminal statuses count as
    /// `Errored`. Returns false if the task was already recorded or the batch
    /// is full.
    pub fn record(&mut self, id: TaskId, status: TaskStatus) -> bool {
        if self.recorded.contains_key(&id) || self.recorded.len() >= self.total {
            return false;
        }
        let status = match status {
            TaskStatus::Finished | TaskStatus::Cancelled | TaskStatus::Errored => status,
            _ => TaskStatus::Errored,
        };
        if status == TaskStatus::Finished {
            self.finished += 1;
        }
        self.recorded.insert(id, status);
        true
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.recorded.len()
    }

    /// `5 + finished / total * 95`. Only grows as tasks finish.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return START_PERCENT;
        }
        let span = (100 - START_PERCENT) as usize;
        (START_PERCENT as usize + self.finished * span / self.total) as u8
    }

    pub fn summary(&self, was_cancelled: bool) -> Summary {
        let count = |s: TaskStatus| self.recorded.values().filter(|v| **v == s).count();
        let succeeded = count(TaskStatus::Finished);
        let cancelled = count(TaskStatus::Cancelled);
        Summary {
            total: self.total,
            succeeded,
            cancelled,
            // Never recorded counts as an error too.
            errored: self.total - succeeded - cancelled,
            was_cancelled,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct BatchMonitor {
    ui: UiSender,
    status: Arc<dyn StatusSource>,
    poll_interval: Duration,
}

impl BatchMonitor {
    pub fn new(ui: UiSender, status: Arc<dyn StatusSource>) -> Self {
        Self {
            ui,
            status,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn send(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            tracing::debug!("ui channel closed; dropping batch event");
        }
    }

    /// Wait until every handle is terminal, publishing progress along the way,
    /// then publish the final percentage, the summary and a status line.
    pub async fn watch(&self, handles: Vec<TaskHandle>, batch: &CancelToken) -> Summary {
        let mut state = BatchState::new(handles.len());
        let mut published = state.percent();
        self.send(UiEvent::BatchProgress(published));
        tracing::info!(total = state.total(), "batch started");

        let mut pending = handles;
        loop {
            pending.retain_mut(|handle| {
                let Some(result_status) = handle.poll_result().map(|r| r.status) else {
                    return true;
                };
                let status = self.status.final_status(handle.id());
                if status.is_none() {
                    tracing::debug!(task_id = %handle.id(), result = %result_status, "task no longer tracked");
                }
                state.record(handle.id().clone(), status.unwrap_or(TaskStatus::Errored));
                false
            });

            let percent = state.percent();
            if percent > published {
                published = percent;
                self.send(UiEvent::BatchProgress(percent));
            }
            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let was_cancelled = batch.is_cancelled();
        let summary = state.summary(was_cancelled);
        tracing::info!(
            total = summary.total,
            succeeded = summary.succeeded,
            errored = summary.errored,
            cancelled = summary.cancelled,
            was_cancelled,
            "batch finished"
        );
        self.send(UiEvent::BatchProgress(if was_cancelled { 0 } else { 100 }));
        self.send(UiEvent::Summary(summary));
        self.send(UiEvent::Status(summary_status(&summary)));
        state.reset();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::TaskControl;
    use crate::dispatch::channel;
    use crate::executor::TaskExecutor;
    use crate::platform::Platform;
    use crate::pool::WorkerPool;
    use crate::retry::RetryPolicy;
    use crate::router::ProgressRouter;
    use crate::task::Task;
    use crate::test_support::{Recorder, ScriptedBackend, Step};
    use std::sync::Mutex;

    /// Status source backed by the events a recorder saw.
    struct LastPhase(Arc<Recorder>, Mutex<Vec<TaskId>>);

    impl StatusSource for LastPhase {
        fn final_status(&self, id: &TaskId) -> Option<TaskStatus> {
            if self.1.lock().unwrap().contains(id) {
                return None;
            }
            self.0.phases(id).last().copied()
        }
    }

    #[test]
    fn percent_and_summary() {
        let mut s = BatchState::new(4);
        assert_eq!(s.percent(), 5);
        assert!(s.record(TaskId::new("a"), TaskStatus::Finished));
        assert!(!s.record(TaskId::new("a"), TaskStatus::Finished));
        assert_eq!(s.percent(), 28);
        s.record(TaskId::new("b"), TaskStatus::Cancelled);
        s.record(TaskId::new("c"), TaskStatus::Downloading);
        assert_eq!(s.completed(), 3);
        assert_eq!(s.percent(), 28);
        let sum = s.summary(false);
        assert_eq!((sum.succeeded, sum.cancelled, sum.errored), (1, 1, 2));
        s.record(TaskId::new("d"), TaskStatus::Finished);
        assert!(!s.record(TaskId::new("e"), TaskStatus::Finished));
        assert!(s.completed() <= s.total());
        s.reset();
        assert_eq!(s.total(), 0);
    }

    #[test]
    fn all_finished_reaches_100() {
        let mut s = BatchState::new(3);
        for id in ["a", "b", "c"] {
            s.record(TaskId::new(id), TaskStatus::Finished);
        }
        assert_eq!(s.percent(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn watch_publishes_monotonic_progress_and_summary() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let tasks: Vec<_> = (0..4)
            .map(|i| Task::new(Platform::Generic, format!("https://b.com/{i}"), dir.path()))
            .collect();
        backend.script(&tasks[0].url, [Step::Hold(std::time::Duration::from_millis(60))]);
        backend.script(&tasks[1].url, [Step::Exit(1)]);
        let removed = tasks[3].id().clone();

        let exec = TaskExecutor::new(
            backend,
            ProgressRouter::new(),
            RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
        );
        let pool = WorkerPool::new(Arc::new(exec), Arc::new(TaskControl::new()), 2);
        let rec = Recorder::new();
        let batch = CancelToken::new();
        let handles = tasks
            .into_iter()
            .map(|t| pool.submit(t, rec.clone(), &batch))
            .collect();

        let (tx, mut rx) = channel();
        let source = Arc::new(LastPhase(rec.clone(), Mutex::new(vec![removed])));
        let monitor = BatchMonitor::new(tx, source).with_poll_interval(Duration::from_millis(10));
        let summary = monitor.watch(handles, &batch).await;

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.errored, 2);
        assert!(!summary.was_cancelled);

        let mut percents = Vec::new();
        let mut saw_summary = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                UiEvent::BatchProgress(p) => percents.push(p),
                UiEvent::Summary(s) => saw_summary = s == summary,
                _ => {}
            }
        }
        assert!(saw_summary);
        assert_eq!(percents.first(), Some(&5));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_batch_ends_at_zero() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let tasks: Vec<_> = (0..2)
            .map(|i| Task::new(Platform::Generic, format!("https://c.com/{i}"), dir.path()))
            .collect();
        for t in &tasks {
            backend.script(&t.url, [Step::UntilCancelled]);
        }
        let exec = TaskExecutor::new(backend, ProgressRouter::new(), RetryPolicy::default());
        let pool = WorkerPool::new(Arc::new(exec), Arc::new(TaskControl::new()), 2);
        let rec = Recorder::new();
        let batch = CancelToken::new();
        let handles = tasks
            .into_iter()
            .map(|t| pool.submit(t, rec.clone(), &batch))
            .collect();

        let b = batch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            b.cancel();
        });
        let (tx, mut rx) = channel();
        let monitor = BatchMonitor::new(tx, Arc::new(LastPhase(rec, Mutex::new(vec![]))))
            .with_poll_interval(Duration::from_millis(10));
        let summary = monitor.watch(handles, &batch).await;

        assert!(summary.was_cancelled);
        assert_eq!(summary.cancelled, 2);
        let mut last_progress = None;
        while let Ok(ev) = rx.try_recv() {
            if let UiEvent::BatchProgress(p) = ev {
                last_progress = Some(p);
            }
        }
        assert_eq!(last_progress, Some(0));
    }

    #[tokio::test]
    async fn empty_batch_summarizes_immediately() {
        let (tx, _rx) = channel();
        let monitor = BatchMonitor::new(tx, Arc::new(LastPhase(Recorder::new(), Mutex::new(vec![]))));
        let summary = monitor.watch(Vec::new(), &CancelToken::new()).await;
        assert_eq!(summary, Summary::default());
    }
}
