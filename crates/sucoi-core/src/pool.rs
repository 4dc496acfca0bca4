//! Bounded worker pool.
//!
//! Submissions go onto an unbounded FIFO queue drained by a single dispatcher
//! task. The dispatcher takes a permit from the current limiter before handing
//! each job to the blocking thread pool, so at most `max_workers` executors run
//! at once and queued jobs start in submission order.
//!
//! `resize` swaps in a new limiter and closes the old one. Jobs holding permits
//! on the old limiter run to completion, so until they drain the number of
//! running executors can temporarily exceed the new limit.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};

use crate::control::{CancelToken, TaskControl};
use crate::executor::{errored, TaskExecutor};
use crate::router::ProgressSink;
use crate::sync::lock;
use crate::task::{Task, TaskId, TerminalResult};

struct Job {
    task: Task,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
    reply: oneshot::Sender<TerminalResult>,
}

struct PoolInner {
    executor: Arc<TaskExecutor>,
    control: Arc<TaskControl>,
    limiter: Mutex<Arc<Semaphore>>,
    max_workers: AtomicUsize,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    accepting: AtomicBool,
    active: AtomicUsize,
    peak: AtomicUsize,
    /// Submitted jobs whose result has not been delivered yet.
    outstanding: AtomicUsize,
    idle: Notify,
}

impl PoolInner {
    fn current_limiter(&self) -> Arc<Semaphore> {
        Arc::clone(&lock(&self.limiter))
    }

    fn job_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Counts one running executor for the lifetime of the guard.
struct ActiveGuard<'a>(&'a PoolInner);

impl<'a> ActiveGuard<'a> {
    fn enter(inner: &'a PoolInner) -> Self {
        let now = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(inner)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to one submitted task's terminal result.
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TerminalResult>,
    result: Option<TerminalResult>,
}

impl TaskHandle {
    fn ready(result: TerminalResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let id = result.id.clone();
        let _ = tx.send(result);
        Self { id, rx, result: None }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Non-blocking check; returns the result once the task is terminal.
    pub fn poll_result(&mut self) -> Option<&TerminalResult> {
        if self.result.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.result = Some(result),
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.result = Some(TerminalResult::errored(
                        self.id.clone(),
                        "worker dropped the task",
                        0,
                    ));
                }
            }
        }
        self.result.as_ref()
    }

    pub fn is_finished(&mut self) -> bool {
        self.poll_result().is_some()
    }

    pub async fn wait(mut self) -> TerminalResult {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.rx.await {
            Ok(result) => result,
            Err(_) => TerminalResult::errored(self.id, "worker dropped the task", 0),
        }
    }
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create the pool and start its dispatcher. Must be called inside a
    /// Tokio runtime.
    pub fn new(executor: Arc<TaskExecutor>, control: Arc<TaskControl>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            executor,
            control,
            limiter: Mutex::new(Arc::new(Semaphore::new(max_workers))),
            max_workers: AtomicUsize::new(max_workers),
            queue: Mutex::new(Some(tx)),
            accepting: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        tokio::spawn(dispatch(Arc::clone(&inner), rx));
        tracing::debug!(max_workers, "worker pool started");
        Self { inner }
    }

    /// Queue `task`. The task's cancel token is a child of `batch`.
    ///
    /// After shutdown the handle resolves immediately to `Errored`, and the
    /// event is published to `sink` as for any other terminal result.
    pub fn submit(&self, task: Task, sink: Arc<dyn ProgressSink>, batch: &CancelToken) -> TaskHandle {
        let id = task.id().clone();
        if !self.inner.accepting.load(Ordering::Acquire) {
            tracing::warn!(task_id = %id, "submit after shutdown");
            return TaskHandle::ready(errored(&*sink, id, "worker pool is shut down".into(), 0));
        }
        let Some(cancel) = self.inner.control.try_register(&id, batch) else {
            tracing::warn!(task_id = %id, "task already queued or running");
            return TaskHandle::ready(TerminalResult::errored(id, "task is already queued or running", 0));
        };
        let (reply, rx) = oneshot::channel();
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let job = Job {
            task,
            sink: Arc::clone(&sink),
            cancel,
            reply,
        };
        let sent = lock(&self.inner.queue)
            .as_ref()
            .map(|q| q.send(job).is_ok())
            .unwrap_or(false);
        if !sent {
            self.inner.control.unregister(&id);
            self.inner.job_done();
            return TaskHandle::ready(errored(&*sink, id, "worker pool is shut down".into(), 0));
        }
        tracing::debug!(task_id = %id, "task queued");
        TaskHandle { id, rx, result: None }
    }

    /// Change the concurrency limit (minimum 1).
    pub fn resize(&self, max_workers: usize) {
        let max_workers = max_workers.max(1);
        let old = {
            let mut limiter = lock(&self.inner.limiter);
            std::mem::replace(&mut *limiter, Arc::new(Semaphore::new(max_workers)))
        };
        old.close();
        let previous = self.inner.max_workers.swap(max_workers, Ordering::AcqRel);
        tracing::info!(previous, max_workers, "worker pool resized");
    }

    /// Stop accepting work. Graceful waits for queued and running tasks;
    /// otherwise every registered task is cancelled and this returns at once.
    pub async fn shutdown(&self, graceful: bool) {
        self.inner.accepting.store(false, Ordering::Release);
        if graceful {
            self.wait_idle().await;
        } else {
            let n = self.inner.control.cancel_all();
            tracing::info!(cancelled = n, "worker pool shutting down");
        }
        lock(&self.inner.queue).take();
    }

    /// Resolve once no submitted task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Executors running right now.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest `active_count` observed since the pool started.
    pub fn peak_active(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Lets the dispatcher exit once the queue is drained.
        lock(&self.inner.queue).take();
    }
}

async fn dispatch(inner: Arc<PoolInner>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let permit = loop {
            match inner.current_limiter().acquire_owned().await {
                Ok(permit) => break permit,
                // Closed by resize; retry on the replacement.
                Err(_) => continue,
            }
        };
        tokio::spawn(run_job(Arc::clone(&inner), job, permit));
    }
    tracing::debug!("worker pool dispatcher stopped");
}

async fn run_job(inner: Arc<PoolInner>, job: Job, permit: OwnedSemaphorePermit) {
    let Job {
        task,
        sink,
        cancel,
        reply,
    } = job;
    let id = task.id().clone();
    let worker_inner = Arc::clone(&inner);
    let worker_sink = Arc::clone(&sink);

    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let _active = ActiveGuard::enter(&worker_inner);
        worker_inner.executor.execute(&task, worker_sink, &cancel)
    })
    .await;

    let result = match joined {
        Ok(result) => result,
        Err(e) => {
            let message = if e.is_panic() {
                tracing::error!(task_id = %id, "executor panicked");
                "internal error: executor panicked"
            } else {
                tracing::error!(task_id = %id, "executor was aborted");
                "internal error: executor aborted"
            };
            errored(&*sink, id.clone(), message.to_string(), 0)
        }
    };

    inner.control.unregister(&id);
    let _ = reply.send(result);
    inner.job_done();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use crate::retry::RetryPolicy;
    use crate::router::ProgressRouter;
    use crate::task::TaskStatus;
    use crate::test_support::{Recorder, ScriptedBackend, Step};
    use std::time::Duration;

    fn pool_with(backend: Arc<ScriptedBackend>, workers: usize) -> (WorkerPool, Arc<TaskControl>) {
        let exec = TaskExecutor::new(backend, ProgressRouter::new(), RetryPolicy::default());
        let control = Arc::new(TaskControl::new());
        (WorkerPool::new(Arc::new(exec), Arc::clone(&control), workers), control)
    }

    fn tasks(n: usize, dir: &tempfile::TempDir) -> Vec<Task> {
        (0..n)
            .map(|i| Task::new(Platform::Generic, format!("https://h.com/{i}"), dir.path()))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn five_tasks_two_workers() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let ts = tasks(5, &dir);
        for t in &ts {
            backend.script(&t.url, [Step::Hold(Duration::from_millis(80))]);
        }
        let (pool, _control) = pool_with(backend.clone(), 2);
        let rec = Recorder::new();
        let batch = CancelToken::new();
        let handles: Vec<_> = ts.into_iter().map(|t| pool.submit(t, rec.clone(), &batch)).collect();

        for h in handles {
            assert_eq!(h.wait().await.status, TaskStatus::Finished);
        }
        assert!(backend.peak() <= 2);
        assert!(pool.peak_active() <= 2);
        assert_eq!(backend.calls(), 5);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_tasks_start_in_submission_order() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let ts = tasks(4, &dir);
        let ids: Vec<_> = ts.iter().map(|t| t.id().clone()).collect();
        let (pool, _control) = pool_with(backend, 1);
        let rec = Recorder::new();
        let batch = CancelToken::new();
        let handles: Vec<_> = ts.into_iter().map(|t| pool.submit(t, rec.clone(), &batch)).collect();
        for h in handles {
            h.wait().await;
        }
        let started: Vec<_> = rec
            .events()
            .into_iter()
            .filter(|e| e.phase == TaskStatus::Preparing)
            .map(|e| e.task_id)
            .collect();
        assert_eq!(started, ids);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn resize_overshoot_is_bounded() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let ts = tasks(6, &dir);
        for t in &ts {
            backend.script(&t.url, [Step::Hold(Duration::from_millis(100))]);
        }
        let (pool, _control) = pool_with(backend.clone(), 1);
        let rec = Recorder::new();
        let batch = CancelToken::new();
        let handles: Vec<_> = ts.into_iter().map(|t| pool.submit(t, rec.clone(), &batch)).collect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.resize(2);
        assert_eq!(pool.max_workers(), 2);
        for h in handles {
            assert_eq!(h.wait().await.status, TaskStatus::Finished);
        }
        // Old limit + new limit.
        assert!(backend.peak() <= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_after_shutdown_is_errored() {
        let (pool, _control) = pool_with(ScriptedBackend::new(), 2);
        pool.shutdown(true).await;
        let dir = tempfile::tempdir().unwrap();
        let t = tasks(1, &dir).remove(0);
        let id = t.id().clone();
        let rec = Recorder::new();
        let mut h = pool.submit(t, rec.clone(), &CancelToken::new());
        let r = h.poll_result().cloned().unwrap();
        assert_eq!(r.status, TaskStatus::Errored);
        assert_eq!(rec.phases(&id), vec![TaskStatus::Errored]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forced_shutdown_cancels_running_and_queued() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let ts = tasks(3, &dir);
        for t in &ts {
            backend.script(&t.url, [Step::UntilCancelled]);
        }
        let (pool, control) = pool_with(backend, 1);
        let rec = Recorder::new();
        let handles: Vec<_> = ts
            .into_iter()
            .map(|t| pool.submit(t, rec.clone(), &CancelToken::new()))
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.shutdown(false).await;
        for h in handles {
            assert_eq!(h.wait().await.status, TaskStatus::Cancelled);
        }
        assert!(control.registered().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_submit_runs_once() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let t = tasks(1, &dir).remove(0);
        backend.script(&t.url, [Step::Hold(Duration::from_millis(50))]);
        let id = t.id().clone();
        let (pool, _control) = pool_with(backend.clone(), 2);
        let rec = Recorder::new();
        let batch = CancelToken::new();
        let first = pool.submit(t.clone(), rec.clone(), &batch);
        let mut second = pool.submit(t, rec.clone(), &batch);

        let dup = second.poll_result().cloned().unwrap();
        assert_eq!(dup.status, TaskStatus::Errored);
        assert_eq!(first.wait().await.status, TaskStatus::Finished);
        assert_eq!(backend.calls(), 1);
        assert_eq!(rec.terminal_count(&id), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panic_in_executor_becomes_errored() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let t = tasks(1, &dir).remove(0);
        backend.script(&t.url, [Step::Panic]);
        let id = t.id().clone();
        let (pool, _control) = pool_with(backend, 1);
        let rec = Recorder::new();
        let r = pool.submit(t, rec.clone(), &CancelToken::new()).wait().await;
        assert_eq!(r.status, TaskStatus::Errored);
        assert_eq!(rec.terminal_count(&id), 1);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_one_leaves_others_running() {
        let backend = ScriptedBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let ts = tasks(2, &dir);
        backend.script(&ts[0].url, [Step::UntilCancelled]);
        backend.script(&ts[1].url, [Step::Hold(Duration::from_millis(100))]);
        let first = ts[0].id().clone();
        let (pool, control) = pool_with(backend, 2);
        let rec = Recorder::new();
        let batch = CancelToken::new();
        let handles: Vec<_> = ts.into_iter().map(|t| pool.submit(t, rec.clone(), &batch)).collect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(control.request_cancel(&first));
        let mut results = Vec::new();
        for h in handles {
            results.push(h.wait().await.status);
        }
        assert_eq!(results, vec![TaskStatus::Cancelled, TaskStatus::Finished]);
    }
}
