//! Extraction backend that plays back scripted steps per URL.
//!
//! Same step names as the crate's unit-test backend, minus the steps only the
//! executor tests need. Unscripted calls succeed after one progress report.
//! Tracks how many calls run at once so tests can check the pool limit.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sucoi_core::backend::{BackendError, DownloadRequest, ExtractionBackend, RawProgress};
use sucoi_core::router::ProgressHook;

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Succeed,
    Fail(&'static str),
    /// Report progress for this long, then succeed.
    Hold(Duration),
    /// Report progress until the hook signals cancellation.
    UntilCancelled,
}

#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn output(request: &DownloadRequest) -> PathBuf {
        request.output_dir.join(format!("{}.mp4", request.task_id))
    }

    fn write_output(request: &DownloadRequest) -> Result<(), BackendError> {
        std::fs::write(Self::output(request), b"ok").map_err(|e| BackendError::Other(e.to_string()))
    }

    fn report_for(hook: &ProgressHook, duration: Duration) -> Result<(), BackendError> {
        let end = Instant::now() + duration;
        while Instant::now() < end {
            hook.report(&RawProgress::downloading("42.0%"))?;
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

impl ExtractionBackend for ScriptedBackend {
    fn download(&self, request: &DownloadRequest, hook: &ProgressHook) -> Result<i32, BackendError> {
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(|q| q.pop_front())
            .unwrap_or(Step::Succeed);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = match step {
            Step::Succeed => hook
                .report(&RawProgress::downloading("100%"))
                .and_then(|_| Self::write_output(request))
                .map(|_| 0),
            Step::Hold(d) => Self::report_for(hook, d)
                .and_then(|_| Self::write_output(request))
                .map(|_| 0),
            Step::Fail(msg) => Err(BackendError::Extraction(msg.to_string())),
            Step::UntilCancelled => Self::report_for(hook, Duration::from_secs(30))
                .and_then(|_| Err(BackendError::Other("never cancelled".into()))),
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn resolve_filepath(&self, request: &DownloadRequest) -> anyhow::Result<Option<PathBuf>> {
        Ok(Some(Self::output(request)))
    }
}
