//! Scripted extraction backend and event collectors for unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::{BackendError, DownloadRequest, ExtractionBackend, RawProgress};
use crate::event::ProgressEvent;
use crate::router::{ProgressHook, ProgressSink};
use crate::task::{TaskId, TaskStatus};

/// What one backend call does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Report some progress, write the output file, exit 0.
    Succeed,
    /// Raise an extraction error with this message.
    Fail(String),
    /// Report an error payload through the hook, then exit 1.
    HookError(String),
    Exit(i32),
    /// Report progress for this long, then succeed.
    Hold(Duration),
    /// Report progress until the hook signals cancellation.
    UntilCancelled,
    Panic,
}

/// Plays back a queue of steps per URL; unscripted calls succeed.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    active: AtomicUsize,
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

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, url: &str) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|q| q.pop_front())
            .unwrap_or(Step::Succeed)
    }

    fn output_file(request: &DownloadRequest) -> PathBuf {
        request.output_dir.join(format!("{}.mp4", request.task_id))
    }
}

struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExtractionBackend for ScriptedBackend {
    fn download(&self, request: &DownloadRequest, hook: &ProgressHook) -> Result<i32, BackendError> {
        let step = self.next_step(&request.url);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = Active(&self.active);

        match step {
            Step::Succeed => {
                hook.report(&RawProgress::downloading("\u{1b}[0;94m 50.0%\u{1b}[0m"))?;
                let out = Self::output_file(request);
                std::fs::write(&out, b"data").map_err(|e| BackendError::Other(e.to_string()))?;
                hook.report(&RawProgress::finished(&out))?;
                Ok(0)
            }
            Step::Fail(msg) => {
                hook.report(&RawProgress::downloading("10%"))?;
                Err(BackendError::Extraction(msg))
            }
            Step::HookError(msg) => {
                hook.report(&RawProgress::error(&msg))?;
                Ok(1)
            }
            Step::Exit(code) => Ok(code),
            Step::Hold(d) => {
                let end = Instant::now() + d;
                while Instant::now() < end {
                    hook.report(&RawProgress::downloading("1%"))?;
                    std::thread::sleep(Duration::from_millis(10));
                }
                let out = Self::output_file(request);
                std::fs::write(&out, b"data").map_err(|e| BackendError::Other(e.to_string()))?;
                Ok(0)
            }
            Step::UntilCancelled => {
                let end = Instant::now() + Duration::from_secs(30);
                while Instant::now() < end {
                    hook.report(&RawProgress::downloading("1%"))?;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(BackendError::Other("never cancelled".into()))
            }
            Step::Panic => panic!("scripted backend panic"),
        }
    }

    fn resolve_filepath(&self, request: &DownloadRequest) -> anyhow::Result<Option<PathBuf>> {
        Ok(Some(Self::output_file(request)))
    }
}

/// Sink that records every event it receives.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn phases(&self, id: &TaskId) -> Vec<TaskStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.task_id == id)
            .map(|e| e.phase)
            .collect()
    }

    pub fn terminal_count(&self, id: &TaskId) -> usize {
        self.phases(id).iter().filter(|p| p.is_terminal()).count()
    }
}

impl ProgressSink for Recorder {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
