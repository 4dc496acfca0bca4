//! Retryable task executor: runs one task to a terminal result.
//!
//! One call to [`TaskExecutor::execute`] produces exactly one terminal event
//! and one [`TerminalResult`]. Attempts are retried per the [`RetryPolicy`];
//! cancellation is observed in the progress hook and during backoff and
//! always wins over a pending retry.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{default_options, BackendError, DownloadOptions, DownloadRequest, ExtractionBackend};
use crate::control::CancelToken;
use crate::event::{truncate_chars, ProgressEvent, MAX_DESCRIPTION_CHARS};
use crate::retry::{classify_message, friendly_message, wait_with_cancel, RetryDecision, RetryPolicy, WaitOutcome};
use crate::router::{ProgressRouter, ProgressSink};
use crate::task::{Task, TaskId, TaskStatus, TerminalResult};

/// Problems detected before the first attempt. Fatal for the task, never retried.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("task has no URL")]
    MissingUrl,
    #[error("task has no output directory")]
    MissingOutputDir,
    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn prepare_output(task: &Task) -> Result<(), SetupError> {
    if task.url.trim().is_empty() {
        return Err(SetupError::MissingUrl);
    }
    if task.output_dir.as_os_str().is_empty() {
        return Err(SetupError::MissingOutputDir);
    }
    fs::create_dir_all(&task.output_dir).map_err(|source| SetupError::OutputDir {
        path: task.output_dir.clone(),
        source,
    })
}

pub struct TaskExecutor {
    backend: Arc<dyn ExtractionBackend>,
    router: Arc<ProgressRouter>,
    policy: RetryPolicy,
    default_options: DownloadOptions,
}

impl TaskExecutor {
    pub fn new(backend: Arc<dyn ExtractionBackend>, router: Arc<ProgressRouter>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            router,
            policy,
            default_options: default_options(),
        }
    }

    /// Replace the options applied beneath every task's own options.
    pub fn with_default_options(mut self, options: DownloadOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn router(&self) -> &Arc<ProgressRouter> {
        &self.router
    }

    /// Run `task` to completion. Blocking; call from a worker thread.
    pub fn execute(&self, task: &Task, sink: Arc<dyn ProgressSink>, cancel: &CancelToken) -> TerminalResult {
        let id = task.id().clone();
        let span = tracing::info_span!("execute", task_id = %id);
        let _enter = span.enter();

        if let Err(e) = prepare_output(task) {
            tracing::error!(error = %e, "setup failed");
            let message = truncate_chars(&e.to_string(), MAX_DESCRIPTION_CHARS);
            return errored(&*sink, id, message, 0);
        }

        let request = DownloadRequest::for_task(task, &self.default_options);
        let guard = self.router.bind(id.clone(), Arc::clone(&sink), cancel.clone());
        let hook = guard.hook();
        let max_retries = self.policy.max_retries;
        let mut retry_count = 0u32;
        let mut attempt = 0u32;

        let last_error = loop {
            if cancel.is_cancelled() {
                return cancelled(&*sink, id, retry_count);
            }
            self.router.reset_attempt(guard.token());
            if attempt == 0 {
                sink.publish(
                    ProgressEvent::new(id.clone(), TaskStatus::Preparing)
                        .with_description("Preparing download..."),
                );
            }
            tracing::debug!(attempt, "invoking backend");

            let raw_error = match self.backend.download(&request, &hook) {
                Ok(0) => {
                    let filepath = self.resolve_filepath(&request);
                    tracing::info!(retry_count, ?filepath, "download finished");
                    let mut event = ProgressEvent::new(id.clone(), TaskStatus::Finished)
                        .with_percent(100.0)
                        .with_description("Completed");
                    if let Some(name) = filepath.as_ref().and_then(|p| p.file_name()) {
                        event = event.with_filename(name.to_string_lossy());
                    }
                    sink.publish(event);
                    return TerminalResult::finished(id, filepath, retry_count);
                }
                Err(BackendError::Cancelled) => return cancelled(&*sink, id, retry_count),
                Ok(code) => self
                    .router
                    .take_hook_error(guard.token())
                    .unwrap_or_else(|| format!("backend exited with status {code}")),
                Err(e) => e.to_string(),
            };

            // A backend that swallowed the hook's cancellation still stops here.
            if cancel.is_cancelled() {
                return cancelled(&*sink, id, retry_count);
            }

            let kind = classify_message(&raw_error);
            let summary = friendly_message(&raw_error);
            tracing::warn!(attempt, ?kind, error = %raw_error, "attempt failed");

            match self.policy.decide(attempt, kind) {
                RetryDecision::NoRetry => break summary,
                RetryDecision::RetryAfter(delay) => {
                    retry_count += 1;
                    sink.publish(
                        ProgressEvent::new(id.clone(), TaskStatus::Retrying).with_description(format!(
                            "Retry {}/{} in {}s: {}",
                            retry_count,
                            max_retries,
                            delay.as_secs_f32().round(),
                            summary
                        )),
                    );
                    let poll = self.policy.effective_poll_interval();
                    if wait_with_cancel(delay, poll, cancel) == WaitOutcome::Cancelled {
                        tracing::info!("cancelled during backoff");
                        return cancelled(&*sink, id, retry_count);
                    }
                    attempt += 1;
                }
            }
        };

        tracing::error!(retry_count, error = %last_error, "attempts exhausted");
        errored(&*sink, id, last_error, retry_count)
    }

    fn resolve_filepath(&self, request: &DownloadRequest) -> Option<PathBuf> {
        match self.backend.resolve_filepath(request) {
            Ok(Some(path)) if path.exists() => Some(path),
            Ok(Some(path)) => {
                tracing::debug!(path = %path.display(), "resolved file does not exist");
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "could not resolve output file");
                None
            }
        }
    }
}

fn cancelled(sink: &dyn ProgressSink, id: TaskId, retry_count: u32) -> TerminalResult {
    tracing::info!("task cancelled");
    sink.publish(ProgressEvent::new(id.clone(), TaskStatus::Cancelled).with_description("Cancelled by user"));
    TerminalResult::cancelled(id, retry_count)
}

/// Publish the terminal `Errored` event and build its result.
pub(crate) fn errored(sink: &dyn ProgressSink, id: TaskId, message: String, retry_count: u32) -> TerminalResult {
    sink.publish(ProgressEvent::new(id.clone(), TaskStatus::Errored).with_description(message.clone()));
    TerminalResult::errored(id, message, retry_count)
}
