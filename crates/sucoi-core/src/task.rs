//! Task model: identity, lifecycle status, and the terminal result of one execution.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

use crate::backend::DownloadOptions;
use crate::platform::Platform;

/// Number of hex characters of the URL hash kept in a task id.
const ID_HASH_LEN: usize = 8;

/// Stable task identifier of the form `"{platform}_{hash}"`.
///
/// Derived deterministically from the platform and URL so the same URL maps to
/// the same id across the task list, the worker pool, and restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Derive the id for a URL on a platform.
    pub fn derive(platform: Platform, url: &str) -> Self {
        let digest = Sha256::digest(url.as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(ID_HASH_LEN);
        TaskId(format!("{}_{}", platform.name(), hash))
    }

    /// Wrap an id produced elsewhere (persisted queue, presentation layer).
    pub fn new(id: impl Into<String>) -> Self {
        TaskId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a task.
///
/// `Pending → Preparing → Downloading → {Finished | Errored | Cancelled}`.
/// `Retrying` is surfaced while the executor waits between attempts; it never
/// leaves the executor as a final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Preparing,
    Downloading,
    Retrying,
    Finished,
    Errored,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Preparing => "preparing",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Finished => "finished",
            TaskStatus::Errored => "errored",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// No further automatic transition happens from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Errored | TaskStatus::Cancelled
        )
    }

    /// Status held while an executor owns the task.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Preparing | TaskStatus::Downloading | TaskStatus::Retrying
        )
    }

    /// Statuses the user may explicitly resubmit.
    pub fn is_resubmittable(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Errored | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user-requested download job.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    pub url: String,
    pub output_dir: PathBuf,
    pub platform: Platform,
    /// Per-task backend options; merged over the executor defaults.
    pub options: DownloadOptions,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Display title or filename hint.
    pub title: String,
    /// Human-readable size as last reported by the backend.
    pub size: Option<String>,
    pub description: Option<String>,
}

impl Task {
    /// Create a pending task; the id is derived from `platform` and `url`.
    pub fn new(platform: Platform, url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        let url = url.into();
        let id = TaskId::derive(platform, &url);
        Self::with_id(id, platform, url, output_dir.into())
    }

    /// Rebuild a task around an id that already exists (e.g. a persisted entry).
    pub fn with_id(id: TaskId, platform: Platform, url: String, output_dir: PathBuf) -> Self {
        let title = title_hint(&url);
        Self {
            id,
            url,
            output_dir,
            platform,
            options: DownloadOptions::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            last_error: None,
            title,
            size: None,
            description: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Explicit user resubmission: back to `Pending` with a clean retry history.
    pub fn reset_for_resubmission(&mut self) {
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
        self.description = None;
    }
}

/// Title fallback used before the backend reports a filename: the last URL
/// path segment without the query, at most 50 characters.
pub fn title_hint(url: &str) -> String {
    let last = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url);
    let last = last.split(['?', '#']).next().unwrap_or(last);
    let hint = if last.is_empty() { url } else { last };
    hint.chars().take(50).collect()
}

/// Final outcome of one executor run. Every run produces exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalResult {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Resolved output file; optional metadata that may fail independently.
    pub filepath: Option<PathBuf>,
    pub error_message: Option<String>,
    /// Retries started after the first attempt.
    pub retry_count: u32,
}

impl TerminalResult {
    pub fn finished(id: TaskId, filepath: Option<PathBuf>, retry_count: u32) -> Self {
        Self {
            id,
            status: TaskStatus::Finished,
            filepath,
            error_message: None,
            retry_count,
        }
    }

    pub fn errored(id: TaskId, message: impl Into<String>, retry_count: u32) -> Self {
        Self {
            id,
            status: TaskStatus::Errored,
            filepath: None,
            error_message: Some(message.into()),
            retry_count,
        }
    }

    pub fn cancelled(id: TaskId, retry_count: u32) -> Self {
        Self {
            id,
            status: TaskStatus::Cancelled,
            filepath: None,
            error_message: None,
            retry_count,
        }
    }
}
