//! Contract with the external extraction backend.
//!
//! The backend is opaque: given a URL and options it performs the fetch and
//! calls a progress hook 0..N times with its native payloads. It is blocking;
//! the worker pool runs it on the blocking thread pool.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::router::ProgressHook;
use crate::task::{Task, TaskId};

/// Backend options as a JSON object (format selectors, post-processors, ...).
pub type DownloadOptions = serde_json::Map<String, serde_json::Value>;

/// Output template appended to the task's output directory.
pub const OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

/// Options applied to every download before per-task overrides.
pub fn default_options() -> DownloadOptions {
    let mut opts = DownloadOptions::new();
    opts.insert("quiet".to_string(), json!(true));
    opts.insert("noprogress".to_string(), json!(true));
    opts.insert("noplaylist".to_string(), json!(true));
    opts.insert("encoding".to_string(), json!("utf-8"));
    opts.insert("nocheckcertificate".to_string(), json!(true));
    // Errors must surface as failures so the executor can retry them.
    opts.insert("ignoreerrors".to_string(), json!(false));
    opts.insert(
        "format".to_string(),
        json!("bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best"),
    );
    opts.insert(
        "postprocessors".to_string(),
        json!([{ "key": "FFmpegVideoConvertor", "preferedformat": "mp4" }]),
    );
    opts
}

/// Shallow merge: keys in `overrides` replace keys in `base`.
pub fn merge_options(base: &DownloadOptions, overrides: &DownloadOptions) -> DownloadOptions {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Everything the backend needs for one attempt.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub task_id: TaskId,
    pub url: String,
    pub output_dir: PathBuf,
    pub options: DownloadOptions,
}

impl DownloadRequest {
    /// Build the request for `task`: defaults, then task options, then the
    /// output template rooted at the task's directory.
    pub fn for_task(task: &Task, defaults: &DownloadOptions) -> Self {
        let mut options = merge_options(defaults, &task.options);
        let template = task.output_dir.join(OUTPUT_TEMPLATE);
        options.insert(
            "outtmpl".to_string(),
            json!(template.to_string_lossy().into_owned()),
        );
        Self {
            task_id: task.id().clone(),
            url: task.url.clone(),
            output_dir: task.output_dir.clone(),
            options,
        }
    }

    pub fn output_template(&self) -> Option<&str> {
        self.options.get("outtmpl").and_then(|v| v.as_str())
    }
}

/// Backend-native progress payload passed to the hook.
///
/// Field names follow the backend's string-formatted progress dictionary;
/// values may contain terminal color sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProgress {
    /// `"downloading"`, `"finished"` or `"error"`.
    pub status: String,
    pub percent_str: Option<String>,
    pub total_bytes_str: Option<String>,
    pub downloaded_bytes_str: Option<String>,
    pub speed_str: Option<String>,
    pub eta_str: Option<String>,
    pub filename: Option<String>,
    /// Set when the backend reports a post-processing step.
    pub postprocessor: Option<String>,
    pub error: Option<String>,
}

impl RawProgress {
    pub fn downloading(percent: &str) -> Self {
        Self {
            status: "downloading".to_string(),
            percent_str: Some(percent.to_string()),
            ..Self::default()
        }
    }

    pub fn finished(filename: &Path) -> Self {
        Self {
            status: "finished".to_string(),
            filename: Some(filename.to_string_lossy().into_owned()),
            ..Self::default()
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(message.to_string()),
            ..Self::default()
        }
    }
}

/// Failure of one backend call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The progress hook observed a cancellation request.
    #[error("cancelled by user")]
    Cancelled,
    /// The backend's own download error (network, HTTP, unavailable, ...).
    #[error("{0}")]
    Extraction(String),
    /// Anything else the backend raised.
    #[error("unexpected backend error: {0}")]
    Other(String),
}

/// The extraction backend. Implementations are called from worker threads.
pub trait ExtractionBackend: Send + Sync {
    /// Perform the download, reporting progress through `hook`.
    ///
    /// Returns the backend exit code (0 = success). Implementations should
    /// propagate the `Err` returned by [`ProgressHook::report`] so that
    /// cancellation stops the transfer.
    fn download(&self, request: &DownloadRequest, hook: &ProgressHook) -> Result<i32, BackendError>;

    /// Best-effort lookup of the produced file after a successful download.
    fn resolve_filepath(&self, _request: &DownloadRequest) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }
}
