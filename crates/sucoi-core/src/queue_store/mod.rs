//! Persistent queue: unfinished tasks saved as a JSON array and restored on
//! the next start.
//!
//! `Finished` tasks and ids the user removed are never written. Tasks that were
//! mid-flight are written back as `Pending`. A file that cannot be parsed is
//! moved aside to a `.corrupt` backup and treated as empty; a file with some
//! unreadable entries is copied to the backup before the rest are loaded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::platform::Platform;
use crate::sync::lock;
use crate::task::{Task, TaskId, TaskStatus};

/// One saved task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedQueueEntry {
    pub id: TaskId,
    pub url: String,
    pub platform: Platform,
    /// Title or filename shown in the list.
    pub filename: String,
    #[serde(default)]
    pub size: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl PersistedQueueEntry {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id().clone(),
            url: task.url.clone(),
            platform: task.platform,
            filename: task.title.clone(),
            size: task.size.clone(),
            status: persisted_status(task.status),
            description: task.description.clone(),
            output_dir: Some(task.output_dir.clone()),
        }
    }

    /// Rebuild the task. `default_dir` is used when the entry has no directory.
    pub fn into_task(self, default_dir: &Path) -> Task {
        let output_dir = self.output_dir.unwrap_or_else(|| default_dir.to_path_buf());
        let mut task = Task::with_id(self.id, self.platform, self.url, output_dir);
        task.status = persisted_status(self.status);
        if !self.filename.is_empty() {
            task.title = self.filename;
        }
        task.size = self.size;
        task.description = self.description;
        task.options = crate::platform::provider_for(task.platform).task_options();
        task
    }
}

/// Statuses of running work are saved as `Pending`.
fn persisted_status(status: TaskStatus) -> TaskStatus {
    if status.is_active() {
        TaskStatus::Pending
    } else {
        status
    }
}

/// Problems reported by [`QueueStore::load`]. Never fatal: the load still
/// returns (possibly empty) entries.
#[derive(Debug, thiserror::Error)]
pub enum QueueStoreError {
    #[error("queue file {path} is corrupt ({reason}); moved to {backup}")]
    Corrupt {
        path: PathBuf,
        backup: PathBuf,
        reason: String,
    },
    #[error("queue file {path} is corrupt ({reason}) and could not be backed up: {backup_error}")]
    CorruptNoBackup {
        path: PathBuf,
        reason: String,
        backup_error: String,
    },
    #[error("{count} invalid entries in queue file {path} were skipped; original kept at {backup}")]
    InvalidEntries {
        path: PathBuf,
        count: usize,
        backup: PathBuf,
    },
    #[error("cannot read queue file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of [`QueueStore::load`].
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub entries: Vec<PersistedQueueEntry>,
    /// Entries dropped because their id is already open, duplicated, or invalid.
    pub skipped: usize,
    pub warning: Option<QueueStoreError>,
}

pub struct QueueStore {
    path: PathBuf,
    removed: Mutex<HashSet<TaskId>>,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removed: Mutex::new(HashSet::new()),
        }
    }

    /// `~/.local/state/sucoi/queue.json`.
    pub fn default_path() -> Result<PathBuf> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("sucoi")?;
        Ok(xdg_dirs.get_state_home().join("queue.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclude `id` from every later save.
    pub fn mark_removed(&self, id: &TaskId) {
        lock(&self.removed).insert(id.clone());
    }

    /// Undo [`mark_removed`](Self::mark_removed), e.g. when the URL is added again.
    pub fn unmark_removed(&self, id: &TaskId) -> bool {
        lock(&self.removed).remove(id)
    }

    pub fn is_removed(&self, id: &TaskId) -> bool {
        lock(&self.removed).contains(id)
    }

    /// Write every unfinished, non-removed task. Returns how many were saved.
    /// The file is replaced atomically via a temporary sibling.
    pub fn save(&self, tasks: &[Task]) -> Result<usize> {
        let entries: Vec<PersistedQueueEntry> = {
            let removed = lock(&self.removed);
            tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Finished && !removed.contains(t.id()))
                .map(PersistedQueueEntry::from_task)
                .collect()
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&entries).context("serialize queue")?;
        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, json).with_context(|| format!("write queue: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace queue: {}", self.path.display()))?;
        tracing::info!(saved = entries.len(), path = %self.path.display(), "queue saved");
        Ok(entries.len())
    }

    /// Read saved entries, skipping ids in `open` and duplicates. A missing
    /// file is an empty queue; an unparsable one is backed up and ignored.
    pub fn load(&self, open: &HashSet<TaskId>) -> LoadOutcome {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return LoadOutcome::default(),
            Err(source) => {
                tracing::warn!(path = %self.path.display(), error = %source, "cannot read queue");
                return LoadOutcome {
                    warning: Some(QueueStoreError::Unreadable {
                        path: self.path.clone(),
                        source,
                    }),
                    ..LoadOutcome::default()
                };
            }
        };

        let raw: Vec<serde_json::Value> = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                return LoadOutcome {
                    warning: Some(self.quarantine(e.to_string())),
                    ..LoadOutcome::default()
                }
            }
        };

        let mut outcome = LoadOutcome::default();
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut invalid = 0;
        for value in raw {
            let entry: PersistedQueueEntry = match serde_json::from_value(value) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping invalid queue entry");
                    invalid += 1;
                    outcome.skipped += 1;
                    continue;
                }
            };
            if entry.status == TaskStatus::Finished || open.contains(&entry.id) || !seen.insert(entry.id.clone()) {
                outcome.skipped += 1;
                continue;
            }
            let mut entry = entry;
            entry.status = persisted_status(entry.status);
            outcome.entries.push(entry);
        }
        if invalid > 0 {
            // The next save rewrites the file without these entries.
            outcome.warning = Some(self.keep_copy(invalid));
        }
        tracing::info!(
            loaded = outcome.entries.len(),
            skipped = outcome.skipped,
            "queue loaded"
        );
        outcome
    }

    fn backup_path(&self) -> PathBuf {
        let backup = sibling(&self.path, ".corrupt");
        if backup.exists() {
            return sibling(&self.path, &format!(".corrupt.{}", unix_timestamp()));
        }
        backup
    }

    /// Copy the file aside when some entries could not be read.
    fn keep_copy(&self, count: usize) -> QueueStoreError {
        let backup = self.backup_path();
        match fs::copy(&self.path, &backup) {
            Ok(_) => {
                tracing::warn!(count, backup = %backup.display(), "invalid queue entries backed up");
                QueueStoreError::InvalidEntries {
                    path: self.path.clone(),
                    count,
                    backup,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, count, "queue file with invalid entries could not be backed up");
                QueueStoreError::CorruptNoBackup {
                    path: self.path.clone(),
                    reason: format!("{count} invalid entries"),
                    backup_error: e.to_string(),
                }
            }
        }
    }

    fn quarantine(&self, reason: String) -> QueueStoreError {
        let backup = self.backup_path();
        match fs::rename(&self.path, &backup) {
            Ok(()) => {
                tracing::warn!(backup = %backup.display(), %reason, "corrupt queue file backed up");
                QueueStoreError::Corrupt {
                    path: self.path.clone(),
                    backup,
                    reason,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, %reason, "corrupt queue file could not be backed up");
                QueueStoreError::CorruptNoBackup {
                    path: self.path.clone(),
                    reason,
                    backup_error: e.to_string(),
                }
            }
        }
    }
}

/// `queue.json` + suffix, in the same directory.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
