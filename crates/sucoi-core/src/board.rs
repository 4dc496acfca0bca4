//! Task board: the engine's view of the download list, keyed by task id.
//!
//! The board is the one place task status lives between events. It is updated
//! from progress events (on whichever thread publishes them) and read by the
//! batch monitor and the queue store, each access under one short lock.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use crate::batch::StatusSource;
use crate::event::ProgressEvent;
use crate::platform::{self, Platform, PlatformError};
use crate::sync::{read, write};
use crate::task::{Task, TaskId, TaskStatus};

/// Outcome of [`TaskBoard::add_urls`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AddReport {
    pub attempted: usize,
    pub added: Vec<TaskId>,
    /// Malformed URLs and ids already on the board.
    pub skipped: usize,
    /// URLs a platform refused to build a task for.
    pub errors: Vec<PlatformError>,
}

impl AddReport {
    /// Status bar text, e.g. `"Added 2, skipped 1 (invalid/duplicate) of 3 URLs."`.
    pub fn status_message(&self) -> String {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("added {}", self.added.len()));
        }
        if self.skipped > 0 {
            parts.push(format!("skipped {} (invalid/duplicate)", self.skipped));
        }
        if !self.errors.is_empty() {
            parts.push(format!("failed {}", self.errors.len()));
        }
        if parts.is_empty() {
            return format!("Tried to add {} URLs; nothing to do.", self.attempted);
        }
        let msg = parts.join(", ");
        let mut chars = msg.chars();
        let capitalized: String = match chars.next() {
            Some(c) => c.to_uppercase().chain(chars).collect(),
            None => msg.clone(),
        };
        format!("{capitalized} of {} URLs.", self.attempted)
    }
}

#[derive(Default)]
struct Rows {
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, Task>,
}

#[derive(Default)]
pub struct TaskBoard {
    rows: RwLock<Rows>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one task per URL, deduplicated by id. `platform: None` detects the
    /// platform from each URL.
    pub fn add_urls<S: AsRef<str>>(&self, urls: &[S], platform: Option<Platform>, output_dir: &Path) -> AddReport {
        let mut report = AddReport {
            attempted: urls.len(),
            ..AddReport::default()
        };
        for url in urls {
            let url = url.as_ref().trim();
            let tag = match platform {
                Some(p) => platform::validate_url(url).map(|_| p),
                None => platform::detect(url),
            };
            let tag = match tag {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(url, error = %e, "skipping invalid URL");
                    report.skipped += 1;
                    continue;
                }
            };
            let task = match platform::provider_for(tag).build_task(url, output_dir) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(url, error = %e, "cannot build task");
                    report.errors.push(e);
                    continue;
                }
            };
            let id = task.id().clone();
            if self.insert(task) {
                report.added.push(id);
            } else {
                report.skipped += 1;
            }
        }
        tracing::info!(
            attempted = report.attempted,
            added = report.added.len(),
            skipped = report.skipped,
            errors = report.errors.len(),
            "urls added"
        );
        report
    }

    /// Insert a task at the end. Returns false if its id is already present.
    pub fn insert(&self, task: Task) -> bool {
        let mut rows = write(&self.rows);
        if rows.tasks.contains_key(task.id()) {
            return false;
        }
        rows.order.push(task.id().clone());
        rows.tasks.insert(task.id().clone(), task);
        true
    }

    /// Fold a progress event into its row. Returns false if the row is gone or
    /// already terminal.
    pub fn apply(&self, event: &ProgressEvent) -> bool {
        let mut rows = write(&self.rows);
        let Some(task) = rows.tasks.get_mut(&event.task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = event.phase;
        match event.phase {
            TaskStatus::Retrying => task.retry_count += 1,
            TaskStatus::Errored => task.last_error = event.description.clone(),
            _ => {}
        }
        if let Some(name) = &event.filename {
            task.title = name.chars().take(50).collect();
        }
        if event.size.is_some() {
            task.size = event.size.clone();
        }
        task.description = event.description.clone();
        true
    }

    pub fn remove(&self, id: &TaskId) -> Option<Task> {
        let mut rows = write(&self.rows);
        let removed = rows.tasks.remove(id)?;
        rows.order.retain(|x| x != id);
        Some(removed)
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        read(&self.rows).tasks.get(id).cloned()
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        read(&self.rows).tasks.get(id).map(|t| t.status)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        read(&self.rows).tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        read(&self.rows).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All tasks in list order.
    pub fn snapshot(&self) -> Vec<Task> {
        let rows = read(&self.rows);
        rows.order
            .iter()
            .filter_map(|id| rows.tasks.get(id).cloned())
            .collect()
    }

    pub fn open_ids(&self) -> HashSet<TaskId> {
        read(&self.rows).tasks.keys().cloned().collect()
    }

    /// Explicit resubmission: every `Pending`/`Errored`/`Cancelled` row is
    /// reset to `Pending` and returned in list order.
    pub fn select_for_download(&self) -> Vec<Task> {
        let mut rows = write(&self.rows);
        let Rows { order, tasks } = &mut *rows;
        let mut selected = Vec::new();
        for id in order.iter() {
            if let Some(task) = tasks.get_mut(id) {
                if task.status.is_resubmittable() {
                    task.reset_for_resubmission();
                    selected.push(task.clone());
                }
            }
        }
        selected
    }

    /// Put `task` on the board for an immediate start. New tasks are inserted;
    /// an existing idle row is reset and returned. `None` while the row is
    /// queued or running.
    pub fn prepare_immediate(&self, task: Task) -> Option<Task> {
        let mut rows = write(&self.rows);
        if let Some(existing) = rows.tasks.get_mut(task.id()) {
            if existing.status.is_active() {
                return None;
            }
            existing.reset_for_resubmission();
            existing.options = task.options;
            existing.output_dir = task.output_dir;
            return Some(existing.clone());
        }
        rows.order.push(task.id().clone());
        rows.tasks.insert(task.id().clone(), task.clone());
        Some(task)
    }
}

impl StatusSource for TaskBoard {
    fn final_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.status(id)
    }
}
