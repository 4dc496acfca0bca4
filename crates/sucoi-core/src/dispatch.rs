//! Events for the presentation layer and the single consumer that applies them.
//!
//! Worker threads and the batch monitor only ever send [`UiEvent`]s. The UI
//! thread calls [`drain`] from its event loop and is the only place a
//! [`Presenter`] is touched.

use tokio::sync::mpsc;

use crate::batch::Summary;
use crate::event::ProgressEvent;
use crate::task::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Task(ProgressEvent),
    /// Overall batch percentage.
    BatchProgress(u8),
    Summary(Summary),
    Status(String),
}

pub type UiSender = mpsc::UnboundedSender<UiEvent>;
pub type UiReceiver = mpsc::UnboundedReceiver<UiEvent>;

pub fn channel() -> (UiSender, UiReceiver) {
    mpsc::unbounded_channel()
}

/// Row update derived from one progress event.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFields {
    pub status: TaskStatus,
    pub status_text: &'static str,
    pub progress: Option<String>,
    pub size: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub filename: Option<String>,
    pub description: Option<String>,
}

impl RowFields {
    pub fn from_event(event: &ProgressEvent) -> Self {
        Self {
            status: event.phase,
            status_text: status_text(event.phase),
            progress: event.percent.map(|p| format!("{p:.1}%")),
            size: event.size.clone(),
            speed: event.speed.clone(),
            eta: event.eta.clone(),
            filename: event.filename.clone(),
            description: event.description.clone(),
        }
    }
}

/// Label shown in the status column.
pub fn status_text(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "Waiting",
        TaskStatus::Preparing => "Preparing",
        TaskStatus::Downloading => "Downloading",
        TaskStatus::Retrying => "Retrying",
        TaskStatus::Finished => "Completed",
        TaskStatus::Errored => "Error",
        TaskStatus::Cancelled => "Cancelled",
    }
}

/// The external UI. Only called from the thread that drains the channel.
pub trait Presenter {
    fn update_task_row(&mut self, task_id: &TaskId, fields: &RowFields);
    fn update_batch_progress(&mut self, percent: u8);
    fn show_summary(&mut self, title: &str, message: &str);
    fn update_status(&mut self, message: &str);
}

pub fn apply(event: UiEvent, presenter: &mut dyn Presenter) {
    match event {
        UiEvent::Task(ev) => presenter.update_task_row(&ev.task_id, &RowFields::from_event(&ev)),
        UiEvent::BatchProgress(p) => presenter.update_batch_progress(p),
        UiEvent::Summary(summary) => {
            let (title, message) = summary_message(&summary);
            presenter.show_summary(&title, &message);
        }
        UiEvent::Status(msg) => presenter.update_status(&msg),
    }
}

/// Apply every event currently queued without blocking. Returns how many
/// were applied.
pub fn drain(rx: &mut UiReceiver, presenter: &mut dyn Presenter) -> usize {
    let mut applied = 0;
    while let Ok(event) = rx.try_recv() {
        apply(event, presenter);
        applied += 1;
    }
    applied
}

/// Title and body of the end-of-batch dialog.
pub fn summary_message(summary: &Summary) -> (String, String) {
    let title = if summary.was_cancelled {
        "Download cancelled"
    } else {
        "Download complete"
    };
    let mut message = format!(
        "Batch finished.\n\nSucceeded: {}\nFailed: {}",
        summary.succeeded, summary.errored
    );
    if summary.cancelled > 0 {
        message.push_str(&format!("\nCancelled: {}", summary.cancelled));
    }
    if summary.was_cancelled {
        message.push_str("\n\nNote: some tasks may be unfinished because the batch was cancelled.");
    } else if summary.errored > 0 {
        message.push_str("\n\nSome downloads failed; check the list for details.");
    }
    (title.to_string(), message)
}

/// One-line status bar text for the end of a batch.
pub fn summary_status(summary: &Summary) -> String {
    if summary.was_cancelled {
        "Downloads cancelled.".to_string()
    } else {
        "Downloads finished.".to_string()
    }
}
