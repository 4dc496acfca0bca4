//! Canonical progress events and normalization of raw backend payloads.

use std::path::Path;

use crate::backend::RawProgress;
use crate::task::{TaskId, TaskStatus};

/// Max characters kept from backend-provided error text.
pub const MAX_DESCRIPTION_CHARS: usize = 100;

/// Immutable progress snapshot for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub phase: TaskStatus,
    /// Item percentage in [0, 100].
    pub percent: Option<f32>,
    pub size: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub filename: Option<String>,
    pub description: Option<String>,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, phase: TaskStatus) -> Self {
        Self {
            task_id,
            phase,
            percent: None,
            size: None,
            speed: None,
            eta: None,
            filename: None,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_percent(mut self, percent: f32) -> Self {
        self.percent = Some(percent.clamp(0.0, 100.0));
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Map a backend `downloading`/`finished` payload to an event.
    ///
    /// Returns `None` for `error` payloads and unknown statuses; backend errors
    /// are collected by the router and surfaced only through the executor's
    /// terminal event. A backend `finished` payload means the transfer is done
    /// but post-processing may follow, so it stays in `Downloading`.
    pub fn from_raw(task_id: TaskId, raw: &RawProgress) -> Option<Self> {
        let mut event = ProgressEvent::new(task_id, TaskStatus::Downloading);
        match raw.status.as_str() {
            "downloading" => {
                event.percent = Some(
                    raw.percent_str
                        .as_deref()
                        .and_then(parse_percent)
                        .unwrap_or(0.0),
                );
                event.size = Some(
                    clean_field(raw.total_bytes_str.as_deref())
                        .or_else(|| clean_field(raw.downloaded_bytes_str.as_deref()))
                        .unwrap_or_else(|| "unknown".to_string()),
                );
                event.speed = Some(clean_field(raw.speed_str.as_deref()).unwrap_or_else(na));
                event.eta = Some(clean_field(raw.eta_str.as_deref()).unwrap_or_else(na));
                event.filename = raw.filename.as_deref().map(base_name);
            }
            "finished" => {
                event.percent = Some(100.0);
                event.filename = raw.filename.as_deref().map(base_name);
                event.size = Some(
                    clean_field(raw.total_bytes_str.as_deref())
                        .unwrap_or_else(|| "unknown".to_string()),
                );
                event.description = Some(if raw.postprocessor.is_some() {
                    "Post-processing...".to_string()
                } else {
                    "Transfer complete".to_string()
                });
            }
            _ => return None,
        }
        Some(event)
    }
}

fn na() -> String {
    "N/A".to_string()
}

fn clean_field(value: Option<&str>) -> Option<String> {
    let cleaned = strip_control_sequences(value?);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Remove ANSI/VT escape sequences (CSI `ESC [ ... final`, OSC `ESC ] ... BEL`,
/// and two-byte escapes) and other control characters except tab.
pub fn strip_control_sequences(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    // Parameters and intermediates, then one final byte in @..~.
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(n) = chars.next() {
                        if n == '\u{7}' {
                            break;
                        }
                        if n == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            }
            continue;
        }
        if c.is_control() && c != '\t' {
            continue;
        }
        out.push(c);
    }
    out
}

/// Parse a percentage like `" 45.3%"` (possibly colored) into [0, 100].
pub fn parse_percent(s: &str) -> Option<f32> {
    let cleaned = strip_control_sequences(s);
    let value: f32 = cleaned.trim().trim_end_matches('%').trim().parse().ok()?;
    if value.is_finite() {
        Some(value.clamp(0.0, 100.0))
    } else {
        None
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> TaskId {
        TaskId::new("Generic_00000000")
    }

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_control_sequences("\u{1b}[0;94m 45.3%\u{1b}[0m"), " 45.3%");
        assert_eq!(strip_control_sequences("a\u{1b}]0;title\u{7}b"), "ab");
        assert_eq!(strip_control_sequences("line\r\n"), "line");
    }

    #[test]
    fn percent_parsing() {
        assert_eq!(parse_percent("\u{1b}[0;94m 45.3%\u{1b}[0m"), Some(45.3));
        assert_eq!(parse_percent("100%"), Some(100.0));
        assert_eq!(parse_percent("130%"), Some(100.0));
        assert_eq!(parse_percent("N/A"), None);
    }

    #[test]
    fn downloading_payload_fills_placeholders() {
        let raw = RawProgress {
            status: "downloading".into(),
            percent_str: Some(" 12.0%".into()),
            downloaded_bytes_str: Some("1.2MiB".into()),
            ..RawProgress::default()
        };
        let ev = ProgressEvent::from_raw(id(), &raw).unwrap();
        assert_eq!(ev.phase, TaskStatus::Downloading);
        assert_eq!(ev.percent, Some(12.0));
        assert_eq!(ev.size.as_deref(), Some("1.2MiB"));
        assert_eq!(ev.speed.as_deref(), Some("N/A"));
        assert_eq!(ev.eta.as_deref(), Some("N/A"));
    }

    #[test]
    fn finished_payload_is_not_terminal() {
        let mut raw = RawProgress::finished(Path::new("/out/clip [x].mp4"));
        raw.postprocessor = Some("FFmpegVideoConvertor".into());
        let ev = ProgressEvent::from_raw(id(), &raw).unwrap();
        assert!(!ev.is_terminal());
        assert_eq!(ev.filename.as_deref(), Some("clip [x].mp4"));
        assert_eq!(ev.description.as_deref(), Some("Post-processing..."));
    }

    #[test]
    fn error_payload_maps_to_none() {
        assert!(ProgressEvent::from_raw(id(), &RawProgress::error("boom")).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("下载失败了", 2), "下载");
    }
}
