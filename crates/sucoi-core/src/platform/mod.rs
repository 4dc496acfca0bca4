//! Compile-time registry of platform behaviors.
//!
//! Each platform implements [`PlatformProvider`]: it recognizes its URLs,
//! contributes backend options, and builds a [`Task`] descriptor. Providers are
//! selected by the [`Platform`] tag carried on every task.

mod tiktok;
mod youtube;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use url::Url;

use crate::backend::DownloadOptions;
use crate::task::Task;

pub use tiktok::TikTokProvider;
pub use youtube::{watch_url, YouTubeProvider};

/// Platform tag on a task. Serialized with the display name (e.g. `"YouTube"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    YouTube,
    TikTok,
    Generic,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::YouTube, Platform::TikTok, Platform::Generic];

    /// Display name, also used as the task id prefix.
    pub fn name(self) -> &'static str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::TikTok => "TikTok",
            Platform::Generic => "Generic",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported URL scheme {0:?} (only http and https)")]
    UnsupportedScheme(String),
    #[error("{url} is not a {platform} URL")]
    WrongPlatform { url: String, platform: Platform },
}

/// Capability interface implemented once per platform.
pub trait PlatformProvider: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether this provider recognizes the (already validated) URL.
    fn accepts(&self, url: &Url) -> bool;

    /// Backend option overrides applied to every task of this platform.
    fn task_options(&self) -> DownloadOptions {
        DownloadOptions::new()
    }

    /// Build a pending task descriptor for `url`.
    fn build_task(&self, url: &str, output_dir: &Path) -> Result<Task, PlatformError> {
        let parsed = validate_url(url)?;
        if !self.accepts(&parsed) {
            return Err(PlatformError::WrongPlatform {
                url: url.to_string(),
                platform: self.platform(),
            });
        }
        let mut task = Task::new(self.platform(), url, output_dir);
        task.options = self.task_options();
        Ok(task)
    }
}

/// Fallback provider: accepts any http(s) URL and adds no options.
#[derive(Debug, Default)]
pub struct GenericProvider;

impl PlatformProvider for GenericProvider {
    fn platform(&self) -> Platform {
        Platform::Generic
    }

    fn accepts(&self, _url: &Url) -> bool {
        true
    }
}

static YOUTUBE: YouTubeProvider = YouTubeProvider;
static TIKTOK: TikTokProvider = TikTokProvider;
static GENERIC: GenericProvider = GenericProvider;

/// Provider registered for a platform tag.
pub fn provider_for(platform: Platform) -> &'static dyn PlatformProvider {
    match platform {
        Platform::YouTube => &YOUTUBE,
        Platform::TikTok => &TIKTOK,
        Platform::Generic => &GENERIC,
    }
}

/// Pick the first specific provider that recognizes `url`, else `Generic`.
pub fn detect(url: &str) -> Result<Platform, PlatformError> {
    let parsed = validate_url(url)?;
    Ok([Platform::YouTube, Platform::TikTok]
        .into_iter()
        .find(|p| provider_for(*p).accepts(&parsed))
        .unwrap_or(Platform::Generic))
}

/// Parse `url` and require an http(s) scheme with a host.
pub fn validate_url(url: &str) -> Result<Url, PlatformError> {
    let parsed = Url::parse(url.trim()).map_err(|e| PlatformError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(PlatformError::UnsupportedScheme(other.to_string())),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(PlatformError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(parsed)
}

/// True when `host` is `domain` or one of its subdomains.
pub(crate) fn host_matches(url: &Url, domain: &str) -> bool {
    match url.host_str() {
        Some(host) => {
            let host = host.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        }
        None => false,
    }
}
