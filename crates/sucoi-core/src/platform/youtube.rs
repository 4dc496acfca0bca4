use serde_json::json;
use url::Url;

use super::{host_matches, Platform, PlatformProvider};
use crate::backend::DownloadOptions;

/// Format selector preferring an mp4 video + m4a audio pair.
const MP4_FORMAT: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";

#[derive(Debug, Default)]
pub struct YouTubeProvider;

impl PlatformProvider for YouTubeProvider {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    fn accepts(&self, url: &Url) -> bool {
        host_matches(url, "youtube.com") || host_matches(url, "youtu.be")
    }

    fn task_options(&self) -> DownloadOptions {
        let mut opts = DownloadOptions::new();
        opts.insert("format".to_string(), json!(MP4_FORMAT));
        opts.insert(
            "postprocessors".to_string(),
            json!([{ "key": "FFmpegVideoConvertor", "preferedformat": "mp4" }]),
        );
        opts
    }
}

/// Canonical watch URL for a video id (e.g. a search result).
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_url_roundtrips_through_detect() {
        let url = watch_url("dQw4w9WgXcQ");
        assert_eq!(super::super::detect(&url).unwrap(), Platform::YouTube);
    }
}
