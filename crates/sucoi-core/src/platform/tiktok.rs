use url::Url;

use super::{host_matches, Platform, PlatformProvider};

/// TikTok needs no format selection; the backend default is used.
#[derive(Debug, Default)]
pub struct TikTokProvider;

impl PlatformProvider for TikTokProvider {
    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    fn accepts(&self, url: &Url) -> bool {
        host_matches(url, "tiktok.com")
    }
}
