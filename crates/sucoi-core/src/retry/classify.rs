//! Classify raw backend error text into short user-facing summaries.

use crate::event::{strip_control_sequences, truncate_chars, MAX_DESCRIPTION_CHARS};

/// High-level classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// HTTP 404 or equivalent.
    NotFound,
    /// HTTP 403.
    Forbidden,
    Private,
    GeoRestricted,
    LoginRequired,
    /// Removed, deleted, or otherwise unavailable content.
    Unavailable,
    Timeout,
    /// DNS resolution or connection-level failure.
    Network,
    /// Anything else; the raw message is shown truncated.
    Other,
}

impl ErrorKind {
    /// Failures that another attempt is not expected to fix.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound
                | ErrorKind::Forbidden
                | ErrorKind::Private
                | ErrorKind::GeoRestricted
                | ErrorKind::LoginRequired
                | ErrorKind::Unavailable
        )
    }

    pub fn summary(self) -> Option<&'static str> {
        match self {
            ErrorKind::NotFound => Some("resource not found"),
            ErrorKind::Forbidden => Some("access forbidden"),
            ErrorKind::Private => Some("video is private"),
            ErrorKind::GeoRestricted => Some("not available in your region"),
            ErrorKind::LoginRequired => Some("login required"),
            ErrorKind::Unavailable => Some("video unavailable"),
            ErrorKind::Timeout => Some("connection timed out"),
            ErrorKind::Network => Some("network error"),
            ErrorKind::Other => None,
        }
    }
}

const NOT_FOUND: &[&str] = &["http error 404", "404: not found", "404 not found"];
const FORBIDDEN: &[&str] = &["http error 403", "403: forbidden", "403 forbidden"];
const PRIVATE: &[&str] = &["private video", "video is private", "this video is private"];
const GEO: &[&str] = &[
    "not available in your country",
    "not made this video available in your country",
    "geo restrict",
    "geo-restrict",
    "not available in your region",
];
const LOGIN: &[&str] = &[
    "sign in to confirm",
    "login required",
    "log in to",
    "requires authentication",
    "use --cookies",
];
const UNAVAILABLE: &[&str] = &[
    "video unavailable",
    "is unavailable",
    "has been removed",
    "no longer available",
    "account has been terminated",
];
const TIMEOUT: &[&str] = &["timed out", "timeout"];
const NETWORK: &[&str] = &[
    "getaddrinfo failed",
    "name or service not known",
    "temporary failure in name resolution",
    "nodename nor servname",
    "failed to resolve",
    "connection refused",
    "connection reset",
    "connection aborted",
    "network is unreachable",
    "unable to download webpage",
    "urlopen error",
];

/// Classify raw backend error text. Order matters: more specific causes are
/// checked before broad ones ("private video ... unavailable" is Private).
pub fn classify_message(raw: &str) -> ErrorKind {
    let msg = strip_control_sequences(raw).to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));
    if has(NOT_FOUND) {
        ErrorKind::NotFound
    } else if has(FORBIDDEN) {
        ErrorKind::Forbidden
    } else if has(PRIVATE) {
        ErrorKind::Private
    } else if has(GEO) {
        ErrorKind::GeoRestricted
    } else if has(LOGIN) {
        ErrorKind::LoginRequired
    } else if has(UNAVAILABLE) {
        ErrorKind::Unavailable
    } else if has(TIMEOUT) {
        ErrorKind::Timeout
    } else if has(NETWORK) {
        ErrorKind::Network
    } else {
        ErrorKind::Other
    }
}

/// Short user-facing summary for raw backend error text: the classified
/// summary, else the cleaned raw message truncated to 100 characters.
pub fn friendly_message(raw: &str) -> String {
    if let Some(summary) = classify_message(raw).summary() {
        return summary.to_string();
    }
    let cleaned = strip_control_sequences(raw);
    let trimmed = cleaned.trim();
    let trimmed = trimmed.strip_prefix("ERROR:").map(str::trim).unwrap_or(trimmed);
    if trimmed.is_empty() {
        "download failed".to_string()
    } else {
        truncate_chars(trimmed, MAX_DESCRIPTION_CHARS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_404_and_403() {
        assert_eq!(classify_message("ERROR: HTTP Error 404: Not Found"), ErrorKind::NotFound);
        assert_eq!(friendly_message("HTTP Error 404"), "resource not found");
        assert_eq!(classify_message("HTTP Error 403: Forbidden"), ErrorKind::Forbidden);
    }

    #[test]
    fn platform_specific_causes() {
        assert_eq!(
            classify_message("ERROR: [youtube] abc: Private video. Sign in if you've been granted access"),
            ErrorKind::Private
        );
        assert_eq!(
            classify_message("The uploader has not made this video available in your country"),
            ErrorKind::GeoRestricted
        );
        assert_eq!(
            classify_message("Sign in to confirm your age. This video may be inappropriate"),
            ErrorKind::LoginRequired
        );
        assert_eq!(classify_message("ERROR: Video unavailable"), ErrorKind::Unavailable);
    }

    #[test]
    fn network_and_timeout() {
        assert_eq!(
            classify_message("<urlopen error [Errno -2] Name or service not known>"),
            ErrorKind::Network
        );
        assert_eq!(classify_message("The read operation timed out"), ErrorKind::Timeout);
    }

    #[test]
    fn fallback_is_truncated_raw_text() {
        let long = format!("ERROR: \u{1b}[31m{}\u{1b}[0m", "x".repeat(300));
        let msg = friendly_message(&long);
        assert_eq!(msg.chars().count(), MAX_DESCRIPTION_CHARS);
        assert!(msg.chars().all(|c| c == 'x'));
        assert_eq!(friendly_message("   "), "download failed");
    }

    #[test]
    fn permanence() {
        assert!(ErrorKind::Private.is_permanent());
        assert!(!ErrorKind::Network.is_permanent());
        assert!(!ErrorKind::Other.is_permanent());
    }
}
