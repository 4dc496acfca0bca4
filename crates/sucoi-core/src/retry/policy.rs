use std::time::Duration;

use super::classify::ErrorKind;
use crate::config::RetryConfig;

/// Upper bound on the cancellation poll interval during backoff.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Fixed-schedule retry policy.
///
/// The default is two retries after the first attempt, waiting 3 s and then
/// 5 s. Classified permanent failures are retried like any other unless
/// `skip_permanent` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `delays[n]`; the last entry repeats.
    pub delays: Vec<Duration>,
    /// How often the cancel token is checked while waiting.
    pub poll_interval: Duration,
    /// Stop retrying as soon as an error classifies as permanent.
    pub skip_permanent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delays: vec![Duration::from_secs(3), Duration::from_secs(5)],
            poll_interval: MAX_POLL_INTERVAL,
            skip_permanent: false,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        let delays = cfg
            .delays_secs
            .iter()
            .filter_map(|s| Duration::try_from_secs_f64(*s).ok())
            .collect();
        Self {
            max_retries: cfg.max_retries,
            delays,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            skip_permanent: cfg.skip_permanent,
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before the retry that follows failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = attempt as usize;
        self.delays
            .get(idx)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Poll interval, clamped to (0, MAX_POLL_INTERVAL].
    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval
            .clamp(Duration::from_millis(1), MAX_POLL_INTERVAL)
    }

    /// Decide what follows failed attempt `attempt` (0-based).
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::NoRetry;
        }
        if self.skip_permanent && kind.is_permanent() {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt))
    }
}
