//! Cancellable backoff wait.

use std::time::{Duration, Instant};

use crate::control::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Block for `delay`, checking `cancel` every `poll_interval` (at most).
/// Returns as soon as cancellation is observed. Runs on a worker thread.
pub fn wait_with_cancel(delay: Duration, poll_interval: Duration, cancel: &CancelToken) -> WaitOutcome {
    let poll = poll_interval.max(Duration::from_millis(1));
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::Elapsed;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}
