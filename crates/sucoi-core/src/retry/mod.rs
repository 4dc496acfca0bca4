//! Retry and backoff policy.
//!
//! This module holds the attempt budget and per-attempt delays, the
//! classification of backend error text into short user-facing summaries, and
//! the cancellable wait used between attempts, so the executor and the config
//! layer share one consistent policy.

mod classify;
mod policy;
mod wait;

pub use classify::{classify_message, friendly_message, ErrorKind};
pub use policy::{RetryDecision, RetryPolicy, MAX_POLL_INTERVAL};
pub use wait::{wait_with_cancel, WaitOutcome};
