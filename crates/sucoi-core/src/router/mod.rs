//! Progress router: resolves which task a backend hook call belongs to.
//!
//! The backend only knows one progress hook. Each running executor binds an
//! execution context under a fresh correlation token and hands the backend a
//! [`ProgressHook`] carrying that token. Hook calls are routed through the
//! context map to the task's sink and cancel token. The map is guarded by one
//! mutex that is never held while publishing.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{BackendError, RawProgress};
use crate::control::CancelToken;
use crate::event::{strip_control_sequences, truncate_chars, ProgressEvent, MAX_DESCRIPTION_CHARS};
use crate::sync::lock;
use crate::task::TaskId;

/// Receiver of canonical progress events for one task.
///
/// Called from worker threads; implementations must not touch UI-owned state
/// directly (forward to a channel instead).
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn publish(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Correlation token identifying one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken(u64);

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("cancelled by user")]
    Cancelled,
    #[error("no execution context bound for {0}")]
    UnknownContext(ContextToken),
}

struct Binding {
    task_id: TaskId,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
    /// First backend-reported error of the current attempt has been captured.
    error_reported: bool,
    hook_error: Option<String>,
}

#[derive(Default)]
pub struct ProgressRouter {
    next_token: AtomicU64,
    contexts: Mutex<HashMap<ContextToken, Binding>>,
}

impl ProgressRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind a new execution context. The returned guard unbinds it on drop,
    /// including during unwinding.
    pub fn bind(
        self: &Arc<Self>,
        task_id: TaskId,
        sink: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> ContextGuard {
        let token = ContextToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let binding = Binding {
            task_id,
            sink,
            cancel,
            error_reported: false,
            hook_error: None,
        };
        lock(&self.contexts).insert(token, binding);
        tracing::trace!(%token, "execution context bound");
        ContextGuard {
            router: Arc::clone(self),
            token,
        }
    }

    /// Remove a context. Returns false if it was not bound.
    pub fn unbind(&self, token: ContextToken) -> bool {
        let removed = lock(&self.contexts).remove(&token).is_some();
        if removed {
            tracing::trace!(%token, "execution context unbound");
        }
        removed
    }

    /// Route one raw payload.
    ///
    /// Returns `Err(Cancelled)` when the context's cancel token is set, so the
    /// hook can interrupt the backend. Backend `error` payloads are captured
    /// once per attempt (see [`take_hook_error`](Self::take_hook_error)) and
    /// not published. Other payloads are normalized, published to the sink,
    /// and returned.
    pub fn route(
        &self,
        token: ContextToken,
        raw: &RawProgress,
    ) -> Result<Option<ProgressEvent>, RouteError> {
        let (task_id, sink) = {
            let mut contexts = lock(&self.contexts);
            let binding = contexts
                .get_mut(&token)
                .ok_or(RouteError::UnknownContext(token))?;
            if binding.cancel.is_cancelled() {
                return Err(RouteError::Cancelled);
            }
            if raw.status == "error" {
                if !binding.error_reported {
                    binding.error_reported = true;
                    let text = raw.error.as_deref().unwrap_or("download error");
                    binding.hook_error = Some(truncate_chars(
                        strip_control_sequences(text).trim(),
                        MAX_DESCRIPTION_CHARS,
                    ));
                }
                return Ok(None);
            }
            (binding.task_id.clone(), Arc::clone(&binding.sink))
        };

        let Some(event) = ProgressEvent::from_raw(task_id, raw) else {
            tracing::debug!(%token, status = %raw.status, "ignoring unknown progress status");
            return Ok(None);
        };
        sink.publish(event.clone());
        Ok(Some(event))
    }

    /// Start of a new attempt: forget the previous attempt's backend error.
    pub fn reset_attempt(&self, token: ContextToken) {
        if let Some(binding) = lock(&self.contexts).get_mut(&token) {
            binding.error_reported = false;
            binding.hook_error = None;
        }
    }

    /// Error text the backend reported through the hook during this attempt.
    pub fn take_hook_error(&self, token: ContextToken) -> Option<String> {
        lock(&self.contexts)
            .get_mut(&token)
            .and_then(|b| b.hook_error.take())
    }

    /// Number of bound execution contexts.
    pub fn active_contexts(&self) -> usize {
        lock(&self.contexts).len()
    }

    pub fn is_bound(&self, token: ContextToken) -> bool {
        lock(&self.contexts).contains_key(&token)
    }
}

/// Owns one execution context; unbinds it when dropped.
pub struct ContextGuard {
    router: Arc<ProgressRouter>,
    token: ContextToken,
}

impl ContextGuard {
    pub fn token(&self) -> ContextToken {
        self.token
    }

    /// Hook object to hand to the backend for this context.
    pub fn hook(&self) -> ProgressHook {
        ProgressHook {
            router: Arc::clone(&self.router),
            token: self.token,
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.router.unbind(self.token);
    }
}

/// The progress hook handed to the backend; carries its correlation token.
#[derive(Clone)]
pub struct ProgressHook {
    router: Arc<ProgressRouter>,
    token: ContextToken,
}

impl ProgressHook {
    pub fn token(&self) -> ContextToken {
        self.token
    }

    /// Report one payload. Returns `Err(BackendError::Cancelled)` when the
    /// task has been cancelled; backends propagate it to stop the transfer.
    pub fn report(&self, raw: &RawProgress) -> Result<(), BackendError> {
        match self.router.route(self.token, raw) {
            Ok(_) => Ok(()),
            Err(RouteError::Cancelled) => {
                tracing::info!(token = %self.token, "cancellation observed in progress hook");
                Err(BackendError::Cancelled)
            }
            Err(e @ RouteError::UnknownContext(_)) => {
                tracing::warn!("progress hook: {}", e);
                Ok(())
            }
        }
    }
}
