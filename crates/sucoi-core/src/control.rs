//! Cooperative cancellation: shared cancel tokens and the per-task registry.
//!
//! Every submitted task is registered with a cancel token derived from its
//! batch token. Cancelling the batch cancels every task in it; cancelling one
//! task leaves the others running. Executors observe the token inside the
//! progress hook and while waiting between attempts; nothing is preempted.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::sync::{read, write};
use crate::task::TaskId;

/// Shared cancellation flag, optionally chained to a parent token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::Acquire))
    }
}

/// Shared registry of task id -> cancel token. The worker pool registers a
/// task at submission (so queued tasks can be cancelled too) and unregisters it
/// once its terminal result is produced.
#[derive(Debug, Default)]
pub struct TaskControl {
    tasks: RwLock<HashMap<TaskId, CancelToken>>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task; returns its token, a child of `batch`. `None` if the
    /// id is already registered.
    pub fn try_register(&self, id: &TaskId, batch: &CancelToken) -> Option<CancelToken> {
        match write(&self.tasks).entry(id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(batch.child()).clone()),
        }
    }

    pub fn unregister(&self, id: &TaskId) {
        write(&self.tasks).remove(id);
    }

    /// Request cancellation of one task. Returns false if it is not registered.
    pub fn request_cancel(&self, id: &TaskId) -> bool {
        match read(&self.tasks).get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered task; returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let tasks = read(&self.tasks);
        for token in tasks.values() {
            token.cancel();
        }
        tasks.len()
    }

    pub fn is_registered(&self, id: &TaskId) -> bool {
        read(&self.tasks).contains_key(id)
    }

    /// Ids of queued or running tasks.
    pub fn registered(&self) -> Vec<TaskId> {
        read(&self.tasks).keys().cloned().collect()
    }
}
