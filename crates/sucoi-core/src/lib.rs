pub mod config;
pub mod logging;

pub mod backend;
pub mod batch;
pub mod board;
pub mod control;
pub mod dispatch;
pub mod engine;
pub mod event;
pub mod executor;
pub mod platform;
pub mod pool;
pub mod queue_store;
pub mod retry;
pub mod router;
pub mod task;

mod sync;

#[cfg(test)]
pub(crate) mod test_support;
