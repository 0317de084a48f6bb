//! Task-submission port.
//!
//! Layers never own threads. Anything that waits (an activity call, a retry
//! backoff) is handed to a shared `TaskExecutor` as a future, and reports
//! back through the dispatch stack from whichever worker finishes it.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

pub type BoxTask = BoxFuture<'static, ()>;

pub trait TaskExecutor: Send + Sync {
    /// Run `task` as soon as a worker slot is free.
    fn submit(&self, task: BoxTask) -> TaskHandle;

    /// Run `task` once `delay` has elapsed. The delay is a timer, not a
    /// parked worker.
    fn schedule(&self, delay: Duration, task: BoxTask) -> TaskHandle;
}

/// Handle to submitted work.
#[derive(Debug)]
pub struct TaskHandle {
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(join: JoinHandle<()>) -> Self {
        Self { join }
    }

    /// Stop the task at its next suspension point. Work that already
    /// started calling out may still have side effects.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task. Aborted or panicked tasks resolve as well.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}
