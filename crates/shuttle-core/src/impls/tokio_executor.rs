//! TokioExecutor: the shared, bounded worker pool.
//!
//! Each submitted task is spawned on the runtime straight away, then waits
//! for a semaphore permit before it runs. The permit count is the number of
//! activity calls (or other submitted work) allowed in flight at once,
//! across every processor that shares this executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::error::ShuttleError;
use crate::ports::{BoxTask, TaskExecutor, TaskHandle};

pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl TokioExecutor {
    pub fn new(handle: Handle, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Executor on the runtime the caller is running in.
    pub fn from_current(workers: usize) -> Result<Self, ShuttleError> {
        let handle = Handle::try_current().map_err(|e| ShuttleError::Executor(e.to_string()))?;
        Ok(Self::new(handle, workers))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Free worker slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl TaskExecutor for TokioExecutor {
    fn submit(&self, task: BoxTask) -> TaskHandle {
        let permits = Arc::clone(&self.permits);
        TaskHandle::new(self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        }))
    }

    fn schedule(&self, delay: Duration, task: BoxTask) -> TaskHandle {
        let permits = Arc::clone(&self.permits);
        TaskHandle::new(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test]
    async fn submit_runs_task() {
        let executor = TokioExecutor::from_current(2).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = executor.submit(
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );
        handle.join().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let executor = TokioExecutor::from_current(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                executor.submit(
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    }
                    .boxed(),
                )
            })
            .collect();
        for handle in handles {
            handle.join().await;
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.available(), 2);
    }

    #[tokio::test]
    async fn schedule_waits_for_delay() {
        let executor = TokioExecutor::from_current(1).unwrap();
        let start = Instant::now();
        executor
            .schedule(Duration::from_millis(30), async {}.boxed())
            .join()
            .await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn aborted_scheduled_task_never_runs() {
        let executor = TokioExecutor::from_current(1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = executor.schedule(
            Duration::from_millis(50),
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );
        handle.abort();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(handle.is_finished());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn from_current_outside_runtime_fails() {
        assert!(matches!(
            TokioExecutor::from_current(1),
            Err(ShuttleError::Executor(_))
        ));
    }
}
