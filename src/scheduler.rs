//! Per-deployment task scheduler
//!
//! Every deployment owns its own scheduler, so independent deployments can
//! run side by side in one process. Tasks are tracked until they finish;
//! shutdown cancels the cancellable ones and joins all of them.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Task scheduler with explicit drain and shutdown
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task that runs to completion even if its handle is dropped
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Spawn a task that is dropped at its next suspension point once the
    /// scheduler shuts down
    pub fn spawn_cancellable<F>(&self, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                output = task => Some(output),
            }
        })
    }

    /// Token cancelled on shutdown
    pub fn cancellation(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Number of tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every task spawned so far to finish. New tasks may still be
    /// spawned afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel cancellable tasks and join every task
    pub async fn shutdown(&self) {
        tracing::debug!("Shutting down scheduler with {} tasks", self.tracker.len());
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Whether shutdown has been requested
    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let scheduler = Scheduler::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            scheduler.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        scheduler.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.active_tasks(), 0);
        assert!(!scheduler.is_shut_down());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_streaming_tasks() {
        let scheduler = Scheduler::new();
        let handle = scheduler.spawn_cancellable(futures::future::pending::<()>());

        scheduler.shutdown().await;
        assert!(scheduler.is_shut_down());
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_independent_schedulers() {
        let a = Scheduler::new();
        let b = Scheduler::new();
        let handle = b.spawn_cancellable(async { 7 });

        a.shutdown().await;
        assert_eq!(handle.await.unwrap(), Some(7));
        assert!(!b.is_shut_down());
    }
}
