//! Shutdown coordination for the tunnel.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Coordinator for graceful shutdown.
///
/// Every long-running task is spawned through `spawn` so `wait` can drain
/// them, and every task observes the same cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled by `trigger`.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A token cancelled by `trigger` that can also be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown triggered");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Spawn a supervised task.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Number of supervised tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting new tasks and wait for running ones, at most `drain`.
    /// Returns false if tasks were still running at the deadline.
    pub async fn wait(&self, drain: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(drain, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = self.tracker.len(),
                    "Drain deadline reached with tasks still running"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_children() {
        let shutdown = Shutdown::new();
        let child = shutdown.child_token();
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        assert!(child.is_cancelled());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_drains_tasks() {
        let shutdown = Shutdown::new();
        let token = shutdown.child_token();
        shutdown.spawn(async move { token.cancelled().await });
        assert_eq!(shutdown.active_tasks(), 1);

        assert!(!shutdown.wait(Duration::from_millis(20)).await);
        shutdown.trigger();
        assert!(shutdown.wait(Duration::from_secs(1)).await);
        assert_eq!(shutdown.active_tasks(), 0);
    }
}
