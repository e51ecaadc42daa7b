//! Graceful shutdown coordination.
//!
//! Losing the leader election and process termination both funnel through
//! one coordinator so every spawned task observes a single shutdown signal,
//! releases its reply channels, and returns promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Shutdown coordinator shared by all controller tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_watch: watch::Receiver<bool>,
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    is_shutting_down: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_tx,
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal. Each task holds its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Begin shutdown. Idempotent.
    pub fn initiate(&self, reason: &str) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason, "Shutdown initiated");
        let _ = self.shutdown_tx.send(());
        let _ = self.shutdown_watch_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Wait until shutdown has been initiated.
    pub async fn wait(&self) {
        let mut watch = self.shutdown_watch.clone();
        while !*watch.borrow() {
            if watch.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initiate_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutting_down());

        coordinator.initiate("test");
        coordinator.initiate("again");
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_subscribers_observe_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        coordinator.initiate("test");
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_after_initiate() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = coordinator.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        coordinator.initiate("test");
        handle.await.unwrap();
    }
}
