//! Graceful Shutdown Handler
//!
//! Coordinates shutdown of the WebSocket server, the per-connection loops
//! and the background sweeps.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;

/// Shutdown coordinator for graceful termination.
///
/// Counts live sockets and signals shutdown to every task holding a clone.
#[derive(Clone)]
pub struct ShutdownController {
    shutdown_initiated: Arc<AtomicBool>,
    /// Live WebSocket connections
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    /// Signalled when the last connection ends after shutdown began
    drain_complete: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            drain_complete: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to shutdown notifications.
    ///
    /// A receiver created after [`shutdown`](Self::shutdown) never fires;
    /// prefer [`cancelled`](Self::cancelled) in long-running loops.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Completes once shutdown has been initiated, however late it is awaited.
    pub async fn cancelled(&self) {
        let mut rx = self.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Initiate graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::info!(
                "initiating graceful shutdown, {} connections active",
                self.active_connections()
            );
            let _ = self.shutdown_tx.send(());
            if self.active_connections() == 0 {
                self.drain_complete.notify_waiters();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    fn connection_ended(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drain_complete.notify_waiters();
        }
    }

    /// Wait for all connections to drain. Returns false on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = self.drain_complete.notified();
        tokio::pin!(drained);
        // register interest before checking, so a drain in between is not lost
        drained.as_mut().enable();
        if self.active_connections() == 0 {
            return true;
        }

        tokio::select! {
            _ = drained => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "drain timeout: {} connections still active",
                    self.active_connections()
                );
                false
            }
        }
    }

    /// Count a connection until the returned guard is dropped.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            controller: self.clone(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one live connection.
pub struct ConnectionGuard {
    controller: ShutdownController,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.controller.connection_ended();
    }
}

/// Completes on SIGINT or SIGTERM and initiates shutdown.
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }

    controller.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_idempotent() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutdown());

        controller.shutdown();
        controller.shutdown();
        assert!(controller.is_shutdown());
    }

    #[test]
    fn test_connection_guards_count_live_sockets() {
        let controller = ShutdownController::new();

        let a = controller.connection_guard();
        {
            let _b = controller.connection_guard();
            assert_eq!(controller.active_connections(), 2);
        }
        assert_eq!(controller.active_connections(), 1);

        drop(a);
        assert_eq!(controller.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_shutdown() {
        let controller = ShutdownController::new();
        let mut rx = controller.subscribe();

        controller.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_after_shutdown_returns_immediately() {
        let controller = ShutdownController::new();
        controller.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(100), controller.cancelled()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiting_task() {
        let controller = ShutdownController::new();
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.shutdown();

        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_drain_without_connections() {
        let controller = ShutdownController::new();
        controller.shutdown();

        assert!(controller.wait_for_drain(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_wait_for_drain_as_connections_close() {
        let controller = ShutdownController::new();
        let guard = controller.connection_guard();
        controller.shutdown();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_wait_for_drain_timeout() {
        let controller = ShutdownController::new();
        let _guard = controller.connection_guard();
        controller.shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
    }
}
