//! Cooperative shutdown signalling.
//!
//! The engine owns one `ShutdownCoordinator`. The scheduler loop checks it
//! at the top of every iteration and sleeps through it, so a stop request
//! ends the sleep early instead of waiting out the poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared cancellation flag with wake-up support.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request shutdown and wake every waiter. Repeated calls are no-ops.
    pub fn request_shutdown(&self) {
        let was_requested = self.shutdown_requested.swap(true, Ordering::SeqCst);
        if !was_requested {
            info!("Shutdown requested");
            self.notify.notify_waiters();
        }
    }

    /// Clear the flag so the owner can be started again.
    pub fn reset(&self) {
        self.shutdown_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested. Returns immediately if it already was.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a request landing
        // between the check and the await is not lost.
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if woken by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_shutdown_requested(),
            _ = self.wait_for_shutdown() => false,
        }
    }

    /// Spawn a task that requests shutdown on SIGINT/SIGTERM (Ctrl+C elsewhere).
    pub fn start_signal_listener(&self) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate())
                {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to create SIGTERM handler: {}", e);
                        signal::ctrl_c().await.ok();
                        coordinator.request_shutdown();
                        return;
                    }
                };

                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
                    _ = signal::ctrl_c() => info!("Received SIGINT, stopping"),
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received Ctrl+C, stopping");
            }

            coordinator.request_shutdown();
        });
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
    async fn test_request_and_reset() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_requested());

        coordinator.request_shutdown();
        coordinator.request_shutdown();
        assert!(coordinator.is_shutdown_requested());

        coordinator.reset();
        assert!(!coordinator.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_wait_returns_when_already_requested() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown();

        let result =
            tokio::time::timeout(Duration::from_millis(100), coordinator.wait_for_shutdown()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_is_interrupted_by_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let other = coordinator.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            other.request_shutdown();
        });

        let started = std::time::Instant::now();
        let completed = coordinator.sleep(Duration::from_secs(30)).await;

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_completes_without_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.sleep(Duration::from_millis(10)).await);
    }
}
