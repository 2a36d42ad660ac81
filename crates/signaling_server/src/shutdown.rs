//! Graceful shutdown
//!
//! Cancelling the root token stops the listener, tells every connection to
//! wind down and stops the sweeper. The tracker then drains whatever is
//! still running, bounded by the configured timeout.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    tracker: TaskTracker,
    is_shutting_down: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new(cancel: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            cancel,
            tracker,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }

    /// Cancel everything and wait for tracked tasks to finish
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<()> {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Shutdown already in progress");
            return Ok(());
        }

        info!(in_flight = self.tracker.len(), "Initiating graceful shutdown");

        self.cancel.cancel();
        self.tracker.close();

        match timeout(drain_timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("Shutdown complete");
                Ok(())
            }
            Err(_) => {
                error!(remaining = self.tracker.len(), "Shutdown timeout exceeded");
                anyhow::bail!("Shutdown timeout exceeded");
            }
        }
    }

    /// Wait for Ctrl+C or SIGTERM
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            }
            _ = terminate => {
                info!("Received SIGTERM signal");
            }
            _ = self.cancel.cancelled() => {
                info!("Shutdown requested internally");
            }
        }
    }
}
