//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] turns SIGINT/SIGTERM into a notification every
//! component can wait on. The worker stops reading new deliveries, lets the
//! in-flight batch settle, then stops the repost timers.
//!
//! # Example
//!
//! ```rust,ignore
//! use herald::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! tokio::spawn(shutdown.clone().listen());
//!
//! loop {
//!     tokio::select! {
//!         _ = shutdown.triggered() => break,
//!         batch = consumer.receive(2000) => { /* ... */ }
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn listen(self) {
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
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
        }

        self.trigger();
    }

    /// Trigger shutdown manually (for tests or programmatic shutdown).
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub async fn triggered(&self) {
        let notified = self.inner.notify.notified();
        if self.is_shutdown() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), signal.triggered()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_waiter_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let result = tokio::time::timeout(Duration::from_millis(50), signal.triggered()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();

        other.trigger();
        assert!(signal.is_shutdown());
    }
}
