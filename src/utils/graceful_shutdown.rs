use std::time::Duration;

use tokio::{signal, sync::watch};

/// Why the gateway is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// Requested programmatically, e.g. by a test harness
    Requested,
}

/// Coordinates shutdown between the OS signal handler, the listener and
/// background tasks.
///
/// Built on a `watch` channel, so tokens taken after shutdown has started
/// still observe it.
#[derive(Debug)]
pub struct GracefulShutdown {
    tx: watch::Sender<Option<ShutdownReason>>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Shutdown manager with a 30 second drain window.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, drain_timeout }
    }

    /// How long in-flight requests may take once shutdown has started.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Start shutdown. Only the first call has any effect.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        let started = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if started {
            tracing::info!("Shutdown initiated: {:?}", reason);
        } else {
            tracing::debug!("Shutdown already initiated, ignoring {:?}", reason);
        }
    }

    /// Wait for SIGINT or SIGTERM and start shutdown.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token().wait() => return,
        }

        self.trigger_shutdown(ShutdownReason::Signal);
    }

    /// Token resolving once shutdown starts.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // only Ctrl+C exists here
    std::future::pending::<()>().await;
}

/// Cloneable handle that resolves when shutdown starts.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownToken {
    pub fn is_shutdown_initiated(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait until shutdown starts. A dropped manager counts as shutdown.
    pub async fn wait(mut self) -> ShutdownReason {
        let reason = match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        reason.unwrap_or(ShutdownReason::Requested)
    }
}
