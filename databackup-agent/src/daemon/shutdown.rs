//! Signal handling for SIGTERM and SIGINT.
//!
//! A signal cancels the running session between entries: the entry in
//! flight finishes and is logged, nothing further is started.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels a session token when the process is asked to stop
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token.
    ///
    /// Returns early without cancelling if the token is cancelled elsewhere.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling session after the current entry...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling session after the current entry...");
            }
            _ = self.token.cancelled() => return,
        }

        self.token.cancel();
    }

    /// Run the signal watcher in the background
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.wait_for_signal().await })
    }
}
