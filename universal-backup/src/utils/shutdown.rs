//! Signal handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run's token; in-flight captures and transfers notice
//! it at their next chunk boundary and clean up their partial output.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bridges process signals to a cancellation token
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token handed to engines; cancelled on the first signal
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a task that waits for SIGINT/SIGTERM and cancels the token.
    pub fn install(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            token.cancel();
        });
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
            info!("Received SIGINT (Ctrl+C), cancelling run...");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling run...");
        }
    }
}
