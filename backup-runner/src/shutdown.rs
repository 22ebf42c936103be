//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A stop signal cancels the current run; in-flight files finish their copy
//! and the run reaches `reporting` with whatever it accomplished.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel `token` when SIGINT or SIGTERM arrives.
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling current run...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling current run...");
            }
        }

        token.cancel();
    });
}
