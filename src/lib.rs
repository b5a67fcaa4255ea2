//! kbucket: share local directories through a hub and locate files by content.
//!
//! A share process indexes a directory, keeps a tunnel open to its hub and
//! serves the hub's tunnelled HTTP requests from its local content server. The
//! hub keeps one session per connected share and answers "where is the file
//! with this SHA-1" by asking its own store and the connected shares.

pub mod config;
pub mod fingerprint;
pub mod hub;
pub mod indexer;
pub mod logging;
pub mod protocol;
pub mod share;

use tokio::signal;

/// Wait for the shutdown signal (Ctrl+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
