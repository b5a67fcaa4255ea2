//! The hub process: accepts share tunnels and answers lookups.

pub mod index;
pub mod locator;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod session;
pub mod tunnel_server;

pub use locator::{FileLocator, LocateError, LocateResult, LocalStore, RawDirectoryStore};
pub use registry::{RegistryError, SessionRegistry};
pub use routes::{build_router, HubState};
pub use session::{SessionError, SessionHandle, ShareInfo};
pub use tunnel_server::{TunnelHandle, TunnelServer};

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::HubConfig;
use crate::shutdown_signal;

/// A hub whose listeners are up
pub struct RunningHub {
    pub registry: Arc<SessionRegistry>,
    pub tunnel: TunnelHandle,
    pub http_addr: SocketAddr,
    /// Base of the URLs handed out by lookups
    pub base_url: String,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl RunningHub {
    /// Stop the HTTP server and the tunnel listener.
    pub async fn shutdown(self) {
        self.tunnel.shutdown();
        let _ = self.shutdown_tx.send(());
        let _ = self.server.await;
    }
}

/// Bind both listeners and start serving in the background.
///
/// A port of 0 binds an ephemeral port. An empty `url` advertises the bound
/// HTTP port on loopback.
pub async fn start_hub(config: &HubConfig, data_dir: &Path) -> Result<RunningHub> {
    let registry = Arc::new(SessionRegistry::new(config.max_shares));

    let tunnel = TunnelServer::new(Arc::clone(&registry), config.max_files_per_share)
        .start(("0.0.0.0", config.tunnel_port))
        .await
        .with_context(|| format!("Failed to start tunnel server on port {}", config.tunnel_port))?;

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("Failed to bind HTTP server on port {}", config.listen_port))?;
    let http_addr = listener.local_addr()?;

    let base_url = if config.url.is_empty() {
        format!("http://127.0.0.1:{}", http_addr.port())
    } else {
        config.base_url().to_string()
    };

    let store = Arc::new(RawDirectoryStore::new(data_dir));
    std::fs::create_dir_all(store.dir())
        .with_context(|| format!("Failed to create raw store at {}", store.dir().display()))?;

    let locator = FileLocator::new(
        base_url.clone(),
        store.clone(),
        Arc::clone(&registry),
        config.locate_timeout(),
    );
    let state = Arc::new(HubState {
        registry: Arc::clone(&registry),
        locator,
        store,
        response_timeout: config.response_timeout(),
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            error!("HTTP server failed: {}", e);
        }
    });

    info!("Hub running at {} (HTTP on {})", base_url, http_addr);

    Ok(RunningHub {
        registry,
        tunnel,
        http_addr,
        base_url,
        shutdown_tx,
        server,
    })
}

/// Run the hub until Ctrl+C or SIGTERM.
pub async fn run_hub(config: HubConfig, data_dir: &Path) -> Result<()> {
    let hub = start_hub(&config, data_dir).await?;
    info!(tunnel = %hub.tunnel.local_addr(), "Waiting for shares");

    shutdown_signal().await;
    info!("Received shutdown signal, stopping hub");
    hub.shutdown().await;
    Ok(())
}
