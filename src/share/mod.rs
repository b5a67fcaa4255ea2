//! The share process: exposes one local directory through a hub.

pub mod client;
pub mod content_server;
pub mod identity;

pub use client::{Registration, TunnelClient};
pub use content_server::{build_router, find_available_port, is_safe_path, ContentState};
pub use identity::ShareIdentity;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::ShareConfig;
use crate::fingerprint::{
    ExternalToolFingerprinter, FingerprintBackend, FingerprintCache, Sha1Fingerprinter,
};
use crate::indexer::{spawn_indexer, IndexUpdate};
use crate::shutdown_signal;

/// Pick the fingerprint backend for a share.
pub fn fingerprint_backend(config: &ShareConfig) -> Box<dyn FingerprintBackend> {
    match config.fingerprint_tool {
        Some(ref program) => Box::new(ExternalToolFingerprinter::new(program.clone())),
        None => Box::new(Sha1Fingerprinter),
    }
}

/// Open the fingerprint cache and start indexing `root`.
///
/// The initial directory walk and cache load run on the blocking pool.
pub async fn start_indexing(
    root: &Path,
    backend: Box<dyn FingerprintBackend>,
) -> Result<(thread::JoinHandle<()>, mpsc::UnboundedReceiver<IndexUpdate>)> {
    let root = root.to_path_buf();
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let indexer = tokio::task::spawn_blocking(move || -> Result<thread::JoinHandle<()>> {
        let cache = FingerprintCache::open(&root, backend)?;
        Ok(spawn_indexer(cache, updates_tx)?)
    })
    .await
    .context("Indexer startup was interrupted")??;
    Ok((indexer, updates_rx))
}

/// Run a share of `directory` until the tunnel fails or the process is signalled.
///
/// This will:
/// 1. Load (or create) the share identity
/// 2. Start the local content server on the first free port in range
/// 3. Start indexing and watching the directory
/// 4. Connect to the hub and serve tunnelled requests
pub async fn run_share(directory: PathBuf, config: ShareConfig) -> Result<()> {
    let root = directory
        .canonicalize()
        .with_context(|| format!("Share directory not found: {}", directory.display()))?;
    if !root.is_dir() {
        anyhow::bail!("Not a directory: {}", root.display());
    }

    let identity = ShareIdentity::load_or_create(&root)?;
    let share_id = identity.share_id();
    info!(share_id = %share_id, directory = %root.display(), "Sharing directory");

    let (low, high) = config.ports()?;
    let port = find_available_port(low, high)
        .ok_or_else(|| anyhow::anyhow!("No available port in range {}-{}", low, high))?;
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind content server on port {}", port))?;
    info!(port, "Content server listening");
    info!(
        "Web interface: {}://{}:{}/{}/web",
        config.protocol, config.host, port, share_id
    );

    let state = Arc::new(ContentState {
        root: root.clone(),
        share_id: share_id.clone(),
        web_dir: config.web_dir.clone(),
    });
    tokio::spawn(async move {
        if let Err(e) = content_server::serve(listener, state).await {
            error!("Content server failed: {}", e);
        }
    });

    let (_indexer, updates_rx) = start_indexing(&root, fingerprint_backend(&config)).await?;

    let stream = TcpStream::connect(&config.hub_address)
        .await
        .with_context(|| format!("Failed to connect to hub at {}", config.hub_address))?;
    info!(hub = %config.hub_address, "Connected to hub");

    let registration = Registration {
        share_id,
        public_key: identity.public_key,
        protocol: config.protocol.clone(),
        host: config.host.clone(),
        port,
    };
    let client = TunnelClient::new(registration, port)?;

    tokio::select! {
        result = client.run(stream, updates_rx) => {
            result.context("Tunnel to hub failed")
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping share");
            Ok(())
        }
    }
}
