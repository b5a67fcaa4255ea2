//! Tunnel listener accepting share connections.
//!
//! Each accepted connection must open with a `register` message. After that a
//! single task owns the session: it reads share messages off the socket and
//! serves commands from session handles, while a companion task writes queued
//! hub messages back to the share.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{parse_message, write_message, HubMessage, ShareId, ShareMessage, TunnelError};

use super::registry::SessionRegistry;
use super::session::{open_session, SessionCommand, SessionParts, SessionState, ShareInfo};

/// Time a new connection gets to send its `register` message
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an abandoned request may wait for the share to finish it
const ABANDONED_TTL: Duration = Duration::from_secs(600);

/// How often sessions look for expired abandoned requests
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Accepts tunnels from shares and runs their sessions
pub struct TunnelServer {
    registry: Arc<SessionRegistry>,
    max_files_per_share: usize,
    shutdown_tx: broadcast::Sender<()>,
}

/// Handle to control a running tunnel server
pub struct TunnelHandle {
    shutdown_tx: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

impl TunnelHandle {
    /// Stop accepting shares and close every session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl TunnelServer {
    pub fn new(registry: Arc<SessionRegistry>, max_files_per_share: usize) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry,
            max_files_per_share,
            shutdown_tx,
        }
    }

    /// Bind the listener and start accepting connections in the background.
    pub async fn start(self, addr: impl ToSocketAddrs) -> Result<TunnelHandle, TunnelError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Tunnel server listening on {}", local_addr);

        let handle = TunnelHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            local_addr,
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer)) => {
                                debug!("Accepted tunnel connection from {}", peer);
                                let registry = Arc::clone(&self.registry);
                                let max_files = self.max_files_per_share;
                                let conn_shutdown_rx = shutdown_rx.resubscribe();

                                tokio::spawn(async move {
                                    match handle_connection(stream, registry, max_files, conn_shutdown_rx).await {
                                        Ok(()) => debug!("Tunnel from {} closed", peer),
                                        Err(TunnelError::ConnectionClosed) => {
                                            debug!("Tunnel from {} closed before registering", peer);
                                        }
                                        Err(e @ TunnelError::ProtocolViolation(_)) => {
                                            warn!("Aborting tunnel from {}: {}", peer, e);
                                        }
                                        Err(e) => error!("Tunnel error from {}: {}", peer, e),
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        info!("Tunnel server stopping");
                        break;
                    }
                }
            }
        });

        Ok(handle)
    }
}

/// Serve one share connection from registration to teardown.
async fn handle_connection(
    stream: TcpStream,
    registry: Arc<SessionRegistry>,
    max_files: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), TunnelError> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let info = read_registration(&mut lines).await?;
    let share_id = info.share_id.clone();

    let SessionParts {
        mut state,
        handle,
        mut commands,
        outbound,
    } = open_session(info, max_files);

    registry
        .register(handle)
        .await
        .map_err(|e| TunnelError::Registration(e.to_string()))?;

    let mut writer = tokio::spawn(write_outbound(write_half, outbound));

    let result = run_session(
        &mut state,
        &mut lines,
        &mut commands,
        &mut writer,
        &mut shutdown_rx,
    )
    .await;

    registry.unregister(&share_id).await;
    state.fail_pending("Share disconnected");
    writer.abort();
    info!(share_id = %share_id, "Share session ended");
    result
}

async fn read_registration(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) -> Result<ShareInfo, TunnelError> {
    let line = tokio::time::timeout(REGISTER_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| TunnelError::Registration("timed out waiting for register".to_string()))??
        .ok_or(TunnelError::ConnectionClosed)?;

    match parse_message::<ShareMessage>(&line)? {
        ShareMessage::Register {
            share_id,
            share_protocol,
            share_host,
            share_port,
            public_key,
        } => {
            let share_id: ShareId = share_id
                .as_str()
                .parse()
                .map_err(TunnelError::Registration)?;
            Ok(ShareInfo {
                share_id,
                protocol: share_protocol,
                host: share_host,
                port: share_port,
                public_key,
            })
        }
        other => Err(TunnelError::violation(format!(
            "expected register, got {}",
            other.command()
        ))),
    }
}

async fn run_session(
    state: &mut SessionState,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    commands: &mut mpsc::Receiver<SessionCommand>,
    writer: &mut JoinHandle<Result<(), TunnelError>>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), TunnelError> {
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!(share_id = %state.info().share_id, "Share disconnected");
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                let message: ShareMessage = parse_message(&line)?;
                state
                    .handle_share_message(message)
                    .await
                    .map_err(|e| TunnelError::violation(e.to_string()))?;
            }

            Some(command) = commands.recv() => {
                state.handle_command(command);
            }

            written = &mut *writer => {
                warn!(share_id = %state.info().share_id, "Writer to share stopped");
                return match written {
                    Ok(Ok(())) => Err(TunnelError::ConnectionClosed),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(TunnelError::Io(std::io::Error::other(e))),
                };
            }

            _ = prune.tick() => {
                state.prune_abandoned(Instant::now(), ABANDONED_TTL);
            }

            _ = shutdown_rx.recv() => {
                return Ok(());
            }
        }
    }
}

/// Write queued messages to the share until the queue closes or a write fails.
async fn write_outbound(
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<HubMessage>,
) -> Result<(), TunnelError> {
    let mut writer = BufWriter::new(write_half);
    while let Some(message) = outbound.recv().await {
        write_message(&mut writer, &message).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn info() -> ShareInfo {
        ShareInfo {
            share_id: ShareId::new("share00001"),
            protocol: "http".to_string(),
            host: String::new(),
            port: 0,
            public_key: String::new(),
        }
    }

    #[tokio::test]
    async fn test_session_ends_when_writer_fails() {
        let (_share_side, hub_side) = connected_pair().await;
        let (read_half, _write_half) = hub_side.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let SessionParts {
            mut state,
            mut commands,
            ..
        } = open_session(info(), 10);
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let mut writer: JoinHandle<Result<(), TunnelError>> =
            tokio::spawn(async { Err(TunnelError::ConnectionClosed) });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_session(&mut state, &mut lines, &mut commands, &mut writer, &mut shutdown_rx),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(TunnelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_writer_sends_queued_messages() {
        let (share_side, hub_side) = connected_pair().await;
        let (_read_half, write_half) = hub_side.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let writer = tokio::spawn(write_outbound(write_half, outbound_rx));

        outbound_tx
            .send(HubMessage::EndRequest {
                request_id: crate::protocol::RequestId::new("req00001"),
            })
            .await
            .unwrap();
        drop(outbound_tx);
        writer.await.unwrap().unwrap();

        let mut lines = BufReader::new(share_side).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let message: HubMessage = parse_message(&line).unwrap();
        assert_eq!(
            message,
            HubMessage::EndRequest {
                request_id: crate::protocol::RequestId::new("req00001"),
            }
        );
    }
}
