//! State of one connected share, owned by its connection task.
//!
//! The connection task is the only owner of a [`SessionState`]. Everything else
//! (HTTP handlers, the locator) talks to it through a cloneable
//! [`SessionHandle`], either by sending a [`SessionCommand`] or, for request
//! bodies, by queueing tunnel messages directly on the outbound channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{Headers, HubMessage, RequestId, ShareId, ShareMessage};

use super::index::{IndexedFile, ShareIndex};

/// Prefix under which the hub mounts share content servers
pub const SHARE_MOUNT: &str = "/share";

/// Capacity of a session's command channel
const COMMAND_BUFFER: usize = 64;

/// Capacity of the queue of messages waiting to be written to the share
const OUTBOUND_BUFFER: usize = 64;

/// Response events buffered per request before the session waits for its reader
pub const RESPONSE_BUFFER: usize = 16;

/// Longest the session waits for a reader to make room for one event
const DELIVERY_STALL_LIMIT: Duration = Duration::from_secs(60);

/// How many expired request ids are remembered to absorb late share messages
const EXPIRED_MEMORY: usize = 1024;

/// Errors that can occur in a share session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Share index holds {files} files, above the limit of {limit}")]
    IndexFull { files: usize, limit: usize },

    #[error("Session closed")]
    Closed,

    #[error("Share did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Tunnel to share is congested")]
    Busy,
}

impl SessionError {
    fn violation(message: impl Into<String>) -> Self {
        SessionError::ProtocolViolation(message.into())
    }
}

/// What a share advertised when it registered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShareInfo {
    pub share_id: ShareId,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(skip)]
    pub public_key: String,
}

impl ShareInfo {
    /// URL downloading `path` straight from the share, if it advertised an address.
    pub fn direct_url(&self, path: &str) -> Option<String> {
        if self.host.is_empty() || self.port == 0 {
            return None;
        }
        Some(format!(
            "{}://{}:{}/{}/download/{}",
            self.protocol,
            self.host,
            self.port,
            self.share_id,
            encode_path(path)
        ))
    }
}

/// Percent-encode each segment of a relative path.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Progress of a tunnelled response, as seen by the waiting HTTP handler
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Headers { status: u16, headers: Headers },
    Data(Bytes),
    End,
    Error(String),
}

/// Snapshot of a session for listings
#[derive(Debug, Clone, Serialize)]
pub struct ShareSummary {
    #[serde(flatten)]
    pub info: ShareInfo,
    pub files: usize,
    pub pending_requests: usize,
}

/// Requests a session's owner task can serve
#[derive(Debug)]
pub enum SessionCommand {
    /// Start a tunnelled request; replies with the id it was given
    BeginRequest {
        method: String,
        path: String,
        headers: Headers,
        events: mpsc::Sender<ResponseEvent>,
        reply: oneshot::Sender<Result<RequestId, SessionError>>,
    },
    /// Stop delivering events for a request whose caller gave up
    Abandon { request_id: RequestId },
    FindFile {
        checksum: String,
        reply: oneshot::Sender<Option<IndexedFile>>,
    },
    Describe { reply: oneshot::Sender<ShareSummary> },
}

/// A request awaiting its response from the share
///
/// A request without an event sink has been abandoned: it still occupies its
/// id until the share finishes it or it expires, but nothing is delivered.
struct PendingRequest {
    events: Option<mpsc::Sender<ResponseEvent>>,
    headers_sent: bool,
    abandoned_at: Option<Instant>,
}

impl PendingRequest {
    /// Hand an event to the reader, waiting while its buffer is full.
    ///
    /// A reader that is gone, or that frees no room within the stall limit,
    /// loses its sink; its response then ends with an error.
    async fn deliver(&mut self, event: ResponseEvent) {
        let Some(ref events) = self.events else {
            return;
        };
        let sent = tokio::time::timeout(DELIVERY_STALL_LIMIT, events.send(event)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(_)) => self.events = None,
            Err(_) => {
                warn!("Response reader stalled, dropping its stream");
                self.events = None;
            }
        }
    }

    /// Deliver without waiting, for teardown paths.
    fn notify(&mut self, event: ResponseEvent) {
        if let Some(events) = self.events.take() {
            let _ = events.try_send(event);
        }
    }
}

/// Everything the hub tracks for one connected share
pub struct SessionState {
    info: Arc<ShareInfo>,
    index: ShareIndex,
    pending: HashMap<RequestId, PendingRequest>,
    expired: VecDeque<RequestId>,
    outbound: mpsc::Sender<HubMessage>,
}

/// The pieces of a freshly opened session
pub struct SessionParts {
    pub state: SessionState,
    pub handle: SessionHandle,
    pub commands: mpsc::Receiver<SessionCommand>,
    pub outbound: mpsc::Receiver<HubMessage>,
}

/// Create the state, handle and channels of a new session.
pub fn open_session(info: ShareInfo, max_files: usize) -> SessionParts {
    let info = Arc::new(info);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

    SessionParts {
        state: SessionState {
            info: Arc::clone(&info),
            index: ShareIndex::new(max_files),
            pending: HashMap::new(),
            expired: VecDeque::new(),
            outbound: outbound_tx.clone(),
        },
        handle: SessionHandle {
            info,
            commands: commands_tx,
            outbound: outbound_tx,
        },
        commands: commands_rx,
        outbound: outbound_rx,
    }
}

impl SessionState {
    pub fn info(&self) -> &ShareInfo {
        &self.info
    }

    pub fn index(&self) -> &ShareIndex {
        &self.index
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Apply one message received from the share.
    ///
    /// Waits while the reader of a response has no room for more of it, which
    /// stops the session reading from the share. A `ProtocolViolation` means
    /// the connection must be dropped.
    pub async fn handle_share_message(&mut self, message: ShareMessage) -> Result<(), SessionError> {
        if let Some(request_id) = response_request_id(&message) {
            if !self.pending.contains_key(request_id) && self.expired.contains(request_id) {
                debug!(request_id = %request_id, "Dropping message for expired request");
                if message.is_terminal() {
                    self.expired.retain(|id| id != request_id);
                }
                return Ok(());
            }
        }

        match message {
            ShareMessage::Register { .. } => Err(SessionError::violation("register sent twice")),

            ShareMessage::SetFileInfo { path, fingerprint } => {
                match self.index.set_file_info(&path, fingerprint) {
                    Ok(()) => {}
                    Err(e @ SessionError::IndexFull { .. }) => {
                        warn!(share_id = %self.info.share_id, "{}", e);
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            }

            ShareMessage::SetResponseHeaders {
                request_id,
                status,
                mut headers,
                ..
            } => {
                let pending = self.pending_mut(&request_id)?;
                if pending.headers_sent {
                    return Err(SessionError::violation(format!(
                        "headers sent twice for {}",
                        request_id
                    )));
                }
                pending.headers_sent = true;
                rewrite_location(&mut headers);
                pending.deliver(ResponseEvent::Headers { status, headers }).await;
                Ok(())
            }

            ShareMessage::WriteResponseData { request_id, data } => {
                let pending = self.pending_mut(&request_id)?;
                if !pending.headers_sent {
                    return Err(SessionError::violation(format!(
                        "data before headers for {}",
                        request_id
                    )));
                }
                pending.deliver(ResponseEvent::Data(Bytes::from(data))).await;
                Ok(())
            }

            ShareMessage::EndResponse { request_id } => {
                let mut pending = self.take_pending(&request_id)?;
                pending.deliver(ResponseEvent::End).await;
                Ok(())
            }

            ShareMessage::ReportError { request_id, error } => {
                let mut pending = self.take_pending(&request_id)?;
                debug!(request_id = %request_id, "Share reported error: {}", error);
                pending.deliver(ResponseEvent::Error(error)).await;
                Ok(())
            }
        }
    }

    fn pending_mut(&mut self, request_id: &RequestId) -> Result<&mut PendingRequest, SessionError> {
        self.pending
            .get_mut(request_id)
            .ok_or_else(|| SessionError::violation(format!("unknown request id {}", request_id)))
    }

    fn take_pending(&mut self, request_id: &RequestId) -> Result<PendingRequest, SessionError> {
        self.pending
            .remove(request_id)
            .ok_or_else(|| SessionError::violation(format!("unknown request id {}", request_id)))
    }

    /// Serve one command from a handle.
    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::BeginRequest {
                method,
                path,
                headers,
                events,
                reply,
            } => {
                let request_id = loop {
                    let candidate = RequestId::generate();
                    if !self.pending.contains_key(&candidate) && !self.expired.contains(&candidate) {
                        break candidate;
                    }
                };
                debug!(
                    share_id = %self.info.share_id,
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    "Initiating tunnelled request"
                );
                let initiate = HubMessage::InitiateRequest {
                    request_id: request_id.clone(),
                    method,
                    path,
                    headers,
                };
                // Never wait here: the writer may be blocked on a share that is
                // itself waiting for this session to read
                match self.outbound.try_send(initiate) {
                    Ok(()) => {
                        self.pending.insert(
                            request_id.clone(),
                            PendingRequest {
                                events: Some(events),
                                headers_sent: false,
                                abandoned_at: None,
                            },
                        );
                        let _ = reply.send(Ok(request_id));
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(share_id = %self.info.share_id, "Outbound queue full, refusing request");
                        let _ = reply.send(Err(SessionError::Busy));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        let _ = reply.send(Err(SessionError::Closed));
                    }
                }
            }

            SessionCommand::Abandon { request_id } => {
                if let Some(pending) = self.pending.get_mut(&request_id) {
                    debug!(request_id = %request_id, "Request abandoned by caller");
                    pending.events = None;
                    pending.abandoned_at = Some(Instant::now());
                }
            }

            SessionCommand::FindFile { checksum, reply } => {
                let _ = reply.send(self.index.find(&checksum));
            }

            SessionCommand::Describe { reply } => {
                let _ = reply.send(ShareSummary {
                    info: (*self.info).clone(),
                    files: self.index.len(),
                    pending_requests: self.pending.len(),
                });
            }
        }
    }

    /// Fail every pending request, as when the connection goes away.
    pub fn fail_pending(&mut self, reason: &str) {
        for (_, mut pending) in self.pending.drain() {
            pending.notify(ResponseEvent::Error(reason.to_string()));
        }
    }

    /// Forget requests abandoned more than `ttl` before `now`.
    ///
    /// Their ids are remembered for a while so that a share answering late is
    /// not taken for a protocol violation.
    pub fn prune_abandoned(&mut self, now: Instant, ttl: Duration) -> usize {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, pending)| {
                pending
                    .abandoned_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= ttl)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for request_id in &expired {
            self.pending.remove(request_id);
            if self.expired.len() == EXPIRED_MEMORY {
                self.expired.pop_front();
            }
            self.expired.push_back(request_id.clone());
        }
        if !expired.is_empty() {
            debug!(share_id = %self.info.share_id, count = expired.len(), "Expired abandoned requests");
        }
        expired.len()
    }
}

/// Request id of a message that belongs to a tunnelled response.
fn response_request_id(message: &ShareMessage) -> Option<&RequestId> {
    match message {
        ShareMessage::SetResponseHeaders { request_id, .. }
        | ShareMessage::WriteResponseData { request_id, .. }
        | ShareMessage::EndResponse { request_id }
        | ShareMessage::ReportError { request_id, .. } => Some(request_id),
        ShareMessage::Register { .. } | ShareMessage::SetFileInfo { .. } => None,
    }
}

/// Point share-relative redirects at the hub's share mount.
fn rewrite_location(headers: &mut Headers) {
    if let Some(location) = headers.get_mut("location") {
        if location.starts_with('/') {
            *location = format!("{}{}", SHARE_MOUNT, location);
        }
    }
}

/// Cloneable handle to a live session
#[derive(Clone)]
pub struct SessionHandle {
    info: Arc<ShareInfo>,
    commands: mpsc::Sender<SessionCommand>,
    outbound: mpsc::Sender<HubMessage>,
}

impl SessionHandle {
    pub fn info(&self) -> &ShareInfo {
        &self.info
    }

    pub fn share_id(&self) -> &ShareId {
        &self.info.share_id
    }

    /// Whether the owning connection task is gone.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Start a tunnelled request, returning its id and the event stream.
    pub async fn begin_request(
        &self,
        method: String,
        path: String,
        headers: Headers,
    ) -> Result<(RequestId, mpsc::Receiver<ResponseEvent>), SessionError> {
        let (events_tx, events_rx) = mpsc::channel(RESPONSE_BUFFER);
        let request_id = self
            .command(|reply| SessionCommand::BeginRequest {
                method,
                path,
                headers,
                events: events_tx,
                reply,
            })
            .await??;
        Ok((request_id, events_rx))
    }

    /// Queue a chunk of request body, waiting while the tunnel is backed up.
    pub async fn send_body(&self, request_id: &RequestId, data: Bytes) -> Result<(), SessionError> {
        self.outbound
            .send(HubMessage::WriteRequestData {
                request_id: request_id.clone(),
                data: data.to_vec(),
            })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Mark the request body complete.
    pub async fn end_body(&self, request_id: &RequestId) -> Result<(), SessionError> {
        self.outbound
            .send(HubMessage::EndRequest {
                request_id: request_id.clone(),
            })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Stop listening for a request's response.
    pub async fn abandon(&self, request_id: RequestId) {
        let _ = self
            .commands
            .send(SessionCommand::Abandon { request_id })
            .await;
    }

    /// Ask the share's index for a checksum, giving up after `timeout`.
    pub async fn find_file(
        &self,
        checksum: &str,
        timeout: Duration,
    ) -> Result<Option<IndexedFile>, SessionError> {
        let checksum = checksum.to_string();
        tokio::time::timeout(
            timeout,
            self.command(|reply| SessionCommand::FindFile { checksum, reply }),
        )
        .await
        .map_err(|_| SessionError::Timeout(timeout))?
    }

    pub async fn summary(&self) -> Result<ShareSummary, SessionError> {
        self.command(|reply| SessionCommand::Describe { reply }).await
    }
}
