//! Share side of the tunnel.
//!
//! The client registers with the hub, streams index updates to it, and
//! executes the HTTP requests the hub forwards against the share's local
//! content server, relaying each response back as a sequence of messages.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc as body_mpsc;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::indexer::IndexUpdate;
use crate::protocol::{
    headers_to_map, map_to_headers, parse_message, write_message, Headers, HubMessage, RequestId,
    ShareId, ShareMessage, TunnelError,
};

/// Capacity of the channel carrying response messages to the socket writer
const OUTGOING_BUFFER: usize = 64;

/// Request body chunks buffered before the tunnel waits for the local server
const BODY_BUFFER: usize = 16;

/// Longest the tunnel waits for the local server to take one body chunk
const BODY_STALL_LIMIT: Duration = Duration::from_secs(60);

type BodyChunk = Result<Bytes, std::io::Error>;
type BodySender = body_mpsc::Sender<BodyChunk>;
type BodyReceiver = body_mpsc::Receiver<BodyChunk>;

/// What a share announces about itself when it connects
#[derive(Debug, Clone)]
pub struct Registration {
    pub share_id: ShareId,
    pub public_key: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl Registration {
    fn message(&self) -> ShareMessage {
        ShareMessage::Register {
            share_id: self.share_id.clone(),
            share_protocol: self.protocol.clone(),
            share_host: self.host.clone(),
            share_port: self.port,
            public_key: self.public_key.clone(),
        }
    }
}

/// A tunnelled request being executed against the local server
///
/// Stays pending until the hub has ended the request body and the local
/// response has finished. The body sink is dropped early if the local
/// request stops reading it.
struct LocalRequest {
    body: Option<BodySender>,
    body_ended: bool,
    response_done: bool,
}

impl LocalRequest {
    fn new(body: BodySender) -> Self {
        Self {
            body: Some(body),
            body_ended: false,
            response_done: false,
        }
    }

    fn is_finished(&self) -> bool {
        self.body_ended && self.response_done
    }
}

/// Share side tunnel client
pub struct TunnelClient {
    registration: Registration,
    local_base: String,
    http: reqwest::Client,
    pending: HashMap<RequestId, LocalRequest>,
}

impl TunnelClient {
    /// Create a client that forwards requests to the content server on `local_port`.
    pub fn new(registration: Registration, local_port: u16) -> Result<Self, TunnelError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            registration,
            local_base: format!("http://127.0.0.1:{}", local_port),
            http,
            pending: HashMap::new(),
        })
    }

    /// Run the tunnel over an established connection.
    ///
    /// Only returns on failure: the hub closing the connection, an I/O error or
    /// a protocol violation.
    pub async fn run(
        mut self,
        stream: TcpStream,
        mut updates: mpsc::UnboundedReceiver<IndexUpdate>,
    ) -> Result<(), TunnelError> {
        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut writer = BufWriter::new(write_half);

        write_message(&mut writer, &self.registration.message()).await?;
        info!(share_id = %self.registration.share_id, "Registered with hub");

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ShareMessage>(OUTGOING_BUFFER);
        let mut updates_open = true;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Err(TunnelError::ConnectionClosed);
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message: HubMessage = parse_message(&line)?;
                    self.handle_hub_message(message, &outgoing_tx).await?;
                }

                Some(message) = outgoing_rx.recv() => {
                    if message.is_terminal() {
                        self.finish_response(&message);
                    }
                    write_message(&mut writer, &message).await?;
                }

                update = updates.recv(), if updates_open => {
                    match update {
                        Some(update) => {
                            let message = ShareMessage::SetFileInfo {
                                path: update.path,
                                fingerprint: update.fingerprint,
                            };
                            write_message(&mut writer, &message).await?;
                        }
                        None => {
                            warn!("Indexer stopped, index updates will no longer be sent");
                            updates_open = false;
                        }
                    }
                }
            }
        }
    }

    /// Number of tunnelled requests still in flight.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Apply one message from the hub.
    ///
    /// Request body chunks wait for room in the local request's buffer, which
    /// stops the tunnel reading from the hub until the local server catches up.
    async fn handle_hub_message(
        &mut self,
        message: HubMessage,
        outgoing: &mpsc::Sender<ShareMessage>,
    ) -> Result<(), TunnelError> {
        match message {
            HubMessage::InitiateRequest {
                request_id,
                method,
                path,
                headers,
            } => {
                if self.pending.contains_key(&request_id) {
                    return Err(TunnelError::violation(format!(
                        "request id already pending: {}",
                        request_id
                    )));
                }
                debug!(request_id = %request_id, method = %method, path = %path, "Forwarding request");

                let (body_tx, body_rx) = body_mpsc::channel(BODY_BUFFER);
                self.pending
                    .insert(request_id.clone(), LocalRequest::new(body_tx));

                let url = format!("{}/{}", self.local_base, path.trim_start_matches('/'));
                tokio::spawn(forward_local(
                    self.http.clone(),
                    request_id,
                    method,
                    url,
                    headers,
                    body_rx,
                    outgoing.clone(),
                ));
            }

            HubMessage::WriteRequestData { request_id, data } => {
                let request = self.pending.get_mut(&request_id).ok_or_else(|| {
                    TunnelError::violation(format!("data for unknown request id: {}", request_id))
                })?;
                if request.body_ended {
                    return Err(TunnelError::violation(format!(
                        "data after end of request: {}",
                        request_id
                    )));
                }
                // The local request may already have failed; its error is reported separately
                if let Some(body) = request.body.as_mut() {
                    let queued =
                        tokio::time::timeout(BODY_STALL_LIMIT, body.feed(Ok(Bytes::from(data)))).await;
                    match queued {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => request.body = None,
                        Err(_) => {
                            warn!(request_id = %request_id, "Local server stalled reading request body");
                            request.body = None;
                        }
                    }
                }
            }

            HubMessage::EndRequest { request_id } => {
                let request = self.pending.get_mut(&request_id).ok_or_else(|| {
                    TunnelError::violation(format!("end of unknown request id: {}", request_id))
                })?;
                if request.body_ended {
                    return Err(TunnelError::violation(format!(
                        "request ended twice: {}",
                        request_id
                    )));
                }
                request.body_ended = true;
                request.body = None;
                if request.is_finished() {
                    self.pending.remove(&request_id);
                }
            }
        }
        Ok(())
    }

    fn finish_response(&mut self, message: &ShareMessage) {
        let (ShareMessage::EndResponse { request_id } | ShareMessage::ReportError { request_id, .. }) =
            message
        else {
            return;
        };
        if let Some(request) = self.pending.get_mut(request_id) {
            request.response_done = true;
            if request.is_finished() {
                self.pending.remove(request_id);
            }
        }
    }
}

/// Execute one tunnelled request against the local server.
async fn forward_local(
    http: reqwest::Client,
    request_id: RequestId,
    method: String,
    url: String,
    headers: Headers,
    body: BodyReceiver,
    outgoing: mpsc::Sender<ShareMessage>,
) {
    let result = relay_response(&http, &request_id, &method, &url, &headers, body, &outgoing).await;

    let terminal = match result {
        Ok(()) => ShareMessage::EndResponse { request_id },
        Err(error) => {
            warn!(request_id = %request_id, "Local request failed: {}", error);
            ShareMessage::ReportError {
                request_id,
                error: format!("Error in request/response: {}", error),
            }
        }
    };
    let _ = outgoing.send(terminal).await;
}

async fn relay_response(
    http: &reqwest::Client,
    request_id: &RequestId,
    method: &str,
    url: &str,
    headers: &Headers,
    body: BodyReceiver,
    outgoing: &mpsc::Sender<ShareMessage>,
) -> Result<(), String> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| format!("invalid method: {}", method))?;

    let response = http
        .request(method, url)
        .headers(map_to_headers(headers))
        .body(reqwest::Body::wrap_stream(body))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    outgoing
        .send(ShareMessage::SetResponseHeaders {
            request_id: request_id.clone(),
            status: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_string(),
            headers: headers_to_map(response.headers()),
        })
        .await
        .map_err(|_| "tunnel closed".to_string())?;

    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        outgoing
            .send(ShareMessage::WriteResponseData {
                request_id: request_id.clone(),
                data: chunk.to_vec(),
            })
            .await
            .map_err(|_| "tunnel closed".to_string())?;
    }
    Ok(())
}
