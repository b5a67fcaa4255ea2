//! Forwarding HTTP requests through a share's tunnel.

use std::io;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{headers_to_map, map_to_headers};

use super::session::{ResponseEvent, SessionHandle};

/// JSON error body with the given status.
pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Send a request to a share and stream back its response.
///
/// The request body is relayed in the background while the response is
/// awaited. If the share has not sent response headers within
/// `response_timeout`, the caller gets a 504 and the request is abandoned.
pub async fn forward_request(
    handle: &SessionHandle,
    method: &Method,
    path: String,
    headers: &HeaderMap,
    body: Body,
    response_timeout: Duration,
) -> Response {
    let (request_id, mut events) = match handle
        .begin_request(method.to_string(), path, headers_to_map(headers))
        .await
    {
        Ok(started) => started,
        Err(e) => return json_error(StatusCode::BAD_GATEWAY, format!("Share unavailable: {}", e)),
    };

    let body_handle = handle.clone();
    let body_request_id = request_id.clone();
    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(data) => {
                    if body_handle.send_body(&body_request_id, data).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(request_id = %body_request_id, "Failed to read request body: {}", e);
                    break;
                }
            }
        }
        let _ = body_handle.end_body(&body_request_id).await;
    });

    match tokio::time::timeout(response_timeout, events.recv()).await {
        Err(_) => {
            warn!(
                share_id = %handle.share_id(),
                request_id = %request_id,
                "Timed out waiting for share response"
            );
            handle.abandon(request_id).await;
            json_error(
                StatusCode::GATEWAY_TIMEOUT,
                "Timed out waiting for share response",
            )
        }
        Ok(Some(ResponseEvent::Headers { status, headers })) => {
            debug!(request_id = %request_id, status, "Streaming share response");
            let mut response = Response::new(Body::from_stream(response_stream(events)));
            *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            *response.headers_mut() = map_to_headers(&headers);
            response
        }
        Ok(Some(ResponseEvent::Error(e))) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error in response: {}", e),
        ),
        Ok(Some(ResponseEvent::End)) | Ok(Some(ResponseEvent::Data(_))) => json_error(
            StatusCode::BAD_GATEWAY,
            "Share ended response without headers",
        ),
        Ok(None) => json_error(StatusCode::BAD_GATEWAY, "Share disconnected"),
    }
}

/// Body stream of a response whose headers have arrived.
///
/// An error from the share terminates the stream with an error, which aborts
/// the client connection instead of ending the body cleanly.
fn response_stream(
    events: mpsc::Receiver<ResponseEvent>,
) -> impl futures::Stream<Item = Result<bytes::Bytes, io::Error>> {
    futures::stream::unfold(Some(events), |events| async move {
        let mut events = events?;
        match events.recv().await {
            Some(ResponseEvent::Data(data)) => Some((Ok(data), Some(events))),
            Some(ResponseEvent::End) => None,
            Some(ResponseEvent::Error(e)) => Some((Err(io::Error::other(e)), None)),
            Some(ResponseEvent::Headers { .. }) => {
                Some((Err(io::Error::other("duplicate response headers")), None))
            }
            None => Some((Err(io::Error::other("share disconnected")), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::session::{open_session, SessionParts, ShareInfo};
    use crate::protocol::{Headers, HubMessage, ShareId, ShareMessage};

    fn info() -> ShareInfo {
        ShareInfo {
            share_id: ShareId::new("share00001"),
            protocol: "http".to_string(),
            host: String::new(),
            port: 0,
            public_key: String::new(),
        }
    }

    /// Drive a session, answering every request with `reply`.
    fn spawn_fake_share<F>(parts: SessionParts, reply: F) -> SessionHandle
    where
        F: Fn(&HubMessage) -> Vec<ShareMessage> + Send + 'static,
    {
        let SessionParts {
            mut state,
            handle,
            mut commands,
            mut outbound,
        } = parts;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(command) = commands.recv() => state.handle_command(command),
                    Some(message) = outbound.recv() => {
                        for answer in reply(&message) {
                            if state.handle_share_message(answer).await.is_err() {
                                return;
                            }
                        }
                    }
                    else => return,
                }
            }
        });
        handle
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_forward_streams_response() {
        let handle = spawn_fake_share(open_session(info(), 10), |message| match message {
            HubMessage::InitiateRequest { request_id, .. } => {
                let mut headers = Headers::new();
                headers.insert("content-type".to_string(), "text/plain".to_string());
                vec![
                    ShareMessage::SetResponseHeaders {
                        request_id: request_id.clone(),
                        status: 200,
                        status_message: "OK".to_string(),
                        headers,
                    },
                    ShareMessage::WriteResponseData {
                        request_id: request_id.clone(),
                        data: b"hello ".to_vec(),
                    },
                    ShareMessage::WriteResponseData {
                        request_id: request_id.clone(),
                        data: b"world".to_vec(),
                    },
                    ShareMessage::EndResponse {
                        request_id: request_id.clone(),
                    },
                ]
            }
            _ => Vec::new(),
        });

        let response = forward_request(
            &handle,
            &Method::GET,
            "share00001/download/a.txt".to_string(),
            &HeaderMap::new(),
            Body::empty(),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(body_bytes(response).await, b"hello world");
    }

    #[tokio::test]
    async fn test_forward_relays_request_body() {
        let handle = spawn_fake_share(open_session(info(), 10), {
            let received = std::sync::Mutex::new(Vec::new());
            move |message| match message {
                HubMessage::WriteRequestData { data, .. } => {
                    received.lock().unwrap().extend_from_slice(data);
                    Vec::new()
                }
                HubMessage::EndRequest { request_id } => {
                    let echoed = received.lock().unwrap().clone();
                    vec![
                        ShareMessage::SetResponseHeaders {
                            request_id: request_id.clone(),
                            status: 201,
                            status_message: "Created".to_string(),
                            headers: Headers::new(),
                        },
                        ShareMessage::WriteResponseData {
                            request_id: request_id.clone(),
                            data: echoed,
                        },
                        ShareMessage::EndResponse {
                            request_id: request_id.clone(),
                        },
                    ]
                }
                _ => Vec::new(),
            }
        });

        let response = forward_request(
            &handle,
            &Method::POST,
            "share00001/upload".to_string(),
            &HeaderMap::new(),
            Body::from("payload"),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_bytes(response).await, b"payload");
    }

    #[tokio::test]
    async fn test_error_before_headers_is_500() {
        let handle = spawn_fake_share(open_session(info(), 10), |message| match message {
            HubMessage::InitiateRequest { request_id, .. } => vec![ShareMessage::ReportError {
                request_id: request_id.clone(),
                error: "connection refused".to_string(),
            }],
            _ => Vec::new(),
        });

        let response = forward_request(
            &handle,
            &Method::GET,
            "x".to_string(),
            &HeaderMap::new(),
            Body::empty(),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["error"], "Error in response: connection refused");
    }

    #[tokio::test]
    async fn test_silent_share_times_out() {
        let handle = spawn_fake_share(open_session(info(), 10), |_| Vec::new());

        let response = forward_request(
            &handle,
            &Method::GET,
            "x".to_string(),
            &HeaderMap::new(),
            Body::empty(),
            Duration::from_millis(100),
        )
        .await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_closed_session_is_bad_gateway() {
        let parts = open_session(info(), 10);
        let handle = parts.handle.clone();
        drop(parts);

        let response = forward_request(
            &handle,
            &Method::GET,
            "x".to_string(),
            &HeaderMap::new(),
            Body::empty(),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unwritable_tunnel_fails_without_waiting() {
        let SessionParts {
            mut state,
            handle,
            mut commands,
            outbound,
        } = open_session(info(), 10);
        drop(outbound);
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                state.handle_command(command);
            }
        });

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            forward_request(
                &handle,
                &Method::GET,
                "x".to_string(),
                &HeaderMap::new(),
                Body::empty(),
                Duration::from_secs(30),
            ),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_error_after_headers_breaks_body() {
        let handle = spawn_fake_share(open_session(info(), 10), |message| match message {
            HubMessage::InitiateRequest { request_id, .. } => vec![
                ShareMessage::SetResponseHeaders {
                    request_id: request_id.clone(),
                    status: 200,
                    status_message: "OK".to_string(),
                    headers: Headers::new(),
                },
                ShareMessage::WriteResponseData {
                    request_id: request_id.clone(),
                    data: b"partial".to_vec(),
                },
                ShareMessage::ReportError {
                    request_id: request_id.clone(),
                    error: "disk error".to_string(),
                },
            ],
            _ => Vec::new(),
        });

        let response = forward_request(
            &handle,
            &Method::GET,
            "x".to_string(),
            &HeaderMap::new(),
            Body::empty(),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .is_err());
    }
}
