//! Tunnel protocol types for hub-share communication
//!
//! Messages are sent as newline-delimited JSON over the single TCP connection a
//! share opens to its hub. Every message carries a `command` tag; HTTP traffic
//! is multiplexed over the connection by `request_id`.

use std::collections::BTreeMap;
use std::fmt;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use crate::fingerprint::ContentFingerprint;

/// Length of generated request ids
const REQUEST_ID_LEN: usize = 8;

/// Headers that describe a single hop and must not cross the tunnel
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Separates repeated `set-cookie` values, which cannot be comma-joined.
/// Header values never contain a newline.
const SET_COOKIE_SEPARATOR: &str = "\n";

/// Errors that end a tunnel connection
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TunnelError {
    pub fn violation(message: impl Into<String>) -> Self {
        TunnelError::ProtocolViolation(message.into())
    }
}

/// HTTP headers as they travel inside tunnel messages
pub type Headers = BTreeMap<String, String>;

/// Identifier a share registers under
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(String);

impl ShareId {
    /// Wrap an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ShareId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(format!("invalid share id: {:?}", s));
        }
        Ok(Self(s.to_string()))
    }
}

/// Identifier of one HTTP exchange multiplexed over a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a random request id.
    ///
    /// Uniqueness among pending ids is the caller's job.
    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(REQUEST_ID_LEN);
        Self(id)
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages sent from a share to its hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ShareMessage {
    /// First message on every connection
    Register {
        share_id: ShareId,
        share_protocol: String,
        share_host: String,
        share_port: u16,
        public_key: String,
    },
    /// Index update for one file; no fingerprint means the file is gone
    SetFileInfo {
        path: String,
        #[serde(
            default,
            rename = "prv",
            alias = "fingerprint",
            skip_serializing_if = "Option::is_none"
        )]
        fingerprint: Option<ContentFingerprint>,
    },
    #[serde(rename = "http_set_response_headers")]
    SetResponseHeaders {
        request_id: RequestId,
        status: u16,
        #[serde(default)]
        status_message: String,
        #[serde(default)]
        headers: Headers,
    },
    #[serde(rename = "http_write_response_data")]
    WriteResponseData {
        request_id: RequestId,
        #[serde(rename = "data_base64", with = "base64_data")]
        data: Vec<u8>,
    },
    #[serde(rename = "http_end_response")]
    EndResponse { request_id: RequestId },
    #[serde(rename = "http_report_error")]
    ReportError { request_id: RequestId, error: String },
}

impl ShareMessage {
    /// Name of the command, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            ShareMessage::Register { .. } => "register",
            ShareMessage::SetFileInfo { .. } => "set_file_info",
            ShareMessage::SetResponseHeaders { .. } => "http_set_response_headers",
            ShareMessage::WriteResponseData { .. } => "http_write_response_data",
            ShareMessage::EndResponse { .. } => "http_end_response",
            ShareMessage::ReportError { .. } => "http_report_error",
        }
    }

    /// True for messages that finish the response side of a request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShareMessage::EndResponse { .. } | ShareMessage::ReportError { .. }
        )
    }
}

/// Messages sent from a hub to a share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum HubMessage {
    #[serde(rename = "http_initiate_request")]
    InitiateRequest {
        request_id: RequestId,
        method: String,
        path: String,
        #[serde(default)]
        headers: Headers,
    },
    #[serde(rename = "http_write_request_data")]
    WriteRequestData {
        request_id: RequestId,
        #[serde(rename = "data_base64", with = "base64_data")]
        data: Vec<u8>,
    },
    #[serde(rename = "http_end_request")]
    EndRequest { request_id: RequestId },
}

impl HubMessage {
    pub fn request_id(&self) -> &RequestId {
        match self {
            HubMessage::InitiateRequest { request_id, .. }
            | HubMessage::WriteRequestData { request_id, .. }
            | HubMessage::EndRequest { request_id } => request_id,
        }
    }
}

/// Serialize a message and write it as one line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Parse one received line into a message.
///
/// Anything that is not a known command is a protocol violation.
pub fn parse_message<T: DeserializeOwned>(line: &str) -> Result<T, TunnelError> {
    serde_json::from_str(line)
        .map_err(|e| TunnelError::violation(format!("unparsable message: {}", e)))
}

/// Convert an HTTP header map into its tunnel representation.
///
/// Hop-by-hop headers are dropped and repeated headers are joined with `, `,
/// except `cookie` (joined with `; `) and `set-cookie` (one value per line).
pub fn headers_to_map(headers: &HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        let key = name.as_str();
        if is_hop_by_hop(key) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            warn!(header = key, "Dropping header with non-ASCII value");
            continue;
        };
        let separator = if *name == SET_COOKIE {
            SET_COOKIE_SEPARATOR
        } else if *name == COOKIE {
            "; "
        } else {
            ", "
        };
        map.entry(key.to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(separator);
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

/// Convert tunnel headers back into an HTTP header map.
///
/// Invalid names or values are skipped with a warning.
pub fn map_to_headers(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        if is_hop_by_hop(key) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            warn!(header = %key, "Dropping invalid header");
            continue;
        };
        let values: Vec<&str> = if name == SET_COOKIE {
            value.split(SET_COOKIE_SEPARATOR).collect()
        } else {
            vec![value.as_str()]
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    map.append(name.clone(), value);
                }
                Err(_) => warn!(header = %key, "Dropping invalid header value"),
            }
        }
    }
    map
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Serde adapter carrying binary payloads as standard base64 strings.
mod base64_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
