//! HTTP routes of the hub.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path as UrlPath, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use tower::util::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};

use crate::protocol::ShareId;

use super::locator::{find_local, is_valid_checksum, FileLocator, LocateError, RawDirectoryStore};
use super::proxy::{forward_request, json_error};
use super::registry::SessionRegistry;
use super::session::{encode_path, ShareSummary, SHARE_MOUNT};

/// Shared hub state.
pub struct HubState {
    pub registry: Arc<SessionRegistry>,
    pub locator: FileLocator,
    pub store: Arc<RawDirectoryStore>,
    pub response_timeout: Duration,
}

/// Build the router with all routes.
pub fn build_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/find/:sha1", get(find_handler))
        .route("/find/:sha1/*filename", get(find_handler))
        .route("/download/:sha1", get(download_handler))
        .route("/download/:sha1/*filename", get(download_handler))
        .route("/proxy-download/:sha1", get(proxy_download_handler))
        .route("/proxy-download/:sha1/*filename", get(proxy_download_handler))
        .route("/share/:share_id", any(share_handler))
        .route("/share/:share_id/*path", any(share_handler))
        .route("/api/shares", get(shares_handler))
        .with_state(state)
}

type Params = HashMap<String, String>;

fn locate_error_response(error: LocateError) -> Response {
    match error {
        LocateError::InvalidArgument(message) => json_error(StatusCode::BAD_REQUEST, message),
        LocateError::Fault(message) => json_error(StatusCode::INTERNAL_SERVER_ERROR, message),
    }
}

/// Locate a file by checksum.
async fn find_handler(
    State(state): State<Arc<HubState>>,
    UrlPath(params): UrlPath<Params>,
) -> Response {
    let sha1 = params.get("sha1").map(String::as_str).unwrap_or_default();
    let filename = params.get("filename").map(String::as_str);

    match state.locator.locate(sha1, filename).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => locate_error_response(e),
    }
}

/// Serve a file from the hub's own store.
async fn download_handler(
    State(state): State<Arc<HubState>>,
    UrlPath(params): UrlPath<Params>,
    request: Request,
) -> Response {
    let sha1 = params.get("sha1").map(String::as_str).unwrap_or_default();
    if !is_valid_checksum(sha1) {
        return json_error(StatusCode::BAD_REQUEST, format!("Invalid sha1: {}", sha1));
    }

    match find_local(&state.store, &sha1.to_ascii_lowercase()).await {
        Ok(Some(file)) => serve_local(&file.path, request).await,
        Ok(None) => json_error(StatusCode::NOT_FOUND, format!("File not found on hub: {}", sha1)),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Download through the hub from whichever share holds the file.
async fn proxy_download_handler(
    State(state): State<Arc<HubState>>,
    UrlPath(params): UrlPath<Params>,
    request: Request,
) -> Response {
    let sha1 = params.get("sha1").map(String::as_str).unwrap_or_default();
    let filename = params.get("filename").map(String::as_str);

    let result = match state.locator.locate(sha1, filename).await {
        Ok(result) => result,
        Err(e) => return locate_error_response(e),
    };

    for find in &result.internal_finds {
        let Some(handle) = state.registry.get(&find.share_id).await else {
            continue;
        };
        debug!(share_id = %find.share_id, path = %find.path, "Proxying download");
        let (parts, _) = request.into_parts();
        let path = format!("{}/download/{}", find.share_id, encode_path(&find.path));
        return forward_request(
            &handle,
            &parts.method,
            path,
            &parts.headers,
            Body::empty(),
            state.response_timeout,
        )
        .await;
    }

    match find_local(&state.store, &sha1.to_ascii_lowercase()).await {
        Ok(Some(file)) => serve_local(&file.path, request).await,
        Ok(None) => json_error(StatusCode::NOT_FOUND, format!("File not found: {}", sha1)),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Forward any request under the share mount to that share.
async fn share_handler(
    State(state): State<Arc<HubState>>,
    UrlPath(params): UrlPath<Params>,
    request: Request,
) -> Response {
    let Some(share_id) = params.get("share_id").map(|id| ShareId::new(id.as_str())) else {
        return json_error(StatusCode::BAD_REQUEST, "Missing share id");
    };
    let Some(handle) = state.registry.get(&share_id).await else {
        return json_error(
            StatusCode::NOT_FOUND,
            format!("Share not connected: {}", share_id),
        );
    };

    // Forward the raw path so percent-encoding survives
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_default();
    let path = path
        .strip_prefix(SHARE_MOUNT)
        .unwrap_or(path)
        .trim_start_matches('/')
        .to_string();

    forward_request(
        &handle,
        &parts.method,
        path,
        &parts.headers,
        body,
        state.response_timeout,
    )
    .await
}

/// List connected shares.
async fn shares_handler(State(state): State<Arc<HubState>>) -> Json<Vec<ShareSummary>> {
    let mut shares = Vec::new();
    for handle in state.registry.handles().await {
        match handle.summary().await {
            Ok(summary) => shares.push(summary),
            Err(e) => warn!(share_id = %handle.share_id(), "Failed to describe share: {}", e),
        }
    }
    Json(shares)
}

async fn serve_local(path: &Path, request: Request) -> Response {
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::locator::LocateResult;
    use axum::http::Request as HttpRequest;
    use std::fs;
    use tempfile::TempDir;

    const SHA: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";

    fn create_test_state() -> (TempDir, Arc<HubState>) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RawDirectoryStore::new(temp_dir.path()));
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.dir().join(SHA), b"abc").unwrap();

        let registry = Arc::new(SessionRegistry::new(10));
        let locator = FileLocator::new(
            "http://hub.test",
            store.clone(),
            Arc::clone(&registry),
            Duration::from_millis(200),
        );
        let state = Arc::new(HubState {
            registry,
            locator,
            store,
            response_timeout: Duration::from_secs(1),
        });
        (temp_dir, state)
    }

    async fn get(state: Arc<HubState>, uri: &str) -> Response {
        build_router(state)
            .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_find_local_file() {
        let (_temp_dir, state) = create_test_state();
        let response = get(state, &format!("/find/{}/abc.txt", SHA)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let result: LocateResult = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(result.found);
        assert_eq!(result.size, Some(3));
        assert_eq!(
            result.urls,
            vec![
                format!("http://hub.test/download/{}/abc.txt", SHA),
                format!("http://hub.test/proxy-download/{}/abc.txt", SHA),
            ]
        );
    }

    #[tokio::test]
    async fn test_find_invalid_checksum() {
        let (_temp_dir, state) = create_test_state();
        let response = get(state, "/find/not-a-checksum").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_download_local_file() {
        let (_temp_dir, state) = create_test_state();
        let response = get(state, &format!("/download/{}", SHA)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"abc");
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let (_temp_dir, state) = create_test_state();
        let response = get(state, &format!("/download/{}", "0".repeat(40))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_download_falls_back_to_local_store() {
        let (_temp_dir, state) = create_test_state();
        let response = get(state, &format!("/proxy-download/{}/abc.txt", SHA)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"abc");
    }

    #[tokio::test]
    async fn test_unknown_share_is_404() {
        let (_temp_dir, state) = create_test_state();
        let response = get(state, "/share/nobody/api/readdir/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_shares_empty() {
        let (_temp_dir, state) = create_test_state();
        let response = get(state, "/api/shares").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"[]");
    }
}
