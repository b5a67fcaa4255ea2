//! Local content server of a share.
//!
//! Serves directory listings and raw file downloads for the shared tree. The
//! hub reaches it through the tunnel; it is also reachable directly when the
//! share's advertised address is public.

use std::net::TcpListener;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path as UrlPath, Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::util::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeFile;
use tracing::{debug, warn};

use crate::indexer::{is_excluded_name, STATE_DIR};
use crate::protocol::ShareId;

/// Shared state of the content server.
pub struct ContentState {
    pub root: PathBuf,
    pub share_id: ShareId,
    pub web_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DirEntry {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ReaddirResponse {
    pub success: bool,
    pub files: Vec<FileEntry>,
    pub dirs: Vec<DirEntry>,
}

/// Find the first port in `[low, high]` that can be bound on loopback.
pub fn find_available_port(low: u16, high: u16) -> Option<u16> {
    (low..=high).find(|&port| TcpListener::bind(("127.0.0.1", port)).is_ok())
}

/// Whether a request path stays inside the directory it is joined to.
///
/// Captures are percent-decoded, so `%2F` can produce a leading `/` that would
/// make `Path::join` discard the root. Every component must be a plain name,
/// and `.`, `..` and `~` segments are rejected outright.
pub fn is_safe_path(path: &str) -> bool {
    let plain_segments = !path
        .split('/')
        .any(|segment| segment == "." || segment == ".." || segment == "~");
    plain_segments
        && Path::new(path)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Build the router with all routes.
pub fn build_router(state: Arc<ContentState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::HEAD, Method::OPTIONS])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::RANGE,
        ])
        .max_age(Duration::from_secs(24 * 60 * 60));

    Router::new()
        .route("/:share_id/api/readdir", get(readdir_root_handler))
        .route("/:share_id/api/readdir/", get(readdir_root_handler))
        .route(
            "/:share_id/api/readdir/*subdirectory",
            get(readdir_handler),
        )
        .route("/:share_id/download/*filename", get(download_handler))
        .route("/:share_id/web", get(web_index_handler))
        .route("/:share_id/web/", get(web_index_handler))
        .route("/:share_id/web/*path", get(web_handler))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn check_share_id(state: &ContentState, share_id: &str) -> Result<(), Response> {
    if share_id == state.share_id.as_str() {
        return Ok(());
    }
    let message = format!("Incorrect kbucket share key: {}", share_id);
    warn!("{}", message);
    Err(error_response(StatusCode::FORBIDDEN, message))
}

async fn readdir_root_handler(
    State(state): State<Arc<ContentState>>,
    UrlPath(share_id): UrlPath<String>,
) -> Response {
    readdir(&state, &share_id, "").await
}

async fn readdir_handler(
    State(state): State<Arc<ContentState>>,
    UrlPath((share_id, subdirectory)): UrlPath<(String, String)>,
) -> Response {
    readdir(&state, &share_id, &subdirectory).await
}

async fn readdir(state: &ContentState, share_id: &str, subdirectory: &str) -> Response {
    if let Err(response) = check_share_id(state, share_id) {
        return response;
    }
    if !is_safe_path(subdirectory) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Unsafe path: {}", subdirectory),
        );
    }

    let dir = state.root.join(subdirectory.trim_matches('/'));
    match list_directory(&dir).await {
        Ok(listing) => Json(listing).into_response(),
        Err(message) => error_response(StatusCode::INTERNAL_SERVER_ERROR, message),
    }
}

async fn list_directory(dir: &Path) -> Result<ReaddirResponse, String> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| e.to_string())?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for name in names {
        if name == "." || name == ".." || name == STATE_DIR {
            continue;
        }
        let metadata = tokio::fs::metadata(dir.join(&name))
            .await
            .map_err(|e| format!("Error in stat of file {}: {}", name, e))?;
        if metadata.is_file() {
            files.push(FileEntry {
                name,
                size: metadata.len(),
            });
        } else if metadata.is_dir() && !is_excluded_name(&name) {
            dirs.push(DirEntry { name });
        }
    }

    Ok(ReaddirResponse {
        success: true,
        files,
        dirs,
    })
}

async fn download_handler(
    State(state): State<Arc<ContentState>>,
    UrlPath((share_id, filename)): UrlPath<(String, String)>,
    request: Request,
) -> Response {
    if let Err(response) = check_share_id(&state, &share_id) {
        return response;
    }
    if !is_safe_path(&filename) {
        return error_response(StatusCode::BAD_REQUEST, format!("Unsafe path: {}", filename));
    }

    let path = state.root.join(&filename);
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Not a file: {}", filename),
            )
        }
        Err(_) => return (StatusCode::NOT_FOUND, "404: File Not Found").into_response(),
    }

    debug!(path = %filename, "Serving download");
    serve_file(&path, request).await
}

async fn web_index_handler(State(state): State<Arc<ContentState>>, request: Request) -> Response {
    serve_web(&state, "index.html", request).await
}

async fn web_handler(
    State(state): State<Arc<ContentState>>,
    UrlPath((_share_id, path)): UrlPath<(String, String)>,
    request: Request,
) -> Response {
    serve_web(&state, &path, request).await
}

// Web assets live outside the shared tree, so the share id is not checked
async fn serve_web(state: &ContentState, path: &str, request: Request) -> Response {
    let Some(web_dir) = &state.web_dir else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };
    if !is_safe_path(path) {
        return error_response(StatusCode::BAD_REQUEST, format!("Unsafe path: {}", path));
    }
    serve_file(&web_dir.join(path), request).await
}

async fn serve_file(path: &Path, request: Request) -> Response {
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

/// Serve the content router on an already bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<ContentState>,
) -> std::io::Result<()> {
    axum::serve(listener, build_router(state)).await
}
