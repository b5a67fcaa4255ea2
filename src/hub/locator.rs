//! Locating files by content checksum across the hub and its shares.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::ShareId;

use super::registry::SessionRegistry;

/// Most share matches reported for one lookup
pub const MAX_FINDS: usize = 10;

/// Length of a hex SHA-1 checksum
const CHECKSUM_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to query local store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Local store lookup did not complete: {0}")]
    Interrupted(String),
}

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lookup failed: {0}")]
    Fault(String),
}

/// A file held by the hub itself
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub size: u64,
}

/// The hub's own content-addressed storage
pub trait LocalStore: Send + Sync {
    fn find(&self, checksum: &str) -> Result<Option<LocalFile>, StoreError>;
}

/// Query a store on the blocking pool, keeping filesystem calls off the runtime.
pub async fn find_local<S>(store: &Arc<S>, checksum: &str) -> Result<Option<LocalFile>, StoreError>
where
    S: LocalStore + ?Sized + 'static,
{
    let store = Arc::clone(store);
    let checksum = checksum.to_string();
    tokio::task::spawn_blocking(move || store.find(&checksum))
        .await
        .map_err(|e| StoreError::Interrupted(e.to_string()))?
}

/// Files stored flat as `<dir>/<sha1>`
#[derive(Debug, Clone)]
pub struct RawDirectoryStore {
    dir: PathBuf,
}

impl RawDirectoryStore {
    /// Store under `<data_dir>/raw`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("raw"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LocalStore for RawDirectoryStore {
    fn find(&self, checksum: &str) -> Result<Option<LocalFile>, StoreError> {
        let path = self.dir.join(checksum);
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(LocalFile {
                path,
                size: metadata.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// One share holding the requested content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalFind {
    pub share_id: ShareId,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocateResult {
    pub success: bool,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub urls: Vec<String>,
    pub internal_finds: Vec<InternalFind>,
}

/// Shares that reported a checksum, with their direct URLs in the same order
#[derive(Debug, Default)]
struct ShareMatches {
    finds: Vec<InternalFind>,
    urls: Vec<String>,
}

/// Whether a string is a 40 character hex SHA-1.
pub fn is_valid_checksum(checksum: &str) -> bool {
    checksum.len() == CHECKSUM_LEN && checksum.chars().all(|c| c.is_ascii_hexdigit())
}

/// Answers "where can I download the content with this checksum"
pub struct FileLocator {
    base_url: String,
    store: Arc<dyn LocalStore>,
    registry: Arc<SessionRegistry>,
    query_timeout: Duration,
}

impl FileLocator {
    pub fn new(
        base_url: impl Into<String>,
        store: Arc<dyn LocalStore>,
        registry: Arc<SessionRegistry>,
        query_timeout: Duration,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            store,
            registry,
            query_timeout,
        }
    }

    /// Look a checksum up in the local store and in the connected shares.
    ///
    /// A failure of one source is logged and the other is still used; only
    /// when both fail is the lookup an error.
    pub async fn locate(
        &self,
        checksum: &str,
        filename: Option<&str>,
    ) -> Result<LocateResult, LocateError> {
        if !is_valid_checksum(checksum) {
            return Err(LocateError::InvalidArgument(format!(
                "not a sha1 checksum: {}",
                checksum
            )));
        }
        let checksum = checksum.to_ascii_lowercase();

        let (local, shares) = tokio::join!(
            find_local(&self.store, &checksum),
            self.find_in_shares(&checksum)
        );

        let (local, matches) = match (local, shares) {
            (Err(local_err), Err(shares_err)) => {
                return Err(LocateError::Fault(format!(
                    "local store: {}; shares: {}",
                    local_err, shares_err
                )));
            }
            (Err(e), Ok(matches)) => {
                warn!(checksum = %checksum, "Problem searching local store: {}", e);
                (None, matches)
            }
            (Ok(local), Err(e)) => {
                warn!(checksum = %checksum, "Problem searching connected shares: {}", e);
                (local, ShareMatches::default())
            }
            (Ok(local), Ok(matches)) => (local, matches),
        };

        Ok(self.merge(&checksum, filename, local, matches))
    }

    /// Query shares one at a time, stopping queries once enough have matched.
    async fn find_in_shares(&self, checksum: &str) -> Result<ShareMatches, String> {
        let mut matches = ShareMatches::default();
        let mut queried = 0;
        let mut skipped = 0;
        let mut failures = Vec::new();

        for handle in self.registry.handles().await {
            if matches.finds.len() >= MAX_FINDS {
                skipped += 1;
                continue;
            }
            queried += 1;
            match handle.find_file(checksum, self.query_timeout).await {
                Ok(Some(file)) => {
                    if let Some(url) = handle.info().direct_url(&file.path) {
                        matches.urls.push(url);
                    }
                    matches.finds.push(InternalFind {
                        share_id: handle.share_id().clone(),
                        path: file.path,
                        size: file.size,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(share_id = %handle.share_id(), "Share lookup failed: {}", e);
                    failures.push(format!("{}: {}", handle.share_id(), e));
                }
            }
        }

        debug!(
            checksum,
            queried,
            skipped,
            found = matches.finds.len(),
            "Searched connected shares"
        );
        if queried > 0 && failures.len() == queried {
            return Err(failures.join(", "));
        }
        Ok(matches)
    }

    fn merge(
        &self,
        checksum: &str,
        filename: Option<&str>,
        local: Option<LocalFile>,
        matches: ShareMatches,
    ) -> LocateResult {
        let mut result = LocateResult {
            success: true,
            ..LocateResult::default()
        };

        if let Some(last) = matches.finds.last() {
            result.found = true;
            result.size = Some(last.size);
            result.urls = matches.urls;
        } else if let Some(ref local) = local {
            result.found = true;
            result.size = Some(local.size);
            result.urls.push(self.hub_url("download", checksum, filename));
        }

        if result.found {
            result.urls.push(self.hub_url("proxy-download", checksum, filename));
        }
        result.internal_finds = matches.finds;
        result
    }

    fn hub_url(&self, endpoint: &str, checksum: &str, filename: Option<&str>) -> String {
        let mut url = format!("{}/{}/{}", self.base_url, endpoint, checksum);
        if let Some(filename) = filename.filter(|name| !name.is_empty()) {
            url.push('/');
            url.push_str(&urlencoding::encode(filename));
        }
        url
    }
}
