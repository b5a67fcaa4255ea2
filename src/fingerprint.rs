//! Content fingerprints ("prv records") and their on-disk cache.
//!
//! A fingerprint identifies a file's content independently of its path: the
//! SHA-1 of the whole file, its size, and a cheap signature over the first
//! bytes. Computing one means hashing the entire file, so results are cached
//! under the share's state directory and reused while the file's size and
//! modification time are unchanged.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, warn};

use crate::indexer::{is_indexable, STATE_DIR};

/// Fingerprint schema version
pub const FINGERPRINT_VERSION: &str = "0.11";

/// Number of leading bytes covered by the consistency signature
pub const HEAD_BYTES: usize = 1000;

/// Chunk size for streaming file contents through the hasher
const CHUNK_SIZE: usize = 1024 * 1024;

/// Subdirectory of the state directory holding cache entries
const CACHE_DIR: &str = "prv_cache";

/// Number of hex characters of the path hash used as cache file name
const CACHE_KEY_LEN: usize = 10;

/// Errors that can occur while computing or caching fingerprints
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed fingerprint output for {path}: {message}")]
    MalformedOutput { path: PathBuf, message: String },

    #[error("fingerprint tool {program} failed: {message}")]
    ToolFailed { program: String, message: String },
}

impl FingerprintError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for fingerprint operations
pub type FingerprintResult<T> = Result<T, FingerprintError>;

/// Identity of a file's content
///
/// Two fingerprints with equal `checksum` describe the same content, whatever
/// their paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFingerprint {
    /// SHA-1 of the full content, lowercase hex
    #[serde(rename = "original_checksum")]
    pub checksum: String,
    /// Byte length when computed
    #[serde(rename = "original_size")]
    pub size: u64,
    /// Hash of the leading bytes, tagged with the byte count (`head1000-<sha1>`)
    #[serde(rename = "original_fcs")]
    pub consistency_signature: String,
    /// Absolute path where the file was observed
    #[serde(default)]
    pub original_path: String,
    #[serde(rename = "prv_version", default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    FINGERPRINT_VERSION.to_string()
}

/// Something that can compute a fingerprint for a file on disk
pub trait FingerprintBackend: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Compute a fresh fingerprint, ignoring any cache.
    fn compute(&self, path: &Path) -> FingerprintResult<ContentFingerprint>;
}

/// Computes fingerprints in-process with SHA-1
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Fingerprinter;

impl FingerprintBackend for Sha1Fingerprinter {
    fn name(&self) -> &'static str {
        "sha1"
    }

    fn compute(&self, path: &Path) -> FingerprintResult<ContentFingerprint> {
        let mut file = fs::File::open(path).map_err(|e| FingerprintError::io(path, e))?;

        let mut full = Sha1::new();
        let mut head = Sha1::new();
        let mut head_remaining = HEAD_BYTES;
        let mut size: u64 = 0;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let bytes_read = file
                .read(&mut buffer)
                .map_err(|e| FingerprintError::io(path, e))?;
            if bytes_read == 0 {
                break;
            }
            let chunk = &buffer[..bytes_read];
            full.update(chunk);
            if head_remaining > 0 {
                let take = head_remaining.min(chunk.len());
                head.update(&chunk[..take]);
                head_remaining -= take;
            }
            size += bytes_read as u64;
        }

        let original_path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        Ok(ContentFingerprint {
            checksum: hex::encode(full.finalize()),
            size,
            consistency_signature: format!("head{}-{}", HEAD_BYTES, hex::encode(head.finalize())),
            original_path: original_path.to_string_lossy().into_owned(),
            version: FINGERPRINT_VERSION.to_string(),
        })
    }
}

/// Delegates to an external program that prints a fingerprint as JSON
///
/// The program is invoked as `<program> <path>`.
#[derive(Debug, Clone)]
pub struct ExternalToolFingerprinter {
    program: String,
}

impl ExternalToolFingerprinter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl FingerprintBackend for ExternalToolFingerprinter {
    fn name(&self) -> &'static str {
        "external"
    }

    fn compute(&self, path: &Path) -> FingerprintResult<ContentFingerprint> {
        let output = Command::new(&self.program)
            .arg(path)
            .output()
            .map_err(|e| FingerprintError::ToolFailed {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(FingerprintError::ToolFailed {
                program: self.program.clone(),
                message: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        parse_tool_output(path, &output.stdout)
    }
}

fn parse_tool_output(path: &Path, stdout: &[u8]) -> FingerprintResult<ContentFingerprint> {
    let text = String::from_utf8_lossy(stdout);
    serde_json::from_str(text.trim()).map_err(|e| FingerprintError::MalformedOutput {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// One cached fingerprint, valid while the file's size and mtime match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Path relative to the share root
    pub path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    #[serde(rename = "prv")]
    pub fingerprint: ContentFingerprint,
}

impl CacheEntry {
    fn matches(&self, metadata: &fs::Metadata) -> bool {
        metadata.is_file()
            && metadata.len() == self.size
            && modified_time(metadata).as_ref() == Some(&self.mtime)
    }
}

/// Fingerprint cache rooted at a shared directory
pub struct FingerprintCache {
    root: PathBuf,
    cache_dir: PathBuf,
    backend: Box<dyn FingerprintBackend>,
}

impl FingerprintCache {
    /// Open (creating if needed) the cache for the given share root.
    pub fn open(root: impl Into<PathBuf>, backend: Box<dyn FingerprintBackend>) -> FingerprintResult<Self> {
        let root = root.into();
        let cache_dir = root.join(STATE_DIR).join(CACHE_DIR);
        fs::create_dir_all(&cache_dir).map_err(|e| FingerprintError::io(&cache_dir, e))?;
        debug!(cache_dir = %cache_dir.display(), backend = backend.name(), "Opened fingerprint cache");
        Ok(Self {
            root,
            cache_dir,
            backend,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fingerprint a file given its path relative to the root.
    ///
    /// Returns the cached fingerprint when the file's size and mtime are
    /// unchanged; otherwise computes a fresh one and overwrites the entry.
    pub fn fingerprint(&self, relpath: &str) -> FingerprintResult<ContentFingerprint> {
        let path = self.root.join(relpath);
        let metadata = fs::metadata(&path).map_err(|e| FingerprintError::io(&path, e))?;

        if let Some(cached) = self.lookup_with(relpath, &metadata) {
            debug!(path = relpath, "Using cached fingerprint");
            return Ok(cached);
        }

        debug!(path = relpath, backend = self.backend.name(), "Computing fingerprint");
        let fingerprint = self.backend.compute(&path)?;
        self.store(relpath, &metadata, &fingerprint);
        Ok(fingerprint)
    }

    /// Cached fingerprint for a path, if still valid.
    pub fn lookup(&self, relpath: &str) -> Option<ContentFingerprint> {
        let metadata = fs::metadata(self.root.join(relpath)).ok()?;
        self.lookup_with(relpath, &metadata)
    }

    fn lookup_with(&self, relpath: &str, metadata: &fs::Metadata) -> Option<ContentFingerprint> {
        let entry = read_entry(&self.entry_path(relpath))?;
        if entry.path != relpath || !entry.matches(metadata) {
            return None;
        }
        Some(entry.fingerprint)
    }

    fn store(&self, relpath: &str, metadata: &fs::Metadata, fingerprint: &ContentFingerprint) {
        let Some(mtime) = modified_time(metadata) else {
            return;
        };
        let entry = CacheEntry {
            path: relpath.to_string(),
            size: metadata.len(),
            mtime,
            fingerprint: fingerprint.clone(),
        };
        let entry_path = self.entry_path(relpath);
        let result = serde_json::to_vec_pretty(&entry)
            .map_err(io::Error::from)
            .and_then(|contents| fs::write(&entry_path, contents));
        if let Err(e) = result {
            warn!(path = relpath, "Failed to write fingerprint cache entry: {}", e);
        }
    }

    fn entry_path(&self, relpath: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(relpath))
    }

    /// Remove cache entries that can no longer be used.
    ///
    /// An entry is dropped when it cannot be parsed, when its path is no longer
    /// indexable, when it is stored under the wrong file name, or when the file
    /// it describes changed or disappeared. Returns the number removed.
    pub fn sweep(&self) -> FingerprintResult<usize> {
        let entries =
            fs::read_dir(&self.cache_dir).map_err(|e| FingerprintError::io(&self.cache_dir, e))?;

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| FingerprintError::io(&self.cache_dir, e))?;
            let entry_path = entry.path();
            if self.is_stale(&entry_path) {
                if let Err(e) = fs::remove_file(&entry_path) {
                    warn!(path = %entry_path.display(), "Failed to remove stale cache entry: {}", e);
                    continue;
                }
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Swept fingerprint cache");
        }
        Ok(removed)
    }

    fn is_stale(&self, entry_path: &Path) -> bool {
        let Some(entry) = read_entry(entry_path) else {
            return true;
        };
        if !is_indexable(&entry.path) {
            return true;
        }
        let expected_name = cache_file_name(&entry.path);
        if entry_path.file_name().and_then(|name| name.to_str()) != Some(expected_name.as_str()) {
            return true;
        }
        match fs::metadata(self.root.join(&entry.path)) {
            Ok(metadata) => !entry.matches(&metadata),
            Err(_) => true,
        }
    }
}

/// Stable cache file name for a relative path.
pub fn cache_file_name(relpath: &str) -> String {
    let digest = hex::encode(Sha1::digest(relpath.as_bytes()));
    format!("{}.json", &digest[..CACHE_KEY_LEN])
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let contents = fs::read(path).ok()?;
    serde_json::from_slice(&contents).ok()
}

fn modified_time(metadata: &fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}
