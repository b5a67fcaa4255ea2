//! Directory indexer for a shared tree.
//!
//! The indexer keeps a path -> fingerprint view of the share current. Paths
//! come from an initial walk of the tree and from the change watcher; they are
//! collected into a deduplicated pending set which a single polling loop drains,
//! fingerprinting each path (or reporting it removed) and handing the result to
//! the tunnel client as an [`IndexUpdate`].

mod watcher;

pub use watcher::{relevant_path, ChangeWatcher};

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::fingerprint::{ContentFingerprint, FingerprintCache, FingerprintError};

/// Name of the share's own state directory
pub const STATE_DIR: &str = ".kbucket";

/// Directory names that are never walked or indexed
pub const EXCLUDED_NAMES: &[&str] = &["node_modules", ".git", STATE_DIR];

/// Pause between drain passes
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between fingerprint cache sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Errors that can occur while indexing
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("failed to read directory {path}: {source}")]
    DirectoryRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to watch share directory: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("failed to start indexer thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Change to one file of the index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexUpdate {
    /// Path relative to the share root
    pub path: String,
    /// `None` when the file no longer exists
    pub fingerprint: Option<ContentFingerprint>,
}

impl IndexUpdate {
    pub fn removed(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fingerprint: None,
        }
    }
}

/// Whether a directory (or path segment) name is excluded from indexing.
pub fn is_excluded_name(name: &str) -> bool {
    EXCLUDED_NAMES.contains(&name)
}

/// Whether a relative path may be indexed.
///
/// A path is rejected when one of its directories is excluded, or when any
/// dot-delimited segment before the last one is an excluded name.
pub fn is_indexable(relpath: &str) -> bool {
    if relpath.is_empty() {
        return false;
    }

    let components: Vec<&str> = relpath.split('/').collect();
    if components[..components.len() - 1]
        .iter()
        .any(|c| is_excluded_name(c))
    {
        return false;
    }

    let segments: Vec<&str> = relpath.split('.').collect();
    !segments[..segments.len() - 1]
        .iter()
        .any(|s| is_excluded_name(s))
}

/// Walk the whole tree under `root`.
pub fn enumerate(root: &Path) -> Enumerate {
    enumerate_from(root, "")
}

/// Walk the tree under `root/subdir`, yielding paths relative to `root`.
pub fn enumerate_from(root: &Path, subdir: &str) -> Enumerate {
    Enumerate {
        root: root.to_path_buf(),
        dirs: vec![subdir.trim_matches('/').to_string()],
        ready: VecDeque::new(),
    }
}

/// Lazy depth-first walk over the indexable files of a tree
///
/// Files of a directory are yielded before any of its subdirectories are
/// visited. Each value is a single pass; create a new one to walk again.
pub struct Enumerate {
    root: PathBuf,
    dirs: Vec<String>,
    ready: VecDeque<String>,
}

impl Enumerate {
    fn visit(&mut self, dir: &str) -> Result<(), IndexerError> {
        let path = self.root.join(dir);
        let entries = fs::read_dir(&path).map_err(|source| IndexerError::DirectoryRead {
            path: path.clone(),
            source,
        })?;

        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| IndexerError::DirectoryRead {
                path: path.clone(),
                source,
            })?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => warn!(dir = %path.display(), "Skipping non UTF-8 name {:?}", name),
            }
        }
        names.sort();

        let mut subdirs = Vec::new();
        for name in names {
            if name == "." || name == ".." || name == STATE_DIR {
                continue;
            }
            let relpath = if dir.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", dir, name)
            };
            let metadata = match fs::metadata(self.root.join(&relpath)) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %relpath, "Failed to stat: {}", e);
                    continue;
                }
            };
            if metadata.is_file() {
                if is_indexable(&relpath) {
                    self.ready.push_back(relpath);
                }
            } else if metadata.is_dir() && !is_excluded_name(&name) {
                subdirs.push(relpath);
            }
        }

        self.dirs.extend(subdirs.into_iter().rev());
        Ok(())
    }
}

impl Iterator for Enumerate {
    type Item = Result<String, IndexerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(relpath) = self.ready.pop_front() {
                return Some(Ok(relpath));
            }
            let dir = self.dirs.pop()?;
            if let Err(e) = self.visit(&dir) {
                return Some(Err(e));
            }
        }
    }
}

/// Polling indexer that turns queued paths into index updates
pub struct Indexer {
    cache: FingerprintCache,
    changes: Receiver<String>,
    pending: BTreeSet<String>,
    indexed: BTreeSet<String>,
    last_sweep: Instant,
}

impl Indexer {
    /// Create an indexer fed by the given change channel.
    pub fn new(cache: FingerprintCache, changes: Receiver<String>) -> Self {
        Self {
            cache,
            changes,
            pending: BTreeSet::new(),
            indexed: BTreeSet::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Queue every indexable file of the tree.
    ///
    /// Returns the number of files found.
    pub fn queue_all(&mut self) -> Result<usize, IndexerError> {
        let mut found = 0;
        for relpath in enumerate(self.cache.root()) {
            self.pending.insert(relpath?);
            found += 1;
        }
        Ok(found)
    }

    /// Queue one path for recomputation.
    pub fn queue(&mut self, relpath: impl Into<String>) {
        self.pending.insert(relpath.into());
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Paths currently reported as present.
    pub fn indexed(&self) -> &BTreeSet<String> {
        &self.indexed
    }

    /// Process everything queued so far.
    ///
    /// Paths arriving while this runs stay queued for the next call. Returns
    /// the number of updates emitted.
    pub fn drain(&mut self, emit: &mut dyn FnMut(IndexUpdate)) -> usize {
        self.collect_changes();
        let batch = std::mem::take(&mut self.pending);
        let mut emitted = 0;
        for relpath in batch {
            emitted += self.index_path(&relpath, emit);
        }
        emitted
    }

    fn collect_changes(&mut self) {
        loop {
            match self.changes.try_recv() {
                Ok(relpath) => {
                    self.pending.insert(relpath);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn index_path(&mut self, relpath: &str, emit: &mut dyn FnMut(IndexUpdate)) -> usize {
        let path = self.cache.root().join(relpath);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return self.remove_path(relpath, emit);
            }
            Err(e) => {
                warn!(path = relpath, "Failed to stat: {}", e);
                return 0;
            }
        };

        if metadata.is_dir() {
            for found in enumerate_from(self.cache.root(), relpath) {
                match found {
                    Ok(found) => {
                        self.pending.insert(found);
                    }
                    Err(e) => warn!(path = relpath, "Failed to walk directory: {}", e),
                }
            }
            return 0;
        }
        if !metadata.is_file() {
            return 0;
        }

        match self.cache.fingerprint(relpath) {
            Ok(fingerprint) => {
                debug!(path = relpath, checksum = %fingerprint.checksum, "Indexed file");
                self.indexed.insert(relpath.to_string());
                emit(IndexUpdate {
                    path: relpath.to_string(),
                    fingerprint: Some(fingerprint),
                });
                1
            }
            Err(e) => {
                warn!(path = relpath, "Failed to compute fingerprint: {}", e);
                0
            }
        }
    }

    fn remove_path(&mut self, relpath: &str, emit: &mut dyn FnMut(IndexUpdate)) -> usize {
        info!(path = relpath, "File no longer exists");
        self.indexed.remove(relpath);
        emit(IndexUpdate::removed(relpath));

        // A removed directory takes its indexed files with it
        let prefix = format!("{}/", relpath);
        let children: Vec<String> = self
            .indexed
            .range(prefix.clone()..)
            .take_while(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for child in &children {
            self.indexed.remove(child);
            emit(IndexUpdate::removed(child.clone()));
        }
        1 + children.len()
    }

    fn sweep_if_due(&mut self) {
        if self.last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = Instant::now();
        if let Err(e) = self.cache.sweep() {
            warn!("Fingerprint cache sweep failed: {}", e);
        }
    }

    /// Drain the queue forever, sending updates until the receiver is dropped.
    pub fn run(mut self, updates: UnboundedSender<IndexUpdate>) {
        loop {
            if updates.is_closed() {
                debug!("Index update receiver dropped, stopping indexer");
                return;
            }

            let emitted = self.drain(&mut |update| {
                let _ = updates.send(update);
            });
            if emitted > 0 && self.pending.is_empty() {
                info!("Done indexing {} files.", self.indexed.len());
            }

            self.sweep_if_due();
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Start watching and indexing a share on a background thread.
///
/// The initial walk queues every file; afterwards only watcher events feed the
/// queue. Updates flow into `updates` until it is closed.
pub fn spawn_indexer(
    cache: FingerprintCache,
    updates: UnboundedSender<IndexUpdate>,
) -> Result<thread::JoinHandle<()>, IndexerError> {
    let (tx, rx) = mpsc::channel();
    let watcher = ChangeWatcher::start(cache.root(), tx)?;

    let mut indexer = Indexer::new(cache, rx);
    let queued = indexer.queue_all()?;
    info!(files = queued, "Queued files for indexing");

    let handle = thread::Builder::new()
        .name("kbucket-indexer".to_string())
        .spawn(move || {
            let _watcher = watcher;
            indexer.run(updates);
        })
        .map_err(IndexerError::Spawn)?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Sha1Fingerprinter;
    use tempfile::TempDir;

    fn create_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("b/inner")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("top.txt"), b"top").unwrap();
        fs::write(root.join("a/one.txt"), b"one").unwrap();
        fs::write(root.join("b/two.txt"), b"two").unwrap();
        fs::write(root.join("b/inner/three.txt"), b"three").unwrap();
        fs::write(root.join(".git/objects/blob"), b"git").unwrap();
        fs::write(root.join(".git/HEAD"), b"ref").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), b"js").unwrap();
        temp_dir
    }

    fn new_indexer(root: &Path) -> (Indexer, mpsc::Sender<String>) {
        let cache = FingerprintCache::open(root, Box::new(Sha1Fingerprinter)).unwrap();
        let (tx, rx) = mpsc::channel();
        (Indexer::new(cache, rx), tx)
    }

    fn drain_all(indexer: &mut Indexer) -> Vec<IndexUpdate> {
        let mut updates = Vec::new();
        indexer.drain(&mut |u| updates.push(u));
        updates
    }

    #[test]
    fn test_is_indexable() {
        assert!(is_indexable("file.txt"));
        assert!(is_indexable("dir/file.txt"));
        assert!(!is_indexable(""));
        assert!(!is_indexable(".git/config"));
        assert!(!is_indexable("src/node_modules/pkg/index.js"));
        assert!(!is_indexable(".kbucket/prv_cache/x.json"));
        assert!(!is_indexable("archive.node_modules.tar"));
        // The last segment may match
        assert!(is_indexable("dir/.git"));
    }

    #[test]
    fn test_enumerate_order_files_before_subdirectories() {
        let temp_dir = create_tree();
        let paths: Vec<String> = enumerate(temp_dir.path()).map(|p| p.unwrap()).collect();
        assert_eq!(
            paths,
            vec!["top.txt", "a/one.txt", "b/two.txt", "b/inner/three.txt"]
        );
    }

    #[test]
    fn test_enumerate_skips_excluded_directories() {
        let temp_dir = create_tree();
        fs::create_dir_all(temp_dir.path().join("deep/.git")).unwrap();
        fs::write(temp_dir.path().join("deep/.git/index"), b"x").unwrap();

        for path in enumerate(temp_dir.path()) {
            let path = path.unwrap();
            assert!(!path.contains(".git"), "yielded {}", path);
            assert!(!path.contains("node_modules"), "yielded {}", path);
        }
    }

    #[test]
    fn test_enumerate_skips_state_directory() {
        let temp_dir = create_tree();
        let _cache =
            FingerprintCache::open(temp_dir.path(), Box::new(Sha1Fingerprinter)).unwrap();
        fs::write(temp_dir.path().join(STATE_DIR).join("kbshare.json"), b"{}").unwrap();

        assert!(enumerate(temp_dir.path())
            .map(|p| p.unwrap())
            .all(|p| !p.starts_with(STATE_DIR)));
    }

    #[test]
    fn test_enumerate_from_subdirectory() {
        let temp_dir = create_tree();
        let paths: Vec<String> = enumerate_from(temp_dir.path(), "b")
            .map(|p| p.unwrap())
            .collect();
        assert_eq!(paths, vec!["b/two.txt", "b/inner/three.txt"]);
    }

    #[test]
    fn test_enumerate_missing_root_is_error() {
        let mut walk = enumerate(Path::new("/nonexistent/path/that/doesnt/exist"));
        assert!(matches!(
            walk.next(),
            Some(Err(IndexerError::DirectoryRead { .. }))
        ));
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_initial_indexing_emits_every_file() {
        let temp_dir = create_tree();
        let (mut indexer, _tx) = new_indexer(temp_dir.path());

        assert_eq!(indexer.queue_all().unwrap(), 4);
        let updates = drain_all(&mut indexer);

        assert_eq!(updates.len(), 4);
        assert!(updates.iter().all(|u| u.fingerprint.is_some()));
        assert_eq!(indexer.pending_len(), 0);
        assert_eq!(indexer.indexed().len(), 4);
    }

    #[test]
    fn test_repeated_changes_collapse() {
        let temp_dir = create_tree();
        let (mut indexer, tx) = new_indexer(temp_dir.path());

        for _ in 0..5 {
            tx.send("top.txt".to_string()).unwrap();
        }
        indexer.queue("top.txt");
        let updates = drain_all(&mut indexer);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].path, "top.txt");
    }

    #[test]
    fn test_deleted_file_yields_removal() {
        let temp_dir = create_tree();
        let (mut indexer, tx) = new_indexer(temp_dir.path());
        indexer.queue_all().unwrap();
        drain_all(&mut indexer);

        fs::remove_file(temp_dir.path().join("a/one.txt")).unwrap();
        tx.send("a/one.txt".to_string()).unwrap();
        let updates = drain_all(&mut indexer);

        assert_eq!(updates, vec![IndexUpdate::removed("a/one.txt")]);
        assert!(!indexer.indexed().contains("a/one.txt"));
    }

    #[test]
    fn test_deleted_directory_removes_children() {
        let temp_dir = create_tree();
        let (mut indexer, tx) = new_indexer(temp_dir.path());
        indexer.queue_all().unwrap();
        drain_all(&mut indexer);

        fs::remove_dir_all(temp_dir.path().join("b")).unwrap();
        tx.send("b".to_string()).unwrap();
        let updates = drain_all(&mut indexer);

        let removed: BTreeSet<String> = updates.into_iter().map(|u| u.path).collect();
        assert!(removed.contains("b/two.txt"));
        assert!(removed.contains("b/inner/three.txt"));
        assert_eq!(indexer.indexed().len(), 2);
    }

    #[test]
    fn test_new_directory_is_walked() {
        let temp_dir = create_tree();
        let (mut indexer, tx) = new_indexer(temp_dir.path());

        fs::create_dir_all(temp_dir.path().join("c/d")).unwrap();
        fs::write(temp_dir.path().join("c/d/new.txt"), b"new").unwrap();
        tx.send("c".to_string()).unwrap();

        assert!(drain_all(&mut indexer).is_empty());
        let updates = drain_all(&mut indexer);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].path, "c/d/new.txt");
    }

    #[test]
    fn test_modified_file_gets_new_fingerprint() {
        let temp_dir = create_tree();
        let (mut indexer, tx) = new_indexer(temp_dir.path());
        indexer.queue("top.txt");
        let before = drain_all(&mut indexer)[0].fingerprint.clone().unwrap();

        fs::write(temp_dir.path().join("top.txt"), b"changed content").unwrap();
        tx.send("top.txt".to_string()).unwrap();
        let after = drain_all(&mut indexer)[0].fingerprint.clone().unwrap();

        assert_ne!(before.checksum, after.checksum);
        assert_eq!(after.size, 15);
    }

    #[test]
    fn test_spawn_indexer_stops_when_receiver_dropped() {
        let temp_dir = create_tree();
        let cache = FingerprintCache::open(temp_dir.path(), Box::new(Sha1Fingerprinter)).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = spawn_indexer(cache, tx).unwrap();

        let mut seen = BTreeSet::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.len() < 4 && Instant::now() < deadline {
            match rx.try_recv() {
                Ok(update) => {
                    seen.insert(update.path);
                }
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
        assert_eq!(seen.len(), 4);

        drop(rx);
        handle.join().unwrap();
    }
}
