//! Filesystem watcher feeding the indexer queue.
//!
//! Every create, modify or remove event below the share root is reduced to a
//! root-relative path and sent to the indexer. The indexer decides what the
//! change means by looking at the filesystem again.

use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::Sender;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use super::{is_indexable, STATE_DIR};

/// Handle to a running change watcher.
///
/// Watching stops when this is dropped.
pub struct ChangeWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    /// Watch `root` recursively, sending changed relative paths to `sender`.
    pub fn start(root: &Path, sender: Sender<String>) -> Result<Self, notify::Error> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

        let event_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    for path in &event.paths {
                        if let Some(relpath) = relevant_path(&event_root, path) {
                            let _ = sender.send(relpath);
                        }
                    }
                }
                Err(e) => warn!("File watcher error: {}", e),
            }
        })?;

        watcher.watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reduce an event path to an indexable path relative to `root`.
///
/// Returns `None` for the root itself, anything outside it, the share's
/// state directory and excluded paths.
pub fn relevant_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() || parts[0] == STATE_DIR {
        return None;
    }

    let relpath = parts.join("/");
    is_indexable(&relpath).then_some(relpath)
}
