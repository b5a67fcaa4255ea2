//! Per-share file index kept by the hub.

use std::collections::{BTreeSet, HashMap};

use crate::fingerprint::ContentFingerprint;

use super::session::SessionError;

/// What a share has reported about its files
///
/// Holds two views of the same entries: by path and by content checksum. A
/// checksum maps to every path holding that content; lookups report the first
/// in path order.
#[derive(Debug, Default)]
pub struct ShareIndex {
    by_path: HashMap<String, ContentFingerprint>,
    by_checksum: HashMap<String, BTreeSet<String>>,
    max_files: usize,
}

/// A file found in a share's index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedFile {
    pub path: String,
    pub size: u64,
}

impl ShareIndex {
    pub fn new(max_files: usize) -> Self {
        Self {
            by_path: HashMap::new(),
            by_checksum: HashMap::new(),
            max_files,
        }
    }

    /// Record (or with `None`, forget) the fingerprint of a path.
    ///
    /// The entry is always applied. `IndexFull` is returned afterwards when the
    /// index has grown past its advisory limit.
    pub fn set_file_info(
        &mut self,
        path: &str,
        fingerprint: Option<ContentFingerprint>,
    ) -> Result<(), SessionError> {
        if let Some(previous) = self.by_path.remove(path) {
            if let Some(paths) = self.by_checksum.get_mut(&previous.checksum) {
                paths.remove(path);
                if paths.is_empty() {
                    self.by_checksum.remove(&previous.checksum);
                }
            }
        }

        if let Some(fingerprint) = fingerprint {
            self.by_checksum
                .entry(fingerprint.checksum.clone())
                .or_default()
                .insert(path.to_string());
            self.by_path.insert(path.to_string(), fingerprint);
        }

        if self.by_path.len() > self.max_files {
            return Err(SessionError::IndexFull {
                files: self.by_path.len(),
                limit: self.max_files,
            });
        }
        Ok(())
    }

    /// Look up a file by content checksum.
    pub fn find(&self, checksum: &str) -> Option<IndexedFile> {
        let path = self.by_checksum.get(checksum)?.first()?;
        let fingerprint = self.by_path.get(path)?;
        Some(IndexedFile {
            path: path.clone(),
            size: fingerprint.size,
        })
    }

    pub fn get(&self, path: &str) -> Option<&ContentFingerprint> {
        self.by_path.get(path)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FINGERPRINT_VERSION;

    fn fingerprint(checksum: &str, size: u64) -> ContentFingerprint {
        ContentFingerprint {
            checksum: checksum.to_string(),
            size,
            consistency_signature: format!("head1000-{}", checksum),
            original_path: String::new(),
            version: FINGERPRINT_VERSION.to_string(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let mut index = ShareIndex::new(10);
        index.set_file_info("a.txt", Some(fingerprint("aaa", 3))).unwrap();

        assert_eq!(
            index.find("aaa"),
            Some(IndexedFile {
                path: "a.txt".to_string(),
                size: 3
            })
        );
        assert_eq!(index.find("bbb"), None);
    }

    #[test]
    fn test_removal_clears_both_maps() {
        let mut index = ShareIndex::new(10);
        index.set_file_info("a.txt", Some(fingerprint("aaa", 3))).unwrap();
        index.set_file_info("a.txt", None).unwrap();

        assert!(index.is_empty());
        assert!(index.get("a.txt").is_none());
        assert!(index.find("aaa").is_none());
    }

    #[test]
    fn test_changed_content_drops_old_checksum() {
        let mut index = ShareIndex::new(10);
        index.set_file_info("a.txt", Some(fingerprint("aaa", 3))).unwrap();
        index.set_file_info("a.txt", Some(fingerprint("bbb", 4))).unwrap();

        assert!(index.find("aaa").is_none());
        assert_eq!(index.find("bbb").unwrap().size, 4);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_duplicate_content_keeps_other_path() {
        let mut index = ShareIndex::new(10);
        index.set_file_info("a.txt", Some(fingerprint("same", 1))).unwrap();
        index.set_file_info("b.txt", Some(fingerprint("same", 1))).unwrap();
        assert_eq!(index.find("same").unwrap().path, "a.txt");

        index.set_file_info("a.txt", None).unwrap();
        assert_eq!(index.find("same").unwrap().path, "b.txt");
        index.set_file_info("b.txt", None).unwrap();
        assert!(index.find("same").is_none());
    }

    #[test]
    fn test_removing_newer_duplicate_keeps_older_path() {
        let mut index = ShareIndex::new(10);
        index.set_file_info("a.txt", Some(fingerprint("same", 1))).unwrap();
        index.set_file_info("copy/a.txt", Some(fingerprint("same", 1))).unwrap();

        index.set_file_info("copy/a.txt", None).unwrap();
        assert!(index.get("a.txt").is_some());
        assert_eq!(
            index.find("same"),
            Some(IndexedFile {
                path: "a.txt".to_string(),
                size: 1
            })
        );
    }

    #[test]
    fn test_changed_duplicate_moves_between_checksums() {
        let mut index = ShareIndex::new(10);
        index.set_file_info("a.txt", Some(fingerprint("same", 1))).unwrap();
        index.set_file_info("b.txt", Some(fingerprint("same", 1))).unwrap();
        index.set_file_info("a.txt", Some(fingerprint("other", 2))).unwrap();

        assert_eq!(index.find("same").unwrap().path, "b.txt");
        assert_eq!(index.find("other").unwrap().path, "a.txt");
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_limit_is_advisory() {
        let mut index = ShareIndex::new(2);
        index.set_file_info("a", Some(fingerprint("1", 1))).unwrap();
        index.set_file_info("b", Some(fingerprint("2", 1))).unwrap();

        let result = index.set_file_info("c", Some(fingerprint("3", 1)));
        assert!(matches!(
            result,
            Err(SessionError::IndexFull { files: 3, limit: 2 })
        ));
        assert!(index.find("3").is_some());
    }
}
