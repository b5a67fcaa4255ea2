//! Persistent identity of a share.
//!
//! The identity lives in `<root>/.kbucket/kbshare.json` so that a share keeps
//! the same id across restarts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::indexer::STATE_DIR;
use crate::protocol::ShareId;

/// Identity file name inside the state directory
const IDENTITY_FILE: &str = "kbshare.json";

/// Number of key characters used as the share id
pub const SHARE_ID_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to access identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse identity file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Identity file {0} holds an unusable public key")]
    InvalidKey(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShareIdentity {
    pub public_key: String,
}

impl ShareIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let key = [Uuid::new_v4(), Uuid::new_v4()]
            .iter()
            .map(|id| hex::encode(id.as_bytes()))
            .collect::<String>();
        Self { public_key: key }
    }

    /// Share id derived from the public key.
    pub fn share_id(&self) -> ShareId {
        ShareId::new(self.public_key.chars().take(SHARE_ID_LEN).collect::<String>())
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(STATE_DIR).join(IDENTITY_FILE)
    }

    /// Load the identity of the share rooted at `root`, creating one if needed.
    pub fn load_or_create(root: &Path) -> Result<Self, IdentityError> {
        let path = Self::path(root);
        let io_err = |source| IdentityError::Io {
            path: path.clone(),
            source,
        };

        match fs::read_to_string(&path) {
            Ok(contents) => {
                let identity: ShareIdentity =
                    serde_json::from_str(&contents).map_err(|source| IdentityError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                if identity.public_key.len() < SHARE_ID_LEN
                    || !identity.public_key.chars().all(|c| c.is_ascii_alphanumeric())
                {
                    return Err(IdentityError::InvalidKey(path));
                }
                Ok(identity)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate();
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir).map_err(io_err)?;
                }
                let contents =
                    serde_json::to_string_pretty(&identity).map_err(|source| IdentityError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                fs::write(&path, contents).map_err(io_err)?;
                info!(share_id = %identity.share_id(), "Created new share identity");
                Ok(identity)
            }
            Err(e) => Err(io_err(e)),
        }
    }
}
