//! Durable storage for the worker's credential pair.
//!
//! The identity file is rewritten through a temp file in the same directory
//! followed by an atomic rename, so a crash mid-write can never leave a
//! half-written credential behind: either the old identity survives intact or
//! the new one is fully in place.

use std::io::Write;
use std::path::{Path, PathBuf};

use farmhand_core::WorkerIdentity;
use tracing::{debug, info};

use crate::error::{Result, WorkerError};

/// File-backed store for [`WorkerIdentity`]. No network access.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored identity, or `None` if none was ever saved.
    ///
    /// An unreadable or corrupt file is a storage error, not an absent
    /// identity: silently re-registering would orphan the manager-side
    /// record the file pointed at.
    pub fn load(&self) -> Result<Option<WorkerIdentity>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no stored identity");
                return Ok(None);
            }
            Err(err) => {
                return Err(WorkerError::storage("reading identity file", err));
            }
        };

        let identity: WorkerIdentity = serde_json::from_slice(&bytes)
            .map_err(|e| WorkerError::storage("parsing identity file", e))?;
        debug!(worker_id = %identity.worker_id, "loaded stored identity");
        Ok(Some(identity))
    }

    /// Durably write the identity.
    pub fn save(&self, identity: &WorkerIdentity) -> Result<()> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());

        let mut tmp = match dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir),
            None => tempfile::NamedTempFile::new(),
        }
        .map_err(|e| WorkerError::storage("creating identity temp file", e))?;

        let json = serde_json::to_vec_pretty(identity)
            .map_err(|e| WorkerError::storage("encoding identity", e))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.flush())
            .map_err(|e| WorkerError::storage("writing identity temp file", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| WorkerError::storage("syncing identity temp file", e))?;

        tmp.persist(&self.path)
            .map_err(|e| WorkerError::storage("replacing identity file", e))?;

        info!(path = %self.path.display(), worker_id = %identity.worker_id, "identity saved");
        Ok(())
    }

    /// Remove the stored identity (used by forced re-registration).
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WorkerError::storage("removing identity file", err)),
        }
    }
}
