//! Pending creation persistence
//!
//! Keeps the unresolved creation handle on disk so `resume` can pick the
//! session up after the process exits.

use agmon_common::config::write_atomic;
use agmon_common::events::PendingCreation;
use agmon_common::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct PendingStore {
    path: PathBuf,
}

impl PendingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, pending: &PendingCreation) -> Result<()> {
        let json = serde_json::to_vec_pretty(pending)?;
        write_atomic(&self.path, &json)?;
        info!(
            path = %self.path.display(),
            lookup_key = %pending.lookup_key,
            "Saved pending creation"
        );
        Ok(())
    }

    /// Stored handle, or `None` if nothing is pending
    pub fn load(&self) -> Result<Option<PendingCreation>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let pending = serde_json::from_slice(&content).map_err(|e| {
            Error::Config(format!(
                "Corrupt pending creation file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(pending))
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Cleared pending creation");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
