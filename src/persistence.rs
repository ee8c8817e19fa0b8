//! Snapshot persistence.
//!
//! Saves the terminal run state to a JSON file so a later run can skip
//! already-completed steps. Writes go to a temp file that is renamed over
//! the target, so readers never observe a torn snapshot. Loading fails
//! open: an unreadable snapshot falls back to a fresh state instead of
//! blocking the run.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::engine::state::Snapshot;
use crate::error::{Error, Result};

/// File-backed snapshot storage. A no-op on both ends when unconfigured.
pub struct SnapshotStore {
    path: Option<PathBuf>,
}

impl SnapshotStore {
    /// Create a store writing to `path`, or a no-op store when None.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Whether a snapshot location is configured.
    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Load the stored snapshot, if a valid one exists.
    pub fn load(&self) -> Option<Snapshot> {
        let path = self.path.as_ref()?;

        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read snapshot {:?}, starting fresh: {}", path, e);
                return None;
            }
        };

        match serde_json::from_str(&json) {
            Ok(snapshot) => {
                debug!("Loaded snapshot from {:?}", path);
                Some(snapshot)
            }
            Err(e) => {
                warn!("Invalid snapshot {:?}, starting fresh: {}", path, e);
                None
            }
        }
    }

    /// Write a snapshot atomically (write-temp-then-replace). A no-op
    /// when unconfigured.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::Persistence(format!("create {:?}: {}", parent, e)))?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::Persistence(format!("serialize snapshot: {}", e)))?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .map_err(|e| Error::Persistence(format!("write {:?}: {}", tmp, e)))?;
        fs::rename(&tmp, path)
            .map_err(|e| Error::Persistence(format!("replace {:?}: {}", path, e)))?;

        debug!("Saved snapshot to {:?}", path);
        Ok(())
    }
}
