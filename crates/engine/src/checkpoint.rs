//! On-disk resumable-upload checkpoints.
//!
//! One JSON file per content key, named by the SHA-256 of the key, so two
//! keys never share a file and a key never spans two. Writes go through a
//! temporary file and a rename; a crash leaves either the previous or the
//! new checkpoint, never a torn one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use driftbox_transfer::{ContentKey, checksum_bytes};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Progress of a chunked upload, as acknowledged by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub key: String,
    /// Storage session the bytes were staged under.
    pub storage_id: String,
    /// Total content size the session was started for.
    pub size: u64,
    /// Bytes acknowledged so far; the next chunk starts here.
    pub offset: u64,
    pub updated_at: DateTime<Utc>,
}

/// Directory of checkpoint files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", checksum_bytes(key.as_bytes())))
    }

    /// Loads the checkpoint for `key`.
    ///
    /// A file that cannot be parsed, or that belongs to a different key, is
    /// treated as absent.
    pub fn load(&self, key: &ContentKey) -> Option<Checkpoint> {
        let path = self.path_for(key.as_str());
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(%key, error = %e, "failed to read upload checkpoint");
                return None;
            }
        };
        match serde_json::from_str::<Checkpoint>(&data) {
            Ok(cp) if cp.key == key.as_str() => Some(cp),
            Ok(_) => {
                warn!(%key, "checkpoint file belongs to another key, ignoring");
                None
            }
            Err(e) => {
                warn!(%key, error = %e, "corrupt upload checkpoint, ignoring");
                None
            }
        }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&checkpoint.key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(checkpoint).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(key = %checkpoint.key, offset = checkpoint.offset, "checkpoint saved");
        Ok(())
    }

    /// Removes the checkpoint for `key`. Missing files are fine.
    pub fn remove(&self, key: &ContentKey) -> std::io::Result<()> {
        match std::fs::remove_file(self.path_for(key.as_str())) {
            Ok(()) => {
                debug!(%key, "checkpoint removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
