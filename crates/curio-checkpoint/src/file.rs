//! Filesystem checkpoint store.
//!
//! # Directory layout
//!
//! | file | contents |
//! |---|---|
//! | `<prefix>-<step>.safetensors` | one snapshot, tensors keyed by parameter name |
//! | `checkpoint.json` | [`CheckpointIndex`]: latest snapshot, retained snapshots, update time |
//!
//! Both kinds of file are written to a hidden temporary name first and then
//! renamed into place, so a reader never observes a half-written snapshot or
//! index.  A missing directory, a missing or unparsable index, and an index
//! naming a file that no longer exists all resolve to "no checkpoint".

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{CheckpointError, CheckpointStore, checkpoint_file_name};

/// Name of the per-directory index file.
pub const INDEX_FILE_NAME: &str = "checkpoint.json";

/// Default number of snapshots retained per directory.
pub const DEFAULT_MAX_TO_KEEP: usize = 5;

/// Contents of `checkpoint.json`.  Paths are file names relative to the
/// directory holding the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub model_checkpoint_path: String,
    pub all_checkpoint_paths: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointIndex {
    /// Load the index in `dir`; `None` when it is absent or unreadable.
    pub fn load(dir: &Path) -> Result<Option<Self>, CheckpointError> {
        let path = dir.join(INDEX_FILE_NAME);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(index) => Ok(Some(index)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint index");
                Ok(None)
            }
        }
    }

    fn save(&self, dir: &Path) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = dir.join(format!(".{INDEX_FILE_NAME}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, dir.join(INDEX_FILE_NAME))?;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FileCheckpointStore
// ────────────────────────────────────────────────────────────────────────────

/// Safetensors-on-disk [`CheckpointStore`].
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    max_to_keep: usize,
}

impl Default for FileCheckpointStore {
    fn default() -> Self {
        Self {
            max_to_keep: DEFAULT_MAX_TO_KEEP,
        }
    }
}

impl FileCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain at most `n` snapshots per directory; `0` keeps everything.
    pub fn with_max_to_keep(mut self, n: usize) -> Self {
        self.max_to_keep = n;
        self
    }

    /// Every snapshot the index of `dir` still lists, oldest first.
    pub fn list(&self, dir: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
        Ok(CheckpointIndex::load(dir)?
            .map(|idx| idx.all_checkpoint_paths.iter().map(|p| dir.join(p)).collect())
            .unwrap_or_default())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn latest_checkpoint(&self, dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let Some(index) = CheckpointIndex::load(dir)? else {
            return Ok(None);
        };
        let path = dir.join(&index.model_checkpoint_path);
        if !path.is_file() {
            warn!(path = %path.display(), "checkpoint index names a missing file");
            return Ok(None);
        }
        Ok(Some(path))
    }

    fn read(
        &self,
        path: &Path,
        device: &Device,
    ) -> Result<HashMap<String, Tensor>, CheckpointError> {
        if !path.is_file() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let tensors = candle_core::safetensors::load(path, device)?;
        debug!(path = %path.display(), tensors = tensors.len(), "read checkpoint");
        Ok(tensors)
    }

    fn write(
        &self,
        dir: &Path,
        prefix: &str,
        step: u64,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<PathBuf, CheckpointError> {
        let name = checkpoint_file_name(prefix, step)?;
        fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(".{name}.tmp"));
        candle_core::safetensors::save(tensors, &tmp)?;
        let path = dir.join(&name);
        fs::rename(&tmp, &path)?;

        let mut all = CheckpointIndex::load(dir)?
            .map(|idx| idx.all_checkpoint_paths)
            .unwrap_or_default();
        all.retain(|p| p != &name);
        all.push(name.clone());
        if self.max_to_keep > 0 && all.len() > self.max_to_keep {
            let stale: Vec<String> = all.drain(..all.len() - self.max_to_keep).collect();
            for old in stale {
                match fs::remove_file(dir.join(&old)) {
                    Ok(()) => debug!(file = %old, "pruned old checkpoint"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        CheckpointIndex {
            model_checkpoint_path: name,
            all_checkpoint_paths: all,
            updated_at: Utc::now(),
        }
        .save(dir)?;
        info!(path = %path.display(), step, tensors = tensors.len(), "wrote checkpoint");
        Ok(path)
    }
}
