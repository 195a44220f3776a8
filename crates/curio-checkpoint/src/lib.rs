//! `curio-checkpoint` – directory-keyed checkpoint storage.
//!
//! A checkpoint is a flat map from parameter name to tensor value.  Callers
//! address checkpoints by *directory*: each directory holds any number of
//! step-numbered snapshots plus an index naming the most recent one, so
//! "restore view 2 from `runs/view2`" resolves to the latest snapshot in that
//! directory.
//!
//! # Modules
//!
//! - [`file`] – [`FileCheckpointStore`][file::FileCheckpointStore]:
//!   `<prefix>-<step>.safetensors` files plus a `checkpoint.json` index,
//!   written atomically, with optional retention of the last N snapshots.
//! - [`memory`] – [`MemoryCheckpointStore`][memory::MemoryCheckpointStore]:
//!   the same contract held in process memory, for tests and dry runs.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::path::Path;
//! use candle_core::{Device, Tensor};
//! use curio_checkpoint::{CheckpointStore, MemoryCheckpointStore};
//!
//! let store = MemoryCheckpointStore::new();
//! let dir = Path::new("runs/view0");
//! assert!(store.latest_checkpoint(dir).unwrap().is_none());
//!
//! let mut tensors = HashMap::new();
//! tensors.insert("w".to_string(), Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap());
//! let path = store.write(dir, "icm", 7, &tensors).unwrap();
//!
//! assert_eq!(store.latest_checkpoint(dir).unwrap(), Some(path.clone()));
//! let back = store.read(&path, &Device::Cpu).unwrap();
//! assert_eq!(back["w"].to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
//! ```

pub mod file;
pub mod memory;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use thiserror::Error;

pub use file::{CheckpointIndex, FileCheckpointStore, INDEX_FILE_NAME};
pub use memory::MemoryCheckpointStore;

/// Extension of checkpoint payload files.
pub const CHECKPOINT_EXTENSION: &str = "safetensors";

// ────────────────────────────────────────────────────────────────────────────
// Error type
// ────────────────────────────────────────────────────────────────────────────

/// Errors that can arise while reading or writing checkpoints.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint index error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Checkpoint prefix {0:?} must be non-empty and contain no path separators")]
    InvalidPrefix(String),

    #[error("No checkpoint at {0}")]
    NotFound(PathBuf),
}

// ────────────────────────────────────────────────────────────────────────────
// CheckpointStore
// ────────────────────────────────────────────────────────────────────────────

/// Storage backend for parameter snapshots.
pub trait CheckpointStore {
    /// Path of the most recent checkpoint in `dir`, or `None` when the
    /// directory holds no usable checkpoint.
    fn latest_checkpoint(&self, dir: &Path) -> Result<Option<PathBuf>, CheckpointError>;

    /// Load every tensor of the checkpoint at `path` onto `device`.
    fn read(&self, path: &Path, device: &Device)
    -> Result<HashMap<String, Tensor>, CheckpointError>;

    /// Persist `tensors` as step `step` in `dir` and make it the latest.
    fn write(
        &self,
        dir: &Path,
        prefix: &str,
        step: u64,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<PathBuf, CheckpointError>;
}

/// `<prefix>-<step>.safetensors`.
pub fn checkpoint_file_name(prefix: &str, step: u64) -> Result<String, CheckpointError> {
    if prefix.is_empty() || prefix.contains(['/', '\\']) {
        return Err(CheckpointError::InvalidPrefix(prefix.to_string()));
    }
    Ok(format!("{prefix}-{step}.{CHECKPOINT_EXTENSION}"))
}

/// Step number encoded in a checkpoint file name.
///
/// ```rust
/// use std::path::Path;
/// assert_eq!(curio_checkpoint::step_from_path(Path::new("d/icm-model-120.safetensors")), Some(120));
/// assert_eq!(curio_checkpoint::step_from_path(Path::new("d/checkpoint.json")), None);
/// ```
pub fn step_from_path(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != CHECKPOINT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (_, step) = stem.rsplit_once('-')?;
    step.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_embeds_prefix_and_step() {
        assert_eq!(checkpoint_file_name("icm", 3).unwrap(), "icm-3.safetensors");
        assert!(matches!(
            checkpoint_file_name("", 3),
            Err(CheckpointError::InvalidPrefix(_))
        ));
        assert!(checkpoint_file_name("a/b", 3).is_err());
    }

    #[test]
    fn step_is_parsed_back_from_file_name() {
        let name = checkpoint_file_name("view-0", 42).unwrap();
        assert_eq!(step_from_path(Path::new(&name)), Some(42));
        assert_eq!(step_from_path(Path::new("icm-x.safetensors")), None);
        assert_eq!(step_from_path(Path::new("icm-3.bin")), None);
    }
}
