//! In-process checkpoint store.
//!
//! Snapshots are deep-copied on write and on read, so later parameter
//! updates never leak into a stored checkpoint and vice versa.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::{CheckpointError, CheckpointStore, checkpoint_file_name};

#[derive(Default)]
struct State {
    files: HashMap<PathBuf, HashMap<String, Tensor>>,
    latest: HashMap<PathBuf, PathBuf>,
}

/// [`CheckpointStore`] backed by a map of virtual paths.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<State>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of stored snapshots across all directories.
    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the snapshot at `path`, leaving any index entry dangling.
    pub fn remove(&self, path: &Path) -> bool {
        self.lock().files.remove(path).is_some()
    }
}

fn deep_copy(
    tensors: &HashMap<String, Tensor>,
    device: &Device,
) -> Result<HashMap<String, Tensor>, CheckpointError> {
    tensors
        .iter()
        .map(|(k, t)| Ok((k.clone(), t.to_device(device)?.copy()?)))
        .collect()
}

impl CheckpointStore for MemoryCheckpointStore {
    fn latest_checkpoint(&self, dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
        let state = self.lock();
        Ok(state
            .latest
            .get(dir)
            .filter(|p| state.files.contains_key(*p))
            .cloned())
    }

    fn read(
        &self,
        path: &Path,
        device: &Device,
    ) -> Result<HashMap<String, Tensor>, CheckpointError> {
        let state = self.lock();
        let tensors = state
            .files
            .get(path)
            .ok_or_else(|| CheckpointError::NotFound(path.to_path_buf()))?;
        deep_copy(tensors, device)
    }

    fn write(
        &self,
        dir: &Path,
        prefix: &str,
        step: u64,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<PathBuf, CheckpointError> {
        let path = dir.join(checkpoint_file_name(prefix, step)?);
        let copy = tensors
            .iter()
            .map(|(k, t)| Ok((k.clone(), t.copy()?)))
            .collect::<Result<HashMap<_, _>, CheckpointError>>()?;
        let mut state = self.lock();
        state.files.insert(path.clone(), copy);
        state.latest.insert(dir.to_path_buf(), path.clone());
        debug!(path = %path.display(), tensors = tensors.len(), "stored in-memory checkpoint");
        Ok(path)
    }
}
