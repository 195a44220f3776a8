//! Scoped save/restore of a parameter set.
//!
//! A [`Saver`] covers a fixed [`ParameterSet`] below a root scope.  Tensor
//! keys in its checkpoints are parameter names with the root prefix
//! stripped, so a checkpoint written by a single-view model under one scope
//! restores into an identically shaped model under any other scope.
//!
//! Restoring is split in two: [`Saver::stage`] resolves the latest
//! checkpoint and validates every key and shape without touching a
//! variable; [`StagedRestore::commit`] then assigns the values.  Callers that
//! restore several savers together stage all of them before committing any.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Tensor, Var};
use curio_checkpoint::CheckpointStore;
use curio_vision::{ParamStore, ParameterSet, params::SCOPE_SEPARATOR};
use tracing::{debug, error, info};

use crate::IcmError;

/// Saves and restores one view's parameters.
#[derive(Debug, Clone)]
pub struct Saver {
    view: usize,
    root: String,
    params: ParameterSet,
}

/// Validated values waiting to be assigned.
#[derive(Debug)]
pub struct StagedRestore {
    view: usize,
    path: PathBuf,
    assignments: Vec<(Var, Tensor)>,
}

impl Saver {
    pub fn new(view: usize, root: &ParamStore, params: ParameterSet) -> Self {
        Self {
            view,
            root: root.prefix(),
            params,
        }
    }

    pub fn view(&self) -> usize {
        self.view
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    fn checkpoint_key<'a>(&self, name: &'a str) -> &'a str {
        if self.root.is_empty() {
            return name;
        }
        name.strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix(SCOPE_SEPARATOR))
            .unwrap_or(name)
    }

    /// Write the current values as step `step` of `dir`.
    pub fn save(
        &self,
        store: &dyn CheckpointStore,
        dir: &Path,
        prefix: &str,
        step: u64,
    ) -> Result<PathBuf, IcmError> {
        let tensors: HashMap<String, Tensor> = self
            .params
            .snapshot()?
            .into_iter()
            .map(|(name, t)| (self.checkpoint_key(&name).to_string(), t))
            .collect();
        let path = store.write(dir, prefix, step, &tensors)?;
        info!(view = self.view, path = %path.display(), "saved view parameters");
        Ok(path)
    }

    /// Resolve and validate the latest checkpoint in `dir`.
    ///
    /// `Ok(None)` (with an error-level event naming the view and directory)
    /// when the directory has no checkpoint or the checkpoint does not cover
    /// every parameter with the right shape.
    pub fn stage(
        &self,
        store: &dyn CheckpointStore,
        dir: &Path,
    ) -> Result<Option<StagedRestore>, IcmError> {
        let Some(path) = store.latest_checkpoint(dir)? else {
            error!(view = self.view, dir = %dir.display(), "view was not restored: no checkpoint in directory");
            return Ok(None);
        };
        let Some((_, first)) = self.params.iter().next() else {
            return Ok(Some(StagedRestore {
                view: self.view,
                path,
                assignments: Vec::new(),
            }));
        };
        let tensors = match store.read(&path, first.device()) {
            Ok(t) => t,
            Err(e) => {
                error!(view = self.view, path = %path.display(), error = %e, "view was not restored: unreadable checkpoint");
                return Ok(None);
            }
        };
        let mut assignments = Vec::with_capacity(self.params.len());
        for (name, var) in self.params.iter() {
            let key = self.checkpoint_key(name);
            match tensors.get(key) {
                Some(t) if t.dims() == var.dims() => {
                    assignments.push((var.clone(), t.to_dtype(var.dtype())?));
                }
                Some(t) => {
                    error!(view = self.view, path = %path.display(), key, found = ?t.dims(), expected = ?var.dims(), "view was not restored: shape mismatch");
                    return Ok(None);
                }
                None => {
                    error!(view = self.view, path = %path.display(), key, "view was not restored: parameter missing from checkpoint");
                    return Ok(None);
                }
            }
        }
        debug!(view = self.view, path = %path.display(), params = assignments.len(), "staged restore");
        Ok(Some(StagedRestore {
            view: self.view,
            path,
            assignments,
        }))
    }

    /// Stage and commit in one step; `Ok(false)` when nothing was restored.
    pub fn restore(&self, store: &dyn CheckpointStore, dir: &Path) -> Result<bool, IcmError> {
        match self.stage(store, dir)? {
            Some(staged) => {
                staged.commit()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl StagedRestore {
    pub fn view(&self) -> usize {
        self.view
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Assign every staged value.
    pub fn commit(self) -> Result<PathBuf, IcmError> {
        for (var, value) in &self.assignments {
            var.set(value)?;
        }
        info!(view = self.view, path = %self.path.display(), params = self.assignments.len(), "restored view");
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use curio_checkpoint::MemoryCheckpointStore;

    fn store_with(scope: &str, value: f32) -> ParamStore {
        let root = ParamStore::new(Device::Cpu);
        let scoped = root.pp(scope);
        let _ = scoped
            .pp("head")
            .var_builder()
            .get_with_hints(2, "bias", candle_nn::Init::Const(value as f64))
            .unwrap();
        scoped
    }

    #[test]
    fn keys_are_relative_to_the_root_scope() {
        let scoped = store_with("icm_view3", 1.0);
        let saver = Saver::new(3, &scoped, scoped.collect());
        assert_eq!(saver.checkpoint_key("icm_view3.head.bias"), "head.bias");
        let ckpt = MemoryCheckpointStore::new();
        let path = saver.save(&ckpt, Path::new("d"), "icm", 1).unwrap();
        let tensors = ckpt.read(&path, &Device::Cpu).unwrap();
        assert!(tensors.contains_key("head.bias"));
    }

    #[test]
    fn checkpoint_moves_between_scopes() {
        let ckpt = MemoryCheckpointStore::new();
        let src = store_with("icm", 4.0);
        Saver::new(0, &src, src.collect())
            .save(&ckpt, Path::new("d"), "icm", 1)
            .unwrap();

        let dst = store_with("icm_view1", 0.0);
        let saver = Saver::new(1, &dst, dst.collect());
        assert!(saver.restore(&ckpt, Path::new("d")).unwrap());
        let bias = dst.collect().get("icm_view1.head.bias").unwrap().clone();
        assert_eq!(bias.as_tensor().to_vec1::<f32>().unwrap(), vec![4.0, 4.0]);
    }

    #[test]
    fn missing_directory_restores_nothing() {
        let ckpt = MemoryCheckpointStore::new();
        let dst = store_with("icm", 2.0);
        let saver = Saver::new(0, &dst, dst.collect());
        assert!(!saver.restore(&ckpt, Path::new("empty")).unwrap());
        let bias = dst.collect().get("icm.head.bias").unwrap().clone();
        assert_eq!(bias.as_tensor().to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn incomplete_checkpoint_is_rejected_before_assignment() {
        let ckpt = MemoryCheckpointStore::new();
        let mut partial = HashMap::new();
        partial.insert(
            "other.bias".to_string(),
            Tensor::new(&[9f32, 9.0], &Device::Cpu).unwrap(),
        );
        ckpt.write(Path::new("d"), "icm", 1, &partial).unwrap();

        let dst = store_with("icm", 2.0);
        let saver = Saver::new(0, &dst, dst.collect());
        assert!(saver.stage(&ckpt, Path::new("d")).unwrap().is_none());
    }
}
