//! ICM-IndependentCommittee: one independently checkpointed module per view.
//!
//! Views are trained separately (typically one single-view pretraining run
//! each) and combined only at inference time:
//!
//! - default: `softmax(Σ_v softmax(pred_v))`
//! - `singlesoftmax`: `softmax(Σ_v pred_v)`
//!
//! There is no joint training loss; [`CuriosityModel::inverse_loss`] returns
//! the [`INVALID_LOSS`][crate::INVALID_LOSS] sentinel, which
//! [`ensure_trainable_loss`][crate::ensure_trainable_loss] rejects.
//!
//! Each view owns a [`Saver`] over its extractor and inverse head, keyed
//! relative to its `icm_view{i}` scope.  Forward heads and feature heads are
//! never checkpointed, even when their variables already sit in the shared
//! store from an earlier build.  [`restore`] is all or nothing: every view's checkpoint is resolved and validated before any
//! value is assigned.
//!
//! [`restore`]: IcmIndependentCommittee::restore

use std::path::{Path, PathBuf};

use candle_core::{D, Device, Tensor};
use candle_nn::ops::softmax;
use curio_checkpoint::CheckpointStore;
use curio_types::{ConfigError, IcmConfig, LossMode, PermutationMatrices};
use curio_vision::{FeedForward, FeedForwardConfig, ParamStore, ParameterSet};
use tracing::{debug, info, instrument};

use crate::committee::{build_views, concat_views, disjoint};
use crate::model::{CuriosityModel, ModelOutput, add_n, invalid_loss, require_discrete};
use crate::{IcmError, IntrinsicCuriosityModule, Observations, Saver, Stage};

/// Inference-time ensemble of independently trained per-view modules.
pub struct IcmIndependentCommittee {
    views: Vec<IntrinsicCuriosityModule>,
    savers: Vec<Saver>,
    singlesoftmax: bool,
    store: ParamStore,
    inverse: Stage<Tensor>,
    forward: Stage<ModelOutput>,
    forward_loss: Stage<Tensor>,
    cur_featvec: Stage<Tensor>,
    next_featvec: Stage<Tensor>,
}

impl IcmIndependentCommittee {
    #[instrument(skip_all, fields(scope = %store.prefix(), views = obs.view_num()))]
    pub fn new(
        obs: Observations,
        config: &IcmConfig,
        permutations: Option<&PermutationMatrices>,
        store: &ParamStore,
    ) -> Result<Self, IcmError> {
        let mut views = build_views(&obs, config, permutations, store)?;
        let mut savers = Vec::with_capacity(views.len());
        for (i, icm) in views.iter_mut().enumerate() {
            savers.push(icm.create_pretrain_saver(i)?.clone());
        }
        let covered = disjoint(savers.iter().map(|s| s.params().clone()))?;
        debug!(params = covered.len(), singlesoftmax = config.singlesoftmax, "built independent committee");
        Ok(Self {
            views,
            savers,
            singlesoftmax: config.singlesoftmax,
            store: store.clone(),
            inverse: Stage::Uninitialized,
            forward: Stage::Uninitialized,
            forward_loss: Stage::Uninitialized,
            cur_featvec: Stage::Uninitialized,
            next_featvec: Stage::Uninitialized,
        })
    }

    pub fn views(&self) -> &[IntrinsicCuriosityModule] {
        &self.views
    }

    pub fn savers(&self) -> &[Saver] {
        &self.savers
    }

    fn saver(&self, view: usize) -> Result<&Saver, IcmError> {
        self.savers.get(view).ok_or_else(|| {
            ConfigError::ViewOutOfRange {
                view,
                views: self.savers.len(),
            }
            .into()
        })
    }

    /// Restore every view from its own directory, in view order.
    ///
    /// `Ok(false)` as soon as one view has no usable checkpoint; in that
    /// case no parameter of any view has been modified.
    pub fn restore<P: AsRef<Path>>(
        &self,
        store: &dyn CheckpointStore,
        dirs: &[P],
    ) -> Result<bool, IcmError> {
        if dirs.len() != self.savers.len() {
            return Err(ConfigError::CheckpointCount {
                expected: self.savers.len(),
                found: dirs.len(),
            }
            .into());
        }
        let mut staged = Vec::with_capacity(dirs.len());
        for (saver, dir) in self.savers.iter().zip(dirs) {
            match saver.stage(store, dir.as_ref())? {
                Some(s) => staged.push(s),
                None => return Ok(false),
            }
        }
        for s in staged {
            s.commit()?;
        }
        info!(views = self.savers.len(), "restored every view");
        Ok(true)
    }

    /// Restore one view only; other views are never touched.
    pub fn restore_view(
        &self,
        store: &dyn CheckpointStore,
        view: usize,
        dir: &Path,
    ) -> Result<bool, IcmError> {
        self.saver(view)?.restore(store, dir)
    }

    /// Write one view's parameters as step `step` of `dir`.
    pub fn save_view(
        &self,
        store: &dyn CheckpointStore,
        view: usize,
        dir: &Path,
        prefix: &str,
        step: u64,
    ) -> Result<PathBuf, IcmError> {
        self.saver(view)?.save(store, dir, prefix, step)
    }

    /// One head per view over that view's current feature, under
    /// `<name>.view_{i}`; the softmaxed outputs are summed.
    pub fn create_head_from_feature(
        &self,
        name: &str,
        head: FeedForwardConfig,
    ) -> Result<ModelOutput, IcmError> {
        let scope = self.store.pp(name);
        let outs = self
            .views
            .iter()
            .enumerate()
            .map(|(i, icm)| {
                let input = icm.cur_features();
                let net = FeedForward::new(
                    input.dim(2)?,
                    head.clone(),
                    &scope.pp(format!("view_{i}")),
                )?;
                Ok(softmax(&net.infer(input)?, D::Minus1)?)
            })
            .collect::<Result<Vec<_>, IcmError>>()?;
        Ok(ModelOutput {
            output: add_n(&outs)?,
            params: scope.collect(),
        })
    }

    fn device(&self) -> &Device {
        self.store.device()
    }
}

impl CuriosityModel for IcmIndependentCommittee {
    fn view_num(&self) -> usize {
        self.views.len()
    }

    fn action_space_dimension(&self) -> usize {
        self.views
            .first()
            .map_or(0, |icm| icm.action_space_dimension())
    }

    fn cur_featvec(&mut self) -> Result<Tensor, IcmError> {
        let views = &self.views;
        Ok(self
            .cur_featvec
            .get_or_try_build(|| concat_views(views, IntrinsicCuriosityModule::cur_features))?
            .clone())
    }

    fn next_featvec(&mut self) -> Result<Tensor, IcmError> {
        let views = &self.views;
        Ok(self
            .next_featvec
            .get_or_try_build(|| concat_views(views, IntrinsicCuriosityModule::next_features))?
            .clone())
    }

    /// Ensemble prediction; the parameter set is always empty.
    fn inverse_model(&mut self) -> Result<ModelOutput, IcmError> {
        let views = &mut self.views;
        let singlesoftmax = self.singlesoftmax;
        let output = self
            .inverse
            .get_or_try_build(|| {
                let preds = views
                    .iter_mut()
                    .map(|icm| {
                        let pred = icm.inverse_model()?.output;
                        if singlesoftmax {
                            Ok(pred)
                        } else {
                            Ok(softmax(&pred, D::Minus1)?)
                        }
                    })
                    .collect::<Result<Vec<_>, IcmError>>()?;
                Ok::<_, IcmError>(softmax(&add_n(&preds)?, D::Minus1)?)
            })?
            .clone();
        Ok(ModelOutput {
            params: ParameterSet::new(),
            output,
        })
    }

    fn forward_model(&mut self) -> Result<ModelOutput, IcmError> {
        let views = &mut self.views;
        Ok(self
            .forward
            .get_or_try_build(|| {
                let outs = views
                    .iter_mut()
                    .map(|icm| icm.forward_model())
                    .collect::<Result<Vec<_>, _>>()?;
                let parts: Vec<&Tensor> = outs.iter().map(|o| &o.output).collect();
                let output = Tensor::cat(&parts, 1)?;
                let params = disjoint(outs.iter().map(|o| o.params.clone()))?;
                Ok::<_, IcmError>(ModelOutput { params, output })
            })?
            .clone())
    }

    /// Always the `[INVALID_LOSS]` sentinel.
    fn inverse_loss(&mut self, _mode: LossMode) -> Result<Tensor, IcmError> {
        invalid_loss(self.device())
    }

    fn forward_loss(&mut self, mode: LossMode) -> Result<Tensor, IcmError> {
        require_discrete("independent committee forward loss", mode)?;
        let views = &mut self.views;
        Ok(self
            .forward_loss
            .get_or_try_build(|| {
                let losses = views
                    .iter_mut()
                    .map(|icm| icm.forward_loss(LossMode::Discrete))
                    .collect::<Result<Vec<_>, _>>()?;
                add_n(&losses)
            })?
            .clone())
    }
}
