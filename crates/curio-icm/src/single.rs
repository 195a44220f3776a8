//! ICM-Single: one feature extractor with inverse and forward heads.
//!
//! Constructing an [`IntrinsicCuriosityModule`] runs the extractor over the
//! current and next observations straight away; every head depends on those
//! features.  Heads are built on first request and memoised.
//!
//! # Parameter scopes
//!
//! Inside the store scope the module was built under:
//!
//! | scope | contents |
//! |---|---|
//! | `vision_rev{n}` | feature extractor |
//! | `inverse_model` | inverse head, `imhidden + [A]` |
//! | `forward_model` | per-view forward head, `fwhidden + [featnum]` |
//! | `joint_forward_model` | joint forward head, `fwhidden + [view * featnum]` |
//!
//! # Example
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use curio_icm::{CuriosityModel, IntrinsicCuriosityModule, Observations};
//! use curio_types::{ConvLayer, IcmConfig, LossMode, VisionConfig};
//! use curio_vision::ParamStore;
//!
//! let dev = Device::Cpu;
//! let frame = |c| Tensor::rand(0f32, 1f32, (2, 1, 8, 8, c), &dev).unwrap();
//! let action = Tensor::new(&[[[1f32, 0.0, 0.0]], [[0.0, 0.0, 1.0]]], &dev).unwrap();
//! let obs = Observations::new(action, frame(3), frame(1), frame(3), frame(1)).unwrap();
//!
//! let config = IcmConfig {
//!     featnum: 8,
//!     ferev: 5,
//!     fehidden: vec![],
//!     imhidden: vec![16],
//!     fwhidden: vec![16],
//!     vision: VisionConfig { image_size: 8, conv_layers: vec![ConvLayer::new(4, 3, 2)] },
//!     ..IcmConfig::default()
//! };
//! let store = ParamStore::new(dev.clone());
//! let mut icm = IntrinsicCuriosityModule::new(obs, &config, None, &store.pp("icm")).unwrap();
//!
//! let inverse = icm.inverse_model().unwrap();
//! assert_eq!(inverse.output.dims(), &[2, 1, 3]);
//! let loss = icm.inverse_loss(LossMode::Discrete).unwrap();
//! assert_eq!(loss.dims(), &[] as &[usize]);
//! ```

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use curio_checkpoint::CheckpointStore;
use curio_types::{ConfigError, ForwardSpec, IcmConfig, LossMode, PermutationMatrices};
use curio_vision::{
    ExtractorSpec, FeatureExtractor, FeedForward, FeedForwardConfig, ParamStore, ParameterSet,
    build_extractor,
};
use tracing::{debug, instrument, warn};

use crate::model::{
    CuriosityModel, ModelOutput, half_squared_error, l2_norm, require_discrete,
    softmax_cross_entropy,
};
use crate::{IcmError, Observations, PermutationVoting, Saver, Stage};

pub const INVERSE_SCOPE: &str = "inverse_model";
pub const FORWARD_SCOPE: &str = "forward_model";
pub const JOINT_FORWARD_SCOPE: &str = "joint_forward_model";

// ────────────────────────────────────────────────────────────────────────────
// FeatureGraph
// ────────────────────────────────────────────────────────────────────────────

/// Everything the heads are built from, fixed at construction.
struct FeatureGraph {
    obs: Observations,
    config: IcmConfig,
    store: ParamStore,
    voting: PermutationVoting,
    cur_featvec: Tensor,
    next_featvec: Tensor,
    cur_mvfeatvec: Tensor,
}

impl FeatureGraph {
    fn action_space_dimension(&self) -> usize {
        self.obs.action_space_dimension()
    }

    fn build_inverse(&self) -> Result<ModelOutput, IcmError> {
        let input = Tensor::cat(&[&self.cur_featvec, &self.next_featvec], 2)?;
        let widths = self
            .config
            .imhidden
            .iter()
            .copied()
            .chain(Some(self.action_space_dimension()))
            .collect();
        let head = FeedForward::new(
            input.dim(2)?,
            FeedForwardConfig::new(widths, self.config.activation),
            &self.store.pp(INVERSE_SCOPE),
        )?;
        let local = head.infer(&input)?;
        let output = self.voting.vote(&local)?;
        debug!(input = ?input.dims(), local = ?local.dims(), voted = ?output.dims(), "built inverse model");
        Ok(ModelOutput {
            params: head.params().clone(),
            output,
        })
    }

    fn build_forward(&self, spec: ForwardSpec) -> Result<ModelOutput, IcmError> {
        let (b, v, n) = self.cur_featvec.dims3()?;
        let (features, action, scope) = if spec.joint {
            (
                self.cur_featvec.reshape((b, 1, v * n))?,
                self.obs.action.clone(),
                JOINT_FORWARD_SCOPE,
            )
        } else {
            (
                self.cur_featvec.clone(),
                self.voting.local_action(&self.obs.action)?,
                FORWARD_SCOPE,
            )
        };
        let out_width = spec.output_width.unwrap_or(features.dim(2)?);
        let widths = self
            .config
            .fwhidden
            .iter()
            .copied()
            .chain(Some(out_width))
            .collect();
        let input = Tensor::cat(&[&action, &features], 2)?;
        let head = FeedForward::new(
            input.dim(2)?,
            FeedForwardConfig::new(widths, self.config.activation).linear_final(true),
            &self.store.pp(scope),
        )?;
        let mut output = head.infer(&input)?;
        if spec.joint && spec.output_width.is_none() {
            output = output.reshape((b, v, n))?;
        }
        debug!(?spec, input = ?input.dims(), output = ?output.dims(), "built forward model");
        Ok(ModelOutput {
            params: head.params().clone(),
            output,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// IntrinsicCuriosityModule
// ────────────────────────────────────────────────────────────────────────────

/// A single intrinsic curiosity module over one (possibly multi-view)
/// observation batch.
pub struct IntrinsicCuriosityModule {
    graph: FeatureGraph,
    extractor: Box<dyn FeatureExtractor>,
    inverse: Stage<ModelOutput>,
    forward: Stage<(ForwardSpec, ModelOutput)>,
    pretrain_saver: Stage<Saver>,
}

impl IntrinsicCuriosityModule {
    /// Build the extractor selected by `config.ferev` under `store` and
    /// extract current and next features.
    ///
    /// `config`'s hidden-layer lists are used as given; resolve defaults with
    /// [`IcmConfig::resolve_hidden`] beforehand.
    #[instrument(skip_all, fields(scope = %store.prefix(), ferev = config.ferev))]
    pub fn new(
        obs: Observations,
        config: &IcmConfig,
        permutations: Option<&PermutationMatrices>,
        store: &ParamStore,
    ) -> Result<Self, IcmError> {
        config.validate()?;
        obs.validate()?;
        let spec = ExtractorSpec {
            view_num: obs.view_num(),
            featnum: config.featnum,
            activation: config.activation,
            fehidden: &config.fehidden,
            vision: &config.vision,
            multiview: &config.multiview,
            batch_normalization: config.batch_normalization,
            batch_norm_training: config.batch_norm_training,
        };
        let extractor = build_extractor(config.revision()?, &spec, store)?;
        Self::with_extractor(obs, config, extractor, permutations, store)
    }

    /// Same as [`new`][Self::new] with a caller-supplied extractor.
    pub fn with_extractor(
        obs: Observations,
        config: &IcmConfig,
        extractor: Box<dyn FeatureExtractor>,
        permutations: Option<&PermutationMatrices>,
        store: &ParamStore,
    ) -> Result<Self, IcmError> {
        config.validate()?;
        obs.validate()?;
        let (b, v) = (obs.batch(), obs.view_num());
        let voting =
            PermutationVoting::new(v, permutations, obs.action_space_dimension(), store.device())?;

        let cur_featvec = extractor.infer(&obs.rgb, &obs.depth)?;
        let next_featvec = extractor.infer(&obs.next_rgb, &obs.next_depth)?;
        let expected = [b, v, config.featnum];
        for t in [&cur_featvec, &next_featvec] {
            if t.dims() != expected {
                return Err(IcmError::ShapeMismatch(format!(
                    "{} produced {:?}, expected {expected:?}",
                    extractor.name(),
                    t.dims()
                )));
            }
        }
        let cur_mvfeatvec = cur_featvec.reshape((b, 1, v * config.featnum))?;
        debug!(features = ?cur_featvec.dims(), multiview = ?cur_mvfeatvec.dims(), "extracted features");
        if extractor.backbone_params().is_none() {
            warn!(
                extractor = extractor.name(),
                "feature extractor does not expose backbone parameters; ferev 11 or 12 does"
            );
        }

        Ok(Self {
            graph: FeatureGraph {
                obs,
                config: config.clone(),
                store: store.clone(),
                voting,
                cur_featvec,
                next_featvec,
                cur_mvfeatvec,
            },
            extractor,
            inverse: Stage::Uninitialized,
            forward: Stage::Uninitialized,
            pretrain_saver: Stage::Uninitialized,
        })
    }

    pub fn observations(&self) -> &Observations {
        &self.graph.obs
    }

    pub fn config(&self) -> &IcmConfig {
        &self.graph.config
    }

    pub fn store(&self) -> &ParamStore {
        &self.graph.store
    }

    pub fn voting(&self) -> &PermutationVoting {
        &self.graph.voting
    }

    /// `[batch, view, featnum]`.
    pub fn cur_features(&self) -> &Tensor {
        &self.graph.cur_featvec
    }

    /// `[batch, view, featnum]`.
    pub fn next_features(&self) -> &Tensor {
        &self.graph.next_featvec
    }

    /// `[batch, 1, view * featnum]`.
    pub fn multiview_features(&self) -> &Tensor {
        &self.graph.cur_mvfeatvec
    }

    pub fn extractor_params(&self) -> &ParameterSet {
        self.extractor.params()
    }

    pub fn backbone_params(&self) -> Option<&ParameterSet> {
        self.extractor.backbone_params()
    }

    /// Forward model in an explicit mode.
    ///
    /// Only one mode can be built per instance; asking for another one
    /// afterwards fails with [`IcmError::ForwardModeMismatch`].
    pub fn forward_model_with(&mut self, spec: ForwardSpec) -> Result<ModelOutput, IcmError> {
        if spec.output_width == Some(0) {
            return Err(ConfigError::InvalidWidth("forward.output_width".into()).into());
        }
        if let Some((built, _)) = self.forward.get() {
            if *built != spec {
                return Err(IcmError::ForwardModeMismatch {
                    built: *built,
                    requested: spec,
                });
            }
        }
        let graph = &self.graph;
        let (_, out) = self
            .forward
            .get_or_try_build(|| Ok::<_, IcmError>((spec, graph.build_forward(spec)?)))?;
        Ok(out.clone())
    }

    /// The forward head in whichever mode it was built, or the configured
    /// mode when nothing is built yet.
    fn current_forward(&mut self) -> Result<ModelOutput, IcmError> {
        match self.forward.get() {
            Some((_, out)) => Ok(out.clone()),
            None => self.forward_model(),
        }
    }

    /// Extractor, inverse head and forward head parameters, building the
    /// heads if needed.
    pub fn all_params(&mut self) -> Result<ParameterSet, IcmError> {
        let inverse = self.inverse_model()?;
        let forward = self.current_forward()?;
        Ok(ParameterSet::concat([
            self.extractor.params().clone(),
            inverse.params,
            forward.params,
        ]))
    }

    /// Saver over extractor and inverse-head parameters, reported as `view`.
    pub fn create_pretrain_saver(&mut self, view: usize) -> Result<&Saver, IcmError> {
        let inverse = self.inverse_model()?;
        let extractor = self.extractor.params().clone();
        let store = &self.graph.store;
        self.pretrain_saver.get_or_try_build(|| {
            let params = ParameterSet::disjoint_concat([extractor, inverse.params])?;
            Ok::<_, IcmError>(Saver::new(view, store, params))
        })
    }

    /// Restore extractor and inverse head from the latest checkpoint in
    /// `dir`.  `Ok(false)` when there is none.
    pub fn load_pretrain(
        &mut self,
        store: &dyn CheckpointStore,
        dir: &Path,
        view: usize,
    ) -> Result<bool, IcmError> {
        let saver = self.create_pretrain_saver(view)?;
        debug!(
            view,
            dir = %dir.display(),
            params = ?saver.params().names().collect::<Vec<_>>(),
            "loading pretrained parameters"
        );
        saver.restore(store, dir)
    }

    /// Write extractor and inverse head as step `step` of `dir`.
    pub fn save_pretrain(
        &mut self,
        store: &dyn CheckpointStore,
        dir: &Path,
        prefix: &str,
        step: u64,
    ) -> Result<PathBuf, IcmError> {
        let view = self.pretrain_saver.get().map_or(0, Saver::view);
        self.create_pretrain_saver(view)?
            .save(store, dir, prefix, step)
    }

    /// Policy/value style head over the flattened multi-view feature
    /// `[batch, 1, view * featnum]`, with variables under `name`.
    pub fn create_head_from_feature(
        &self,
        name: &str,
        head: FeedForwardConfig,
    ) -> Result<ModelOutput, IcmError> {
        let input = &self.graph.cur_mvfeatvec;
        let net = FeedForward::new(input.dim(2)?, head, &self.graph.store.pp(name))?;
        Ok(ModelOutput {
            output: net.infer(input)?,
            params: net.params().clone(),
        })
    }
}

impl CuriosityModel for IntrinsicCuriosityModule {
    fn view_num(&self) -> usize {
        self.graph.obs.view_num()
    }

    fn action_space_dimension(&self) -> usize {
        self.graph.action_space_dimension()
    }

    fn cur_featvec(&mut self) -> Result<Tensor, IcmError> {
        Ok(self.graph.cur_featvec.clone())
    }

    fn next_featvec(&mut self) -> Result<Tensor, IcmError> {
        Ok(self.graph.next_featvec.clone())
    }

    fn inverse_model(&mut self) -> Result<ModelOutput, IcmError> {
        let graph = &self.graph;
        Ok(self.inverse.get_or_try_build(|| graph.build_inverse())?.clone())
    }

    fn forward_model(&mut self) -> Result<ModelOutput, IcmError> {
        let spec = self.graph.config.forward;
        self.forward_model_with(spec)
    }

    fn inverse_loss(&mut self, mode: LossMode) -> Result<Tensor, IcmError> {
        let out = self.inverse_model()?.output;
        let action = &self.graph.obs.action;
        match mode {
            LossMode::Continuous => l2_norm(&out, action),
            LossMode::Discrete => {
                softmax_cross_entropy(&out, action, self.graph.action_space_dimension())
            }
        }
    }

    fn forward_loss(&mut self, mode: LossMode) -> Result<Tensor, IcmError> {
        require_discrete("forward loss", mode)?;
        let pred = self.current_forward()?.output;
        half_squared_error(&pred, &self.graph.next_featvec)
    }
}
