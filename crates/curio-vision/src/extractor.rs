//! Feature extraction from multi-view RGB-D observations.
//!
//! Observations arrive as two 5-D tensors, `rgb: [batch, view, width, height,
//! 3]` and `depth: [batch, view, width, height, 1]`.  An extractor turns them
//! into one latent vector per view, `[batch, view, featnum]`.
//!
//! [`ConvExtractor`] covers every [`ExtractorRevision`]; revisions differ in
//! how convolution weights are shared across views, whether convolutions are
//! dilated or residual, and the shape of the fully-connected tail:
//!
//! | revision | towers | conv | FC tail |
//! |---|---|---|---|
//! | 1 | shared | plain | `[f]` |
//! | 2 | shared | plain | `[2f, f]` |
//! | 3 | one per view | plain | `[2f, f]` |
//! | 4 | shared, then one per view | plain | `[2f, f]` |
//! | 5, 9, 10 | shared | plain | `fehidden + [f]` |
//! | 6, 7, 8 | shared | dilated ×2 | `fehidden + [f]` |
//! | 11, 13 | shared | residual | `fehidden + [f]` |
//! | 12 | shared | residual, gradient stopped at backbone | `fehidden + [f]` |

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig};
use curio_types::{Activation, ConfigError, ConvLayer, ExtractorRevision, VisionConfig};
use tracing::{debug, instrument};

use crate::VisionError;
use crate::feed_forward::{FeedForward, FeedForwardConfig, apply_activation};
use crate::params::{ParamStore, ParameterSet};

/// RGB (3) + depth (1).
pub const RGBD_CHANNELS: usize = 4;

// ────────────────────────────────────────────────────────────────────────────
// Capability
// ────────────────────────────────────────────────────────────────────────────

/// Maps an RGB-D observation batch to per-view latent features.
pub trait FeatureExtractor {
    /// Scope name of the extractor's parameters.
    fn name(&self) -> &str;

    /// `(rgb, depth)` → `[batch, view, featnum]`.
    fn infer(&self, rgb: &Tensor, depth: &Tensor) -> Result<Tensor, VisionError>;

    /// Every trainable parameter of the extractor.
    fn params(&self) -> &ParameterSet;

    /// Parameters of the convolutional backbone alone, for topologies that
    /// expose it separately from the FC tail.
    fn backbone_params(&self) -> Option<&ParameterSet> {
        None
    }
}

/// Inputs shared by all revisions.
#[derive(Debug, Clone, Copy)]
pub struct ExtractorSpec<'a> {
    pub view_num: usize,
    pub featnum: usize,
    pub activation: Activation,
    pub fehidden: &'a [usize],
    pub vision: &'a VisionConfig,
    pub multiview: &'a VisionConfig,
    pub batch_normalization: bool,
    /// Normalise with batch statistics rather than running averages.
    pub batch_norm_training: bool,
}

/// Build the extractor for `revision` under `store.pp(revision.scope_name())`.
pub fn build_extractor(
    revision: ExtractorRevision,
    spec: &ExtractorSpec<'_>,
    store: &ParamStore,
) -> Result<Box<dyn FeatureExtractor>, VisionError> {
    Ok(Box::new(ConvExtractor::new(
        revision,
        spec,
        &store.pp(revision.scope_name()),
    )?))
}

// ────────────────────────────────────────────────────────────────────────────
// Topology
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sharing {
    Shared,
    PerView,
    SharedThenPerView,
}

#[derive(Debug, Clone, Copy)]
struct Topology {
    sharing: Sharing,
    dilation: usize,
    residual: bool,
    stop_gradient: bool,
}

fn topology(revision: ExtractorRevision) -> Topology {
    use ExtractorRevision::*;
    let plain = Topology {
        sharing: Sharing::Shared,
        dilation: 1,
        residual: false,
        stop_gradient: false,
    };
    match revision {
        Rev1 | Rev2 | Rev5 | Rev9 | Rev10 => plain,
        Rev3 => Topology {
            sharing: Sharing::PerView,
            ..plain
        },
        Rev4 => Topology {
            sharing: Sharing::SharedThenPerView,
            ..plain
        },
        Rev6 | Rev7 | Rev8 => Topology {
            dilation: 2,
            ..plain
        },
        Rev11 | Rev13 => Topology {
            residual: true,
            ..plain
        },
        Rev12 => Topology {
            residual: true,
            stop_gradient: true,
            ..plain
        },
    }
}

fn conv_output_size(in_size: usize, layer: &ConvLayer, dilation: usize) -> usize {
    let pad = dilation * (layer.kernel / 2);
    (in_size + 2 * pad - dilation * (layer.kernel - 1) - 1) / layer.stride + 1
}

// ────────────────────────────────────────────────────────────────────────────
// ConvTower
// ────────────────────────────────────────────────────────────────────────────

struct ConvBlock {
    conv: Conv2d,
    residual: bool,
}

/// Sequence of 2-D convolutions over `[n, channels, size, size]` frames.
struct ConvTower {
    blocks: Vec<ConvBlock>,
    activation: Activation,
    out_channels: usize,
    out_size: usize,
}

impl ConvTower {
    fn new(
        in_channels: usize,
        in_size: usize,
        layers: &[ConvLayer],
        topo: Topology,
        activation: Activation,
        store: &ParamStore,
    ) -> Result<Self, VisionError> {
        let vb = store.var_builder();
        let mut blocks = Vec::with_capacity(layers.len());
        let (mut channels, mut size) = (in_channels, in_size);
        for (i, layer) in layers.iter().enumerate() {
            let cfg = Conv2dConfig {
                padding: topo.dilation * (layer.kernel / 2),
                stride: layer.stride,
                dilation: topo.dilation,
                ..Default::default()
            };
            let conv = candle_nn::conv2d(
                channels,
                layer.filters,
                layer.kernel,
                cfg,
                vb.pp(format!("conv{i}")),
            )?;
            let next_size = conv_output_size(size, layer, topo.dilation);
            blocks.push(ConvBlock {
                conv,
                residual: topo.residual && channels == layer.filters && next_size == size,
            });
            channels = layer.filters;
            size = next_size;
        }
        Ok(Self {
            blocks,
            activation,
            out_channels: channels,
            out_size: size,
        })
    }

    fn flat_width(&self) -> usize {
        self.out_channels * self.out_size * self.out_size
    }

    fn forward(&self, frames: &Tensor) -> Result<Tensor, VisionError> {
        let mut h = frames.clone();
        for block in &self.blocks {
            let y = apply_activation(&block.conv.forward(&h)?, self.activation)?;
            h = if block.residual { (y + &h)? } else { y };
        }
        Ok(h)
    }
}

enum Towers {
    Shared(ConvTower),
    PerView(Vec<ConvTower>),
    SharedThenPerView {
        shared: ConvTower,
        per_view: Vec<ConvTower>,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// ConvExtractor
// ────────────────────────────────────────────────────────────────────────────

/// Conv-tower + FC-tail extractor realising one [`ExtractorRevision`].
pub struct ConvExtractor {
    name: String,
    revision: ExtractorRevision,
    view_num: usize,
    image_size: usize,
    towers: Towers,
    fc: FeedForward,
    stop_gradient: bool,
    params: ParameterSet,
    backbone: Option<ParameterSet>,
}

impl ConvExtractor {
    /// Build the extractor with variables directly under `store`'s scope.
    #[instrument(skip_all, fields(revision = revision.code(), scope = %store.prefix()))]
    pub fn new(
        revision: ExtractorRevision,
        spec: &ExtractorSpec<'_>,
        store: &ParamStore,
    ) -> Result<Self, VisionError> {
        if spec.view_num == 0 {
            return Err(VisionError::Shape("an extractor needs at least one view".into()));
        }
        if spec.featnum == 0 {
            return Err(ConfigError::InvalidWidth("featnum".into()).into());
        }
        spec.vision.validate()?;
        let topo = topology(revision);
        let size = spec.vision.image_size;
        let layers = &spec.vision.conv_layers;
        let act = spec.activation;

        let (towers, flat_width, tower_scopes) = match topo.sharing {
            Sharing::Shared => {
                let t = ConvTower::new(RGBD_CHANNELS, size, layers, topo, act, &store.pp("tower"))?;
                let w = t.flat_width();
                (Towers::Shared(t), w, vec![store.pp("tower")])
            }
            Sharing::PerView => {
                let scopes: Vec<ParamStore> = (0..spec.view_num)
                    .map(|v| store.pp(format!("tower_view{v}")))
                    .collect();
                let towers = scopes
                    .iter()
                    .map(|s| ConvTower::new(RGBD_CHANNELS, size, layers, topo, act, s))
                    .collect::<Result<Vec<_>, _>>()?;
                let w = towers[0].flat_width();
                (Towers::PerView(towers), w, scopes)
            }
            Sharing::SharedThenPerView => {
                spec.multiview.validate()?;
                let shared =
                    ConvTower::new(RGBD_CHANNELS, size, layers, topo, act, &store.pp("shared"))?;
                let mut scopes = vec![store.pp("shared")];
                let mut per_view = Vec::with_capacity(spec.view_num);
                for v in 0..spec.view_num {
                    let s = store.pp(format!("tower_view{v}"));
                    per_view.push(ConvTower::new(
                        shared.out_channels,
                        shared.out_size,
                        &spec.multiview.conv_layers,
                        topo,
                        act,
                        &s,
                    )?);
                    scopes.push(s);
                }
                let w = per_view[0].flat_width();
                (Towers::SharedThenPerView { shared, per_view }, w, scopes)
            }
        };

        let fc_norm = spec.batch_normalization && topo.residual;
        let fc = FeedForward::new(
            flat_width,
            FeedForwardConfig::new(revision.fc_widths(spec.featnum, spec.fehidden), act)
                .batch_norm(fc_norm)
                .batch_norm_training(spec.batch_norm_training),
            &store.pp("fc"),
        )?;

        let backbone = topo.residual.then(|| {
            tower_scopes
                .iter()
                .fold(ParameterSet::new(), |acc, s| acc.union(&s.collect()))
        });
        let params = store.collect();
        debug!(flat_width, params = params.len(), "built feature extractor");

        Ok(Self {
            name: store.prefix(),
            revision,
            view_num: spec.view_num,
            image_size: size,
            towers,
            fc,
            stop_gradient: topo.stop_gradient,
            params,
            backbone,
        })
    }

    pub fn revision(&self) -> ExtractorRevision {
        self.revision
    }

    fn check_inputs(&self, rgb: &Tensor, depth: &Tensor) -> Result<(usize, usize), VisionError> {
        let (b, v, w, h, c) = rgb.dims5()?;
        if c != 3 {
            return Err(VisionError::Shape(format!("rgb must have 3 channels, got {c}")));
        }
        if depth.dims() != [b, v, w, h, 1] {
            return Err(VisionError::Shape(format!(
                "depth {:?} does not pair with rgb {:?}",
                depth.dims(),
                rgb.dims()
            )));
        }
        if v != self.view_num {
            return Err(VisionError::Shape(format!(
                "extractor was built for {} views, got {v}",
                self.view_num
            )));
        }
        if w != self.image_size || h != self.image_size {
            return Err(VisionError::Shape(format!(
                "expected {0}x{0} images, got {w}x{h}",
                self.image_size
            )));
        }
        Ok((b, v))
    }
}

/// `[batch, view, w, h, c]` → `[batch * view, c, w, h]`.
fn to_frames(x: &Tensor) -> Result<Tensor, VisionError> {
    let (b, v, w, h, c) = x.dims5()?;
    Ok(x.reshape((b * v, w, h, c))?.permute((0, 3, 1, 2))?.contiguous()?)
}

fn per_view_features(
    towers: &[ConvTower],
    frames_by_view: &Tensor,
) -> Result<Tensor, VisionError> {
    // frames_by_view: [batch, view, c, w, h]
    let feats = towers
        .iter()
        .enumerate()
        .map(|(v, tower)| {
            let frames = frames_by_view.narrow(1, v, 1)?.squeeze(1)?.contiguous()?;
            Ok(tower.forward(&frames)?.flatten_from(1)?)
        })
        .collect::<Result<Vec<_>, VisionError>>()?;
    Ok(Tensor::stack(&feats, 1)?)
}

impl FeatureExtractor for ConvExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn infer(&self, rgb: &Tensor, depth: &Tensor) -> Result<Tensor, VisionError> {
        let (b, v) = self.check_inputs(rgb, depth)?;
        let rgbd = Tensor::cat(&[rgb, depth], 4)?;
        let frames = to_frames(&rgbd)?;
        let features = match &self.towers {
            Towers::Shared(tower) => {
                let flat = tower.forward(&frames)?.flatten_from(1)?;
                let width = flat.dim(1)?;
                flat.reshape((b, v, width))?
            }
            Towers::PerView(towers) => {
                let (_, c, w, h) = frames.dims4()?;
                per_view_features(towers, &frames.reshape((b, v, c, w, h))?)?
            }
            Towers::SharedThenPerView { shared, per_view } => {
                let out = shared.forward(&frames)?;
                let (_, c, w, h) = out.dims4()?;
                per_view_features(per_view, &out.reshape((b, v, c, w, h))?)?
            }
        };
        let features = if self.stop_gradient {
            features.detach()
        } else {
            features
        };
        self.fc.infer(&features)
    }

    fn params(&self) -> &ParameterSet {
        &self.params
    }

    fn backbone_params(&self) -> Option<&ParameterSet> {
        self.backbone.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tiny_vision() -> VisionConfig {
        VisionConfig {
            image_size: 4,
            conv_layers: vec![ConvLayer::new(2, 3, 2)],
        }
    }

    fn tiny_multiview() -> VisionConfig {
        VisionConfig {
            image_size: 2,
            conv_layers: vec![ConvLayer::new(2, 3, 1)],
        }
    }

    fn observation(b: usize, v: usize, size: usize) -> (Tensor, Tensor) {
        let rgb = Tensor::rand(0f32, 1f32, (b, v, size, size, 3), &Device::Cpu).unwrap();
        let depth = Tensor::rand(0f32, 1f32, (b, v, size, size, 1), &Device::Cpu).unwrap();
        (rgb, depth)
    }

    fn build(rev: ExtractorRevision, views: usize, store: &ParamStore) -> Box<dyn FeatureExtractor> {
        let vision = tiny_vision();
        let multiview = tiny_multiview();
        let spec = ExtractorSpec {
            view_num: views,
            featnum: 3,
            activation: Activation::Elu,
            fehidden: &[5],
            vision: &vision,
            multiview: &multiview,
            batch_normalization: true,
            batch_norm_training: false,
        };
        build_extractor(rev, &spec, store).unwrap()
    }

    #[test]
    fn every_revision_produces_per_view_features() {
        for rev in ExtractorRevision::ALL {
            let store = ParamStore::new(Device::Cpu);
            let fe = build(rev, 2, &store);
            let (rgb, depth) = observation(3, 2, 4);
            let out = fe.infer(&rgb, &depth).unwrap();
            assert_eq!(out.dims(), &[3, 2, 3], "{rev}");
            assert_eq!(fe.name(), rev.scope_name());
            assert!(fe.params().names().all(|n| n.starts_with(&rev.scope_name())));
        }
    }

    #[test]
    fn output_size_matches_conv_arithmetic() {
        let layer = ConvLayer::new(1, 3, 2);
        assert_eq!(conv_output_size(4, &layer, 1), 2);
        assert_eq!(conv_output_size(4, &layer, 2), 2);
        assert_eq!(conv_output_size(7, &ConvLayer::new(1, 7, 2), 1), 4);
        assert_eq!(conv_output_size(5, &ConvLayer::new(1, 3, 1), 1), 5);
    }

    #[test]
    fn per_view_revision_keeps_one_tower_per_view() {
        let store = ParamStore::new(Device::Cpu);
        let fe = build(ExtractorRevision::Rev3, 2, &store);
        let names: Vec<&str> = fe.params().names().collect();
        assert!(names.iter().any(|n| n.contains("tower_view0")));
        assert!(names.iter().any(|n| n.contains("tower_view1")));
    }

    #[test]
    fn stacked_revision_has_shared_and_per_view_towers() {
        let store = ParamStore::new(Device::Cpu);
        let fe = build(ExtractorRevision::Rev4, 2, &store);
        let names: Vec<&str> = fe.params().names().collect();
        assert!(names.iter().any(|n| n.contains(".shared.")));
        assert!(names.iter().any(|n| n.contains("tower_view1")));
    }

    #[test]
    fn only_residual_revisions_expose_backbone() {
        let store = ParamStore::new(Device::Cpu);
        assert!(build(ExtractorRevision::Rev5, 1, &store).backbone_params().is_none());
        let fe = build(ExtractorRevision::Rev11, 1, &store);
        let backbone = fe.backbone_params().unwrap();
        assert!(!backbone.is_empty());
        assert!(backbone.names().all(|n| n.contains(".tower.")));
    }

    #[test]
    fn wrong_resolution_is_rejected() {
        let store = ParamStore::new(Device::Cpu);
        let fe = build(ExtractorRevision::Rev1, 1, &store);
        let (rgb, depth) = observation(1, 1, 8);
        assert!(matches!(fe.infer(&rgb, &depth), Err(VisionError::Shape(_))));
    }

    #[test]
    fn mismatched_depth_is_rejected() {
        let store = ParamStore::new(Device::Cpu);
        let fe = build(ExtractorRevision::Rev1, 1, &store);
        let (rgb, _) = observation(1, 1, 4);
        let depth = Tensor::zeros((1, 1, 4, 4, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(fe.infer(&rgb, &depth), Err(VisionError::Shape(_))));
    }

    #[test]
    fn extractor_is_deterministic_for_identical_inputs() {
        let store = ParamStore::new(Device::Cpu);
        let fe = build(ExtractorRevision::Rev2, 2, &store);
        let (rgb, depth) = observation(2, 2, 4);
        let a = fe.infer(&rgb, &depth).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = fe.infer(&rgb, &depth).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
