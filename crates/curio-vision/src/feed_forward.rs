//! Dense prediction heads.
//!
//! A [`FeedForward`] maps `[.., in]` to `[.., out]` through a stack of linear
//! layers.  Leading axes are treated as batch axes, so a `[batch, view, in]`
//! feature tensor is transformed view by view with shared weights.
//!
//! Layers are named `fc0`, `fc1`, … inside the store's scope; batch
//! normalisation adds `bn0`, `bn1`, … holding `weight`/`bias` and the
//! `running_mean`/`running_var` averages, which are checkpointed with the
//! head but receive no gradient.

use candle_core::{D, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Init, Linear};
use curio_types::{Activation, ConfigError};
use tracing::debug;

use crate::VisionError;
use crate::params::{ParamStore, ParameterSet};

const BATCH_NORM_EPSILON: f64 = 1e-5;

/// Shape and options of a [`FeedForward`] stack.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Output width of every layer; the last entry is the head's output.
    pub widths: Vec<usize>,
    pub activation: Activation,
    /// Initialise weights and biases to zero.
    pub zero_init: bool,
    /// Skip the activation after the last layer.
    pub linear_final: bool,
    /// Normalise each hidden layer's pre-activation over the batch.
    pub batch_norm: bool,
    /// Use and update batch statistics instead of the running averages.
    pub batch_norm_training: bool,
}

impl FeedForwardConfig {
    pub fn new(widths: Vec<usize>, activation: Activation) -> Self {
        Self {
            widths,
            activation,
            zero_init: false,
            linear_final: false,
            batch_norm: false,
            batch_norm_training: false,
        }
    }

    pub fn zero_init(mut self, yes: bool) -> Self {
        self.zero_init = yes;
        self
    }

    pub fn linear_final(mut self, yes: bool) -> Self {
        self.linear_final = yes;
        self
    }

    pub fn batch_norm(mut self, yes: bool) -> Self {
        self.batch_norm = yes;
        self
    }

    pub fn batch_norm_training(mut self, yes: bool) -> Self {
        self.batch_norm_training = yes;
        self
    }
}

/// Normalise `[.., width]` over every leading row.
fn normalize(norm: &BatchNorm, x: &Tensor, train: bool) -> Result<Tensor, VisionError> {
    let dims = x.dims().to_vec();
    let width = x.dim(D::Minus1)?;
    let rows = x.elem_count() / width;
    let out = norm.forward_t(&x.reshape((rows, width))?, train)?;
    Ok(out.reshape(dims)?)
}

struct Layer {
    linear: Linear,
    norm: Option<BatchNorm>,
}

/// A configurable stack of dense layers with its own parameter set.
pub struct FeedForward {
    scope: String,
    layers: Vec<Layer>,
    activation: Activation,
    linear_final: bool,
    batch_norm_training: bool,
    params: ParameterSet,
}

impl FeedForward {
    /// Build the stack for inputs whose last axis is `in_dim`, creating (or
    /// reusing) variables under `store`'s scope.
    pub fn new(
        in_dim: usize,
        config: FeedForwardConfig,
        store: &ParamStore,
    ) -> Result<Self, VisionError> {
        if config.widths.is_empty() || config.widths.contains(&0) || in_dim == 0 {
            return Err(ConfigError::InvalidWidth(store.prefix()).into());
        }
        let vb = store.var_builder();
        let last = config.widths.len() - 1;
        let mut layers = Vec::with_capacity(config.widths.len());
        let mut fan_in = in_dim;
        for (i, &width) in config.widths.iter().enumerate() {
            let lvb = vb.pp(format!("fc{i}"));
            let linear = if config.zero_init {
                let w = lvb.get_with_hints((width, fan_in), "weight", Init::Const(0.0))?;
                let b = lvb.get_with_hints(width, "bias", Init::Const(0.0))?;
                Linear::new(w, Some(b))
            } else {
                candle_nn::linear(fan_in, width, lvb)?
            };
            let norm = if config.batch_norm && i != last {
                Some(candle_nn::batch_norm(
                    width,
                    BATCH_NORM_EPSILON,
                    vb.pp(format!("bn{i}")),
                )?)
            } else {
                None
            };
            layers.push(Layer { linear, norm });
            fan_in = width;
        }
        let params = store.collect();
        debug!(scope = %store.prefix(), widths = ?config.widths, params = params.len(), "built feed-forward head");
        Ok(Self {
            scope: store.prefix(),
            layers,
            activation: config.activation,
            linear_final: config.linear_final,
            batch_norm_training: config.batch_norm_training,
            params,
        })
    }

    /// Apply the stack to `x` (`[.., in_dim]`).
    pub fn infer(&self, x: &Tensor) -> Result<Tensor, VisionError> {
        let last = self.layers.len() - 1;
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.linear.forward(&h)?;
            if let Some(norm) = &layer.norm {
                h = normalize(norm, &h, self.batch_norm_training)?;
            }
            if i != last || !self.linear_final {
                h = apply_activation(&h, self.activation)?;
            }
        }
        Ok(h)
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

/// Element-wise non-linearity.
pub fn apply_activation(x: &Tensor, activation: Activation) -> Result<Tensor, VisionError> {
    Ok(match activation {
        Activation::Relu => x.relu()?,
        Activation::Elu => x.elu(1.0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn input(dims: (usize, usize, usize)) -> Tensor {
        Tensor::arange(0f32, (dims.0 * dims.1 * dims.2) as f32, &Device::Cpu)
            .unwrap()
            .reshape(dims)
            .unwrap()
            .affine(0.1, -0.5)
            .unwrap()
    }

    #[test]
    fn output_keeps_leading_axes() {
        let store = ParamStore::new(Device::Cpu);
        let ff = FeedForward::new(
            6,
            FeedForwardConfig::new(vec![5, 3], Activation::Relu),
            &store.pp("head"),
        )
        .unwrap();
        let out = ff.infer(&input((2, 4, 6))).unwrap();
        assert_eq!(out.dims(), &[2, 4, 3]);
        assert_eq!(ff.depth(), 2);
        // Two layers, weight + bias each.
        assert_eq!(ff.params().len(), 4);
        assert!(ff.params().names().all(|n| n.starts_with("head.")));
    }

    #[test]
    fn zero_init_with_linear_final_outputs_zeros() {
        let store = ParamStore::new(Device::Cpu);
        let ff = FeedForward::new(
            6,
            FeedForwardConfig::new(vec![3], Activation::Elu)
                .zero_init(true)
                .linear_final(true),
            &store.pp("zero"),
        )
        .unwrap();
        let out = ff.infer(&input((1, 2, 6))).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn linear_final_allows_negative_outputs() {
        let store = ParamStore::new(Device::Cpu);
        let vb = store.pp("neg").var_builder();
        // Force a negative bias so the last layer yields negatives.
        let _ = vb
            .pp("fc0")
            .get_with_hints(1, "bias", Init::Const(-3.0))
            .unwrap();
        let _ = vb
            .pp("fc0")
            .get_with_hints((1, 2), "weight", Init::Const(0.0))
            .unwrap();
        let x = Tensor::zeros((1, 1, 2), candle_core::DType::F32, &Device::Cpu).unwrap();

        let linear = FeedForward::new(
            2,
            FeedForwardConfig::new(vec![1], Activation::Relu).linear_final(true),
            &store.pp("neg"),
        )
        .unwrap();
        let out = linear.infer(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out, vec![-3.0]);

        let rectified = FeedForward::new(
            2,
            FeedForwardConfig::new(vec![1], Activation::Relu),
            &store.pp("neg"),
        )
        .unwrap();
        let out = rectified.infer(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out, vec![0.0]);
    }

    #[test]
    fn batch_norm_adds_scale_and_shift_for_hidden_layers() {
        let store = ParamStore::new(Device::Cpu);
        let ff = FeedForward::new(
            6,
            FeedForwardConfig::new(vec![4, 2], Activation::Relu).batch_norm(true),
            &store.pp("bn"),
        )
        .unwrap();
        let names: Vec<&str> = ff.params().names().collect();
        assert!(names.contains(&"bn.bn0.weight"));
        assert!(names.contains(&"bn.bn0.bias"));
        assert!(names.contains(&"bn.bn0.running_mean"));
        assert!(names.contains(&"bn.bn0.running_var"));
        assert!(!names.iter().any(|n| n.starts_with("bn.bn1")));
        let out = ff.infer(&input((3, 2, 6))).unwrap();
        assert_eq!(out.dims(), &[3, 2, 2]);
    }

    fn bn_head(store: &ParamStore, training: bool) -> FeedForward {
        FeedForward::new(
            3,
            FeedForwardConfig::new(vec![4, 2], Activation::Elu)
                .batch_norm(true)
                .batch_norm_training(training),
            &store.pp("bn"),
        )
        .unwrap()
    }

    fn row(values: [f32; 3]) -> Tensor {
        Tensor::new(&[[values]], &Device::Cpu).unwrap()
    }

    #[test]
    fn single_sample_inference_still_separates_inputs() {
        let store = ParamStore::new(Device::Cpu);
        let ff = bn_head(&store, false);
        let a = ff.infer(&row([1.0, 2.0, 3.0])).unwrap();
        let b = ff.infer(&row([-5.0, 9.0, 0.5])).unwrap();
        assert_eq!(a.dims(), &[1, 1, 2]);
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 1e-4);
    }

    #[test]
    fn training_mode_updates_running_statistics() {
        let store = ParamStore::new(Device::Cpu);
        let running_mean = |s: &ParamStore| {
            s.collect()
                .iter()
                .find(|(n, _)| *n == "bn.bn0.running_mean")
                .map(|(_, v)| v.as_tensor().to_vec1::<f32>().unwrap())
                .unwrap()
        };
        let before = running_mean(&store.pp("bn"));
        bn_head(&store, false).infer(&input((3, 2, 3))).unwrap();
        assert_eq!(running_mean(&store.pp("bn")), before);
        bn_head(&store, true).infer(&input((3, 2, 3))).unwrap();
        assert_ne!(running_mean(&store.pp("bn")), before);
    }

    #[test]
    fn empty_widths_are_rejected() {
        let store = ParamStore::new(Device::Cpu);
        let err = FeedForward::new(
            4,
            FeedForwardConfig::new(vec![], Activation::Relu),
            &store.pp("empty"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, VisionError::Config(ConfigError::InvalidWidth(_))));
    }
}
