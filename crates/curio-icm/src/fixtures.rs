//! Tiny models and batches shared by the unit tests.

use candle_core::{Device, Tensor};
use curio_types::{Activation, ConvLayer, IcmConfig, PermutationMatrices, VisionConfig};
use curio_vision::ParamStore;

use crate::Observations;

pub const ACTIONS: usize = 4;
pub const IMAGE: usize = 4;

pub fn config() -> IcmConfig {
    IcmConfig {
        featnum: 4,
        activation: Activation::Relu,
        ferev: 5,
        fehidden: vec![],
        imhidden: vec![6],
        fwhidden: vec![5],
        vision: VisionConfig {
            image_size: IMAGE,
            conv_layers: vec![ConvLayer::new(2, 3, 2)],
        },
        ..IcmConfig::default()
    }
}

pub fn store() -> ParamStore {
    ParamStore::new(Device::Cpu)
}

/// Random RGB-D batch whose sample `i` took action `actions[i % len]`.
pub fn observations(batch: usize, views: usize, actions: &[usize]) -> Observations {
    let dev = Device::Cpu;
    let frame = |c: usize| Tensor::rand(0f32, 1f32, (batch, views, IMAGE, IMAGE, c), &dev).unwrap();
    let mut one_hot = vec![0f32; batch * ACTIONS];
    for i in 0..batch {
        one_hot[i * ACTIONS + actions[i % actions.len()]] = 1.0;
    }
    let action = Tensor::from_vec(one_hot, (batch, 1, ACTIONS), &dev).unwrap();
    Observations::new(action, frame(3), frame(1), frame(3), frame(1)).unwrap()
}

/// View `v` sees world action `(i + v) mod ACTIONS` as local action `i`.
pub fn quarter_turns(views: usize) -> PermutationMatrices {
    let maps: Vec<Vec<usize>> = (0..views)
        .map(|v| (0..ACTIONS).map(|i| (i + v) % ACTIONS).collect())
        .collect();
    PermutationMatrices::from_index_maps(&maps).unwrap()
}

/// Current values of every variable in `store`, keyed by name.
pub fn values(store: &ParamStore) -> Vec<(String, Vec<f32>)> {
    store
        .collect()
        .iter()
        .map(|(n, v)| {
            (
                n.to_string(),
                v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            )
        })
        .collect()
}
