//! Seeded synthetic transitions for pretraining without a simulator.
//!
//! Each sample picks a world-frame action uniformly at random.  Every view
//! sees a random RGB-D frame, and the next frame is the same image rolled
//! along its width by `local + 1` pixels, where `local` is the action as
//! that view's permutation maps it.  The inverse model can therefore only
//! recover the action by combining the per-view evidence through voting.

use candle_core::{Device, Tensor};
use curio_icm::{IcmError, Observations};
use curio_types::PermutationMatrices;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic generator of [`Observations`] batches.
pub struct SyntheticTransitions {
    rng: StdRng,
    batch: usize,
    image_size: usize,
    permutations: PermutationMatrices,
    device: Device,
}

impl SyntheticTransitions {
    pub fn new(
        seed: u64,
        batch: usize,
        image_size: usize,
        permutations: PermutationMatrices,
        device: Device,
    ) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            batch,
            image_size,
            permutations,
            device,
        }
    }

    pub fn views(&self) -> usize {
        self.permutations.view_num()
    }

    pub fn actions(&self) -> usize {
        self.permutations.dimension()
    }

    /// Next batch plus the world-frame action index of every sample.
    pub fn next_batch(&mut self) -> Result<(Observations, Vec<usize>), IcmError> {
        let (b, v, s, a) = (self.batch, self.views(), self.image_size, self.actions());
        let world: Vec<usize> = (0..b).map(|_| self.rng.gen_range(0..a)).collect();

        let mut one_hot = vec![0f32; b * a];
        for (i, &k) in world.iter().enumerate() {
            one_hot[i * a + k] = 1.0;
        }
        // shifts[i * v + view]
        let mut shifts = Vec::with_capacity(b * v);
        for &k in &world {
            let e = unit(a, k);
            for view in 0..v {
                shifts.push(argmax(&self.permutations.map_world(view, &e)?) + 1);
            }
        }

        let rgb = self.frames(3);
        let depth = self.frames(1);
        let next_rgb = roll_width(&rgb, &shifts, s, 3);
        let next_depth = roll_width(&depth, &shifts, s, 1);

        let dims = |c: usize| (b, v, s, s, c);
        let obs = Observations::new(
            Tensor::from_vec(one_hot, (b, 1, a), &self.device)?,
            Tensor::from_vec(rgb, dims(3), &self.device)?,
            Tensor::from_vec(depth, dims(1), &self.device)?,
            Tensor::from_vec(next_rgb, dims(3), &self.device)?,
            Tensor::from_vec(next_depth, dims(1), &self.device)?,
        )?;
        Ok((obs, world))
    }

    fn frames(&mut self, channels: usize) -> Vec<f32> {
        let n = self.batch * self.views() * self.image_size * self.image_size * channels;
        (0..n).map(|_| self.rng.r#gen::<f32>()).collect()
    }
}

fn unit(dim: usize, i: usize) -> Vec<f32> {
    let mut e = vec![0.0; dim];
    e[i] = 1.0;
    e
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, &x)| if x > best.1 { (i, x) } else { best })
        .0
}

/// Roll each `[size, size, channels]` image along its first spatial axis by
/// the matching entry of `shifts`.
fn roll_width(frames: &[f32], shifts: &[usize], size: usize, channels: usize) -> Vec<f32> {
    let row = size * channels;
    let image = size * row;
    let mut out = vec![0f32; frames.len()];
    for (n, &shift) in shifts.iter().enumerate() {
        let base = n * image;
        for x in 0..size {
            let src = base + ((x + size - shift % size) % size) * row;
            let dst = base + x * row;
            out[dst..dst + row].copy_from_slice(&frames[src..src + row]);
        }
    }
    out
}
