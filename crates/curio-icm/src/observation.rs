//! Paired observation batches.

use candle_core::Tensor;

use crate::IcmError;

/// One transition batch: the action taken plus RGB-D observations before and
/// after it.
///
/// | field | shape |
/// |---|---|
/// | `action` | `[batch, 1, A]` (world frame) |
/// | `rgb`, `next_rgb` | `[batch, view, width, height, 3]` |
/// | `depth`, `next_depth` | `[batch, view, width, height, 1]` |
#[derive(Debug, Clone)]
pub struct Observations {
    pub action: Tensor,
    pub rgb: Tensor,
    pub depth: Tensor,
    pub next_rgb: Tensor,
    pub next_depth: Tensor,
}

impl Observations {
    /// Bundle and validate a transition batch.
    pub fn new(
        action: Tensor,
        rgb: Tensor,
        depth: Tensor,
        next_rgb: Tensor,
        next_depth: Tensor,
    ) -> Result<Self, IcmError> {
        let obs = Self {
            action,
            rgb,
            depth,
            next_rgb,
            next_depth,
        };
        obs.validate()?;
        Ok(obs)
    }

    /// Check ranks, channel counts and batch/view agreement.
    pub fn validate(&self) -> Result<(), IcmError> {
        let (b, v, w, h, c) = self.rgb.dims5()?;
        if c != 3 {
            return Err(IcmError::ShapeMismatch(format!(
                "rgb must have 3 channels, got {c}"
            )));
        }
        let depth_dims = [b, v, w, h, 1];
        for (name, t, expected) in [
            ("next_rgb", &self.next_rgb, [b, v, w, h, 3]),
            ("depth", &self.depth, depth_dims),
            ("next_depth", &self.next_depth, depth_dims),
        ] {
            if t.dims() != expected {
                return Err(IcmError::ShapeMismatch(format!(
                    "{name} is {:?}, expected {expected:?}",
                    t.dims()
                )));
            }
        }
        let (ab, one, a) = self.action.dims3()?;
        if ab != b || one != 1 || a == 0 {
            return Err(IcmError::ShapeMismatch(format!(
                "action is {:?}, expected [{b}, 1, A]",
                self.action.dims()
            )));
        }
        if v == 0 {
            return Err(IcmError::ShapeMismatch("observation has no views".into()));
        }
        Ok(())
    }

    pub fn batch(&self) -> usize {
        self.rgb.dims().first().copied().unwrap_or(0)
    }

    pub fn view_num(&self) -> usize {
        self.rgb.dims().get(1).copied().unwrap_or(0)
    }

    /// `A`, the width of the action tensor's last axis.
    pub fn action_space_dimension(&self) -> usize {
        self.action.dims().last().copied().unwrap_or(0)
    }

    /// One single-view batch per view; the action is shared.
    pub fn split_views(&self) -> Result<Vec<Observations>, IcmError> {
        let slice = |t: &Tensor, v: usize| -> Result<Tensor, IcmError> {
            Ok(t.narrow(1, v, 1)?.contiguous()?)
        };
        (0..self.view_num())
            .map(|v| {
                Ok(Observations {
                    action: self.action.clone(),
                    rgb: slice(&self.rgb, v)?,
                    depth: slice(&self.depth, v)?,
                    next_rgb: slice(&self.next_rgb, v)?,
                    next_depth: slice(&self.next_depth, v)?,
                })
            })
            .collect()
    }
}
