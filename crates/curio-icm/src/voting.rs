//! Permutation voting between per-view local frames and the world frame.
//!
//! Each view predicts an action distribution in its own local frame.
//! [`PermutationVoting::vote`] maps every view's prediction through that
//! view's matrix into the world frame and sums them, so views that agree
//! reinforce one another.  [`PermutationVoting::local_action`] goes the
//! other way, expressing one world-frame action in every view's local frame.
//!
//! `local_action` followed by `vote` is not an identity in general: with `V`
//! agreeing views the result is the world action scaled by `V`.

use candle_core::{Device, Tensor};
use curio_types::{ConfigError, PermutationMatrices};

use crate::IcmError;

/// Per-view `(P, Pᵀ)` pairs, or a single-view passthrough.
#[derive(Debug, Clone)]
pub struct PermutationVoting {
    view_num: usize,
    matrices: Option<Vec<(Tensor, Tensor)>>,
}

impl PermutationVoting {
    /// Validate `table` against the model's view count and action width.
    ///
    /// Without a table the model must observe exactly one view.
    pub fn new(
        view_num: usize,
        table: Option<&PermutationMatrices>,
        action_space_dimension: usize,
        device: &Device,
    ) -> Result<Self, IcmError> {
        let Some(table) = table else {
            if view_num != 1 {
                return Err(ConfigError::MissingPermutation { views: view_num }.into());
            }
            return Ok(Self {
                view_num,
                matrices: None,
            });
        };
        if table.view_num() != view_num {
            return Err(ConfigError::PermutationCount {
                expected: view_num,
                found: table.view_num(),
            }
            .into());
        }
        if table.dimension() != action_space_dimension {
            return Err(ConfigError::PermutationDimension {
                view: 0,
                expected: action_space_dimension,
                found: table.dimension(),
            }
            .into());
        }
        let a = action_space_dimension;
        let matrices = (0..view_num)
            .map(|v| {
                Ok((
                    Tensor::from_vec(table.flat(v)?, (a, a), device)?,
                    Tensor::from_vec(table.flat_transposed(v)?, (a, a), device)?,
                ))
            })
            .collect::<Result<Vec<_>, IcmError>>()?;
        Ok(Self {
            view_num,
            matrices: Some(matrices),
        })
    }

    pub fn view_num(&self) -> usize {
        self.view_num
    }

    pub fn is_passthrough(&self) -> bool {
        self.matrices.is_none()
    }

    /// `[batch, view, N]` local predictions → `[batch, 1, N]` world frame.
    pub fn vote(&self, local_pred: &Tensor) -> Result<Tensor, IcmError> {
        let (_, views, _) = local_pred.dims3()?;
        let Some(matrices) = &self.matrices else {
            if views != 1 {
                return Err(ConfigError::MissingPermutation { views }.into());
            }
            return Ok(local_pred.clone());
        };
        if views != matrices.len() {
            return Err(ConfigError::PermutationCount {
                expected: views,
                found: matrices.len(),
            }
            .into());
        }
        let world = matrices
            .iter()
            .enumerate()
            .map(|(v, (p, _))| {
                let local = local_pred.narrow(1, v, 1)?.squeeze(1)?.contiguous()?;
                Ok(local.matmul(p)?)
            })
            .collect::<Result<Vec<_>, IcmError>>()?;
        Ok(Tensor::stack(&world, 1)?.sum_keepdim(1)?)
    }

    /// `[batch, 1, N]` world action → `[batch, view, N]` local actions.
    pub fn local_action(&self, world_action: &Tensor) -> Result<Tensor, IcmError> {
        let Some(matrices) = &self.matrices else {
            return Ok(world_action.clone());
        };
        let flat = world_action.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let local = matrices
            .iter()
            .map(|(_, pt)| Ok(flat.matmul(pt)?))
            .collect::<Result<Vec<_>, IcmError>>()?;
        Ok(Tensor::stack(&local, 1)?)
    }
}
