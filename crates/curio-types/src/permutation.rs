//! Per-view permutation tables.
//!
//! Each camera sees the robot from a different pose, so "move +X" in one
//! view's local frame is some other axis in the world frame.  A
//! [`PermutationMatrices`] table stores one `A × A` matrix per view; row `i` of
//! view `v`'s matrix is the world-frame image of local action `i`.  The
//! transpose maps world actions back into the local frame.
//!
//! # Example
//!
//! ```rust
//! use curio_types::PermutationMatrices;
//!
//! // View 0 is aligned with the world, view 1 swaps actions 0 and 1.
//! let pm = PermutationMatrices::from_index_maps(&[vec![0, 1, 2], vec![1, 0, 2]]).unwrap();
//! assert_eq!(pm.view_num(), 2);
//! assert_eq!(pm.dimension(), 3);
//! assert_eq!(pm.map_local(1, &[1.0, 0.0, 0.0]).unwrap(), vec![0.0, 1.0, 0.0]);
//! assert!(pm.map_local(2, &[1.0, 0.0, 0.0]).is_err());
//! ```

use serde::{Deserialize, Serialize};

use crate::ConfigError;

const ORTHOGONALITY_TOLERANCE: f32 = 1e-5;

/// Validated table of per-view permutation (or permutation-like orthogonal)
/// matrices, indexed `[view][row][col]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<Vec<f32>>>", into = "Vec<Vec<Vec<f32>>>")]
pub struct PermutationMatrices {
    matrices: Vec<Vec<Vec<f32>>>,
}

impl PermutationMatrices {
    /// Validate and wrap a raw table.
    ///
    /// Every matrix must be square, all must share one dimension, and each
    /// must satisfy `PᵀP = I`.
    pub fn new(matrices: Vec<Vec<Vec<f32>>>) -> Result<Self, ConfigError> {
        let Some(first) = matrices.first() else {
            return Err(ConfigError::EmptyPermutationTable);
        };
        let dim = first.len();
        for (view, m) in matrices.iter().enumerate() {
            if m.len() != dim {
                return Err(ConfigError::PermutationDimension {
                    view,
                    expected: dim,
                    found: m.len(),
                });
            }
            if m.iter().any(|row| row.len() != dim) {
                return Err(ConfigError::NotSquare { view });
            }
            if !is_orthogonal(m) {
                return Err(ConfigError::NotOrthogonal { view });
            }
        }
        Ok(Self { matrices })
    }

    /// Build a table from index maps: `maps[v][i] = j` sends local action `i`
    /// of view `v` to world action `j`.
    pub fn from_index_maps(maps: &[Vec<usize>]) -> Result<Self, ConfigError> {
        let matrices = maps
            .iter()
            .enumerate()
            .map(|(view, map)| {
                let dim = map.len();
                let mut m = vec![vec![0.0f32; dim]; dim];
                for (i, &j) in map.iter().enumerate() {
                    if j >= dim {
                        return Err(ConfigError::PermutationDimension {
                            view,
                            expected: dim,
                            found: j + 1,
                        });
                    }
                    m[i][j] = 1.0;
                }
                Ok(m)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(matrices)
    }

    /// `views` identity matrices of size `dim`.
    pub fn identity(views: usize, dim: usize) -> Result<Self, ConfigError> {
        let map: Vec<usize> = (0..dim).collect();
        Self::from_index_maps(&vec![map; views])
    }

    pub fn view_num(&self) -> usize {
        self.matrices.len()
    }

    /// Action-space dimension `A`.
    pub fn dimension(&self) -> usize {
        self.matrices[0].len()
    }

    pub fn matrix(&self, view: usize) -> Option<&[Vec<f32>]> {
        self.matrices.get(view).map(Vec::as_slice)
    }

    /// Single-view table holding only `view`'s matrix.
    pub fn select(&self, view: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            matrices: vec![self.checked(view)?.to_vec()],
        })
    }

    /// Row-major copy of `view`'s matrix.
    pub fn flat(&self, view: usize) -> Result<Vec<f32>, ConfigError> {
        Ok(self.checked(view)?.iter().flatten().copied().collect())
    }

    /// Row-major copy of `view`'s transposed matrix.
    pub fn flat_transposed(&self, view: usize) -> Result<Vec<f32>, ConfigError> {
        let m = self.checked(view)?;
        let dim = m.len();
        Ok((0..dim)
            .flat_map(|r| (0..dim).map(move |c| m[c][r]))
            .collect())
    }

    /// `local · P_view`: local frame to world frame.
    pub fn map_local(&self, view: usize, local: &[f32]) -> Result<Vec<f32>, ConfigError> {
        let m = self.checked(view)?;
        Ok((0..m.len())
            .map(|j| local.iter().zip(m).map(|(x, row)| x * row[j]).sum())
            .collect())
    }

    /// `world · P_viewᵀ`: world frame to local frame.
    pub fn map_world(&self, view: usize, world: &[f32]) -> Result<Vec<f32>, ConfigError> {
        Ok(self
            .checked(view)?
            .iter()
            .map(|row| row.iter().zip(world).map(|(p, x)| p * x).sum())
            .collect())
    }

    fn checked(&self, view: usize) -> Result<&[Vec<f32>], ConfigError> {
        self.matrix(view).ok_or(ConfigError::ViewOutOfRange {
            view,
            views: self.view_num(),
        })
    }
}

impl TryFrom<Vec<Vec<Vec<f32>>>> for PermutationMatrices {
    type Error = ConfigError;

    fn try_from(value: Vec<Vec<Vec<f32>>>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PermutationMatrices> for Vec<Vec<Vec<f32>>> {
    fn from(value: PermutationMatrices) -> Self {
        value.matrices
    }
}

fn is_orthogonal(m: &[Vec<f32>]) -> bool {
    let dim = m.len();
    (0..dim).all(|a| {
        (0..dim).all(|b| {
            let dot: f32 = (0..dim).map(|r| m[r][a] * m[r][b]).sum();
            let expected = if a == b { 1.0 } else { 0.0 };
            (dot - expected).abs() < ORTHOGONALITY_TOLERANCE
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    #[test]
    fn transpose_undoes_every_view_on_one_hots() {
        let pm = PermutationMatrices::from_index_maps(&[
            vec![0, 1, 2, 3],
            vec![1, 2, 3, 0],
            vec![3, 2, 1, 0],
        ])
        .unwrap();
        for view in 0..pm.view_num() {
            for i in 0..pm.dimension() {
                let e = one_hot(4, i);
                let back = pm
                    .map_world(view, &pm.map_local(view, &e).unwrap())
                    .unwrap();
                assert_eq!(back, e, "view {view} action {i}");
            }
        }
    }

    #[test]
    fn flat_transposed_matches_map_world() {
        let pm = PermutationMatrices::from_index_maps(&[vec![2, 0, 1]]).unwrap();
        let t = pm.flat_transposed(0).unwrap();
        // Column j of P is row j of Pᵀ.
        let world = one_hot(3, 0);
        let via_flat: Vec<f32> = (0..3)
            .map(|c| (0..3).map(|r| world[r] * t[r * 3 + c]).sum())
            .collect();
        assert_eq!(via_flat, pm.map_world(0, &world).unwrap());
    }

    #[test]
    fn non_orthogonal_matrix_is_rejected() {
        let err = PermutationMatrices::new(vec![vec![vec![1.0, 1.0], vec![0.0, 1.0]]]).unwrap_err();
        assert_eq!(err, ConfigError::NotOrthogonal { view: 0 });
    }

    #[test]
    fn ragged_and_mismatched_tables_are_rejected() {
        assert_eq!(
            PermutationMatrices::new(vec![]).unwrap_err(),
            ConfigError::EmptyPermutationTable
        );
        assert_eq!(
            PermutationMatrices::new(vec![vec![vec![1.0, 0.0], vec![0.0]]]).unwrap_err(),
            ConfigError::NotSquare { view: 0 }
        );
        let err = PermutationMatrices::new(vec![
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            vec![vec![1.0]],
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::PermutationDimension { view: 1, .. }));
    }

    #[test]
    fn index_map_out_of_range_is_rejected() {
        assert!(PermutationMatrices::from_index_maps(&[vec![0, 5]]).is_err());
    }

    #[test]
    fn select_keeps_one_view() {
        let pm = PermutationMatrices::from_index_maps(&[vec![0, 1], vec![1, 0]]).unwrap();
        let v1 = pm.select(1).unwrap();
        assert_eq!(v1.view_num(), 1);
        assert_eq!(v1.flat(0).unwrap(), vec![0.0, 1.0, 1.0, 0.0]);
        assert!(matches!(
            pm.select(2),
            Err(ConfigError::ViewOutOfRange { view: 2, views: 2 })
        ));
    }

    #[test]
    fn out_of_range_views_are_errors() {
        let pm = PermutationMatrices::identity(2, 3).unwrap();
        let e = one_hot(3, 1);
        let out_of_range = ConfigError::ViewOutOfRange { view: 2, views: 2 };
        assert_eq!(pm.flat(2).unwrap_err(), out_of_range);
        assert_eq!(pm.flat_transposed(2).unwrap_err(), out_of_range);
        assert_eq!(pm.map_local(2, &e).unwrap_err(), out_of_range);
        assert_eq!(pm.map_world(2, &e).unwrap_err(), out_of_range);
        assert_eq!(pm.map_world(1, &e).unwrap(), e);
    }

    #[test]
    fn deserialization_validates() {
        let ok: PermutationMatrices = serde_json::from_str("[[[0.0,1.0],[1.0,0.0]]]").unwrap();
        assert_eq!(ok.dimension(), 2);
        assert!(serde_json::from_str::<PermutationMatrices>("[[[2.0,0.0],[0.0,1.0]]]").is_err());
    }
}
