//! ICM-Committee: one module per view, trained together.
//!
//! Every view gets its own [`IntrinsicCuriosityModule`] under
//! `icm_view{i}`, fed with that view's slice of the observations.  The
//! committee's inverse prediction is the plain sum of the per-view
//! (already voted) predictions, and its inverse loss is one softmax
//! cross-entropy over that sum.

use candle_core::{D, Tensor};
use curio_types::{ConfigError, IcmConfig, LossMode, PermutationMatrices};
use curio_vision::{ParamStore, ParameterSet};
use tracing::{debug, instrument};

use crate::model::{CuriosityModel, ModelOutput, add_n, require_discrete, softmax_cross_entropy};
use crate::{IcmError, IntrinsicCuriosityModule, Observations, Stage, view_scope_name};

/// Build one module per view, handing each its own permutation matrix when a
/// table is supplied.
pub(crate) fn build_views(
    obs: &Observations,
    config: &IcmConfig,
    permutations: Option<&PermutationMatrices>,
    store: &ParamStore,
) -> Result<Vec<IntrinsicCuriosityModule>, IcmError> {
    obs.validate()?;
    let views = obs.split_views()?;
    if let Some(pm) = permutations {
        if pm.view_num() != views.len() {
            return Err(ConfigError::PermutationCount {
                expected: views.len(),
                found: pm.view_num(),
            }
            .into());
        }
    }
    views
        .into_iter()
        .enumerate()
        .map(|(i, view_obs)| {
            let table = permutations.map(|pm| pm.select(i)).transpose()?;
            IntrinsicCuriosityModule::new(
                view_obs,
                config,
                table.as_ref(),
                &store.pp(view_scope_name(i)),
            )
        })
        .collect()
}

/// Concatenate per-view parameter sets, failing on any shared name.
pub(crate) fn disjoint<I>(sets: I) -> Result<ParameterSet, IcmError>
where
    I: IntoIterator<Item = ParameterSet>,
{
    Ok(ParameterSet::disjoint_concat(sets)?)
}

/// Concatenate the per-view tensors along the view axis.
pub(crate) fn concat_views<F>(
    views: &[IntrinsicCuriosityModule],
    pick: F,
) -> Result<Tensor, IcmError>
where
    F: Fn(&IntrinsicCuriosityModule) -> &Tensor,
{
    let parts: Vec<&Tensor> = views.iter().map(pick).collect();
    Ok(Tensor::cat(&parts, 1)?)
}

/// Jointly trained per-view committee.
pub struct IcmCommittee {
    views: Vec<IntrinsicCuriosityModule>,
    action: Tensor,
    action_space_dimension: usize,
    inverse: Stage<ModelOutput>,
    cur_featvec: Stage<Tensor>,
    next_featvec: Stage<Tensor>,
}

impl IcmCommittee {
    #[instrument(skip_all, fields(scope = %store.prefix(), views = obs.view_num()))]
    pub fn new(
        obs: Observations,
        config: &IcmConfig,
        permutations: Option<&PermutationMatrices>,
        store: &ParamStore,
    ) -> Result<Self, IcmError> {
        let views = build_views(&obs, config, permutations, store)?;
        let extractors = disjoint(views.iter().map(|icm| icm.extractor_params().clone()))?;
        debug!(params = extractors.len(), "built joint committee");
        Ok(Self {
            views,
            action_space_dimension: obs.action_space_dimension(),
            action: obs.action,
            inverse: Stage::Uninitialized,
            cur_featvec: Stage::Uninitialized,
            next_featvec: Stage::Uninitialized,
        })
    }

    pub fn views(&self) -> &[IntrinsicCuriosityModule] {
        &self.views
    }

    /// Extractor parameters of every view.
    pub fn extractor_params(&self) -> Result<ParameterSet, IcmError> {
        disjoint(self.views.iter().map(|icm| icm.extractor_params().clone()))
    }

    /// Extractor and inverse-head parameters of every view: the set the
    /// joint inverse loss trains.
    pub fn trainable_params(&mut self) -> Result<ParameterSet, IcmError> {
        let inverse = self.inverse_model()?.params;
        Ok(ParameterSet::concat([self.extractor_params()?, inverse]))
    }
}

impl CuriosityModel for IcmCommittee {
    fn view_num(&self) -> usize {
        self.views.len()
    }

    fn action_space_dimension(&self) -> usize {
        self.action_space_dimension
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

    fn inverse_model(&mut self) -> Result<ModelOutput, IcmError> {
        let views = &mut self.views;
        Ok(self
            .inverse
            .get_or_try_build(|| {
                let outs = views
                    .iter_mut()
                    .map(|icm| icm.inverse_model())
                    .collect::<Result<Vec<_>, _>>()?;
                let output = add_n(&outs.iter().map(|o| o.output.clone()).collect::<Vec<_>>())?;
                let params = disjoint(outs.into_iter().map(|o| o.params))?;
                Ok::<_, IcmError>(ModelOutput { params, output })
            })?
            .clone())
    }

    fn forward_model(&mut self) -> Result<ModelOutput, IcmError> {
        Err(IcmError::Unsupported("forward model of the joint committee"))
    }

    fn inverse_loss(&mut self, mode: LossMode) -> Result<Tensor, IcmError> {
        require_discrete("joint committee inverse loss", mode)?;
        let out = self.inverse_model()?.output;
        let width = out.dim(D::Minus1)?;
        if width != self.action_space_dimension {
            return Err(IcmError::ShapeMismatch(format!(
                "summed inverse output has width {width}, action space is {}",
                self.action_space_dimension
            )));
        }
        softmax_cross_entropy(&out, &self.action, self.action_space_dimension)
    }

    fn forward_loss(&mut self, _mode: LossMode) -> Result<Tensor, IcmError> {
        Err(IcmError::Unsupported("forward loss of the joint committee"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn committee(views: usize, with_table: bool) -> (IcmCommittee, ParamStore) {
        let store = fixtures::store();
        let obs = fixtures::observations(2, views, &[2, 0]);
        let pm = fixtures::quarter_turns(views);
        let c = IcmCommittee::new(
            obs,
            &fixtures::config(),
            with_table.then_some(&pm),
            &store,
        )
        .unwrap();
        (c, store)
    }

    #[test]
    fn views_live_in_separate_scopes() {
        let (c, store) = committee(3, true);
        assert_eq!(c.view_num(), 3);
        for i in 0..3 {
            let scoped = store.pp(view_scope_name(i)).collect();
            assert!(!scoped.is_empty());
        }
        let all = c.extractor_params().unwrap();
        assert_eq!(all.len(), store.collect().len());
    }

    #[test]
    fn inverse_output_is_sum_of_views() {
        let (mut c, _) = committee(2, true);
        let joint = c.inverse_model().unwrap();
        let again = c.inverse_model().unwrap();
        assert_eq!(joint.output.id(), again.output.id());
        assert_eq!(joint.output.dims(), &[2, 1, fixtures::ACTIONS]);

        let per_view: Vec<Vec<f32>> = c
            .views
            .iter_mut()
            .map(|icm| {
                icm.inverse_model()
                    .unwrap()
                    .output
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()
            })
            .collect();
        let expected: Vec<f32> = per_view[0]
            .iter()
            .zip(&per_view[1])
            .map(|(a, b)| a + b)
            .collect();
        let got = joint.output.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-6);
        }
    }

    #[test]
    fn works_without_table_as_in_passthrough_views() {
        let (mut c, _) = committee(2, false);
        let loss = c.inverse_loss(LossMode::Discrete).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn features_concatenate_along_views() {
        let (mut c, _) = committee(3, true);
        let cur = c.cur_featvec().unwrap();
        assert_eq!(cur.dims(), &[2, 3, 4]);
        assert_eq!(cur.id(), c.cur_featvec().unwrap().id());
        assert_eq!(c.next_featvec().unwrap().dims(), &[2, 3, 4]);
    }

    #[test]
    fn unsupported_operations_say_so() {
        let (mut c, _) = committee(2, true);
        assert!(matches!(c.forward_model(), Err(IcmError::Unsupported(_))));
        assert!(matches!(
            c.forward_loss(LossMode::Discrete),
            Err(IcmError::Unsupported(_))
        ));
        assert!(matches!(
            c.inverse_loss(LossMode::Continuous),
            Err(IcmError::UnsupportedMode { .. })
        ));
    }

    #[test]
    fn wrong_table_size_is_rejected() {
        let store = fixtures::store();
        let obs = fixtures::observations(2, 3, &[0]);
        let pm = fixtures::quarter_turns(2);
        assert!(matches!(
            IcmCommittee::new(obs, &fixtures::config(), Some(&pm), &store),
            Err(IcmError::Config(ConfigError::PermutationCount { expected: 3, found: 2 }))
        ));
    }

    #[test]
    fn trainable_params_cover_extractors_and_inverse_heads() {
        let (mut c, store) = committee(2, true);
        let params = c.trainable_params().unwrap();
        assert_eq!(params.len(), store.collect().len());
    }
}
