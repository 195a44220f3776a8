//! The capability every curiosity-model variant exposes, plus the loss
//! functions they share.

use candle_core::{D, Device, Tensor};
use curio_types::LossMode;
use curio_vision::ParameterSet;

use crate::IcmError;

/// Value of the loss returned by variants that have no trainable joint loss.
pub const INVALID_LOSS: f32 = -1.0;

/// A built head: the parameters it owns and the tensor it produced.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub params: ParameterSet,
    pub output: Tensor,
}

/// Features, inverse/forward predictions and losses of one model instance.
///
/// Predictions are built on first request and memoised; repeated calls
/// return the same tensors.
pub trait CuriosityModel {
    fn view_num(&self) -> usize;

    fn action_space_dimension(&self) -> usize;

    /// `[batch, view, featnum]` features of the current observation.
    fn cur_featvec(&mut self) -> Result<Tensor, IcmError>;

    /// `[batch, view, featnum]` features of the next observation.
    fn next_featvec(&mut self) -> Result<Tensor, IcmError>;

    /// World-frame action prediction `[batch, 1, A]`.
    fn inverse_model(&mut self) -> Result<ModelOutput, IcmError>;

    /// Predicted next features.
    fn forward_model(&mut self) -> Result<ModelOutput, IcmError>;

    fn inverse_loss(&mut self, mode: LossMode) -> Result<Tensor, IcmError>;

    fn forward_loss(&mut self, mode: LossMode) -> Result<Tensor, IcmError>;
}

/// The `[INVALID_LOSS]` tensor of shape `[1]`.
pub fn invalid_loss(device: &Device) -> Result<Tensor, IcmError> {
    Ok(Tensor::new(&[INVALID_LOSS], device)?)
}

/// Reject losses a training loop must not optimise against.
///
/// Every real loss here is non-negative, so any negative entry marks the
/// [`INVALID_LOSS`] sentinel.
pub fn ensure_trainable_loss(loss: &Tensor) -> Result<(), IcmError> {
    let values = loss.flatten_all()?.to_vec1::<f32>()?;
    if values.iter().any(|v| *v < 0.0) {
        return Err(IcmError::SentinelLoss);
    }
    Ok(())
}

/// Mean softmax cross-entropy between one-hot `labels` and `logits`, both
/// viewed as `[-1, width]`.
pub fn softmax_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    width: usize,
) -> Result<Tensor, IcmError> {
    if width == 0 || logits.elem_count() % width != 0 || logits.elem_count() != labels.elem_count()
    {
        return Err(IcmError::ShapeMismatch(format!(
            "cannot view logits {:?} and labels {:?} as [-1, {width}]",
            logits.dims(),
            labels.dims()
        )));
    }
    let rows = logits.elem_count() / width;
    let logits = logits.reshape((rows, width))?;
    let labels = labels.reshape((rows, width))?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    Ok((labels * log_probs)?.sum(1)?.mean_all()?.neg()?)
}

/// Euclidean norm of `pred - target` over all elements.
pub fn l2_norm(pred: &Tensor, target: &Tensor) -> Result<Tensor, IcmError> {
    same_shape(pred, target)?;
    Ok((pred - target)?.sqr()?.sum_all()?.sqrt()?)
}

/// `½ Σ (pred - target)²`.
pub fn half_squared_error(pred: &Tensor, target: &Tensor) -> Result<Tensor, IcmError> {
    same_shape(pred, target)?;
    Ok((pred - target)?.sqr()?.sum_all()?.affine(0.5, 0.0)?)
}

/// Element-wise sum of equally shaped tensors.
pub fn add_n(tensors: &[Tensor]) -> Result<Tensor, IcmError> {
    let Some((first, rest)) = tensors.split_first() else {
        return Err(IcmError::ShapeMismatch("cannot sum zero tensors".into()));
    };
    rest.iter().try_fold(first.clone(), |acc, t| {
        same_shape(&acc, t)?;
        Ok((acc + t)?)
    })
}

fn same_shape(a: &Tensor, b: &Tensor) -> Result<(), IcmError> {
    if a.dims() != b.dims() {
        return Err(IcmError::ShapeMismatch(format!(
            "{:?} vs {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok(())
}

/// Refuse `mode` unless it is [`LossMode::Discrete`].
pub(crate) fn require_discrete(operation: &'static str, mode: LossMode) -> Result<(), IcmError> {
    match mode {
        LossMode::Discrete => Ok(()),
        LossMode::Continuous => Err(IcmError::UnsupportedMode { operation, mode }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_width() {
        let logits = Tensor::zeros((2, 1, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[[1f32, 0.0, 0.0, 0.0]], [[0.0, 0.0, 1.0, 0.0]]], &Device::Cpu)
            .unwrap();
        let loss = softmax_cross_entropy(&logits, &labels, 4).unwrap();
        assert!((scalar(&loss) - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn cross_entropy_rejects_wrong_width() {
        let logits = Tensor::zeros((2, 1, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            softmax_cross_entropy(&logits, &logits, 3),
            Err(IcmError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn squared_and_norm_losses() {
        let a = Tensor::new(&[3f32, 0.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[0f32, 4.0], &Device::Cpu).unwrap();
        assert_eq!(scalar(&l2_norm(&a, &b).unwrap()), 5.0);
        assert_eq!(scalar(&half_squared_error(&a, &b).unwrap()), 12.5);
        let c = Tensor::new(&[1f32], &Device::Cpu).unwrap();
        assert!(half_squared_error(&a, &c).is_err());
    }

    #[test]
    fn add_n_sums_elementwise() {
        let a = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[10f32, 20.0], &Device::Cpu).unwrap();
        let sum = add_n(&[a.clone(), b, a]).unwrap();
        assert_eq!(sum.to_vec1::<f32>().unwrap(), vec![12.0, 24.0]);
        assert!(add_n(&[]).is_err());
    }

    #[test]
    fn sentinel_is_not_trainable() {
        let sentinel = invalid_loss(&Device::Cpu).unwrap();
        assert_eq!(sentinel.dims(), &[1]);
        assert!(matches!(
            ensure_trainable_loss(&sentinel),
            Err(IcmError::SentinelLoss)
        ));
        let real = Tensor::new(0.25f32, &Device::Cpu).unwrap();
        assert!(ensure_trainable_loss(&real).is_ok());
    }
}
