//! The error type shared by every curiosity-model variant.

use curio_checkpoint::CheckpointError;
use curio_types::{ConfigError, ForwardSpec, LossMode};
use curio_vision::VisionError;
use thiserror::Error;

/// Errors raised while building or evaluating a curiosity model.
///
/// A missing checkpoint is not an error: restore operations
/// report it as `Ok(false)`.
#[derive(Error, Debug)]
pub enum IcmError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Vision error: {0}")]
    Vision(VisionError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("{operation} does not support {mode:?} mode")]
    UnsupportedMode {
        operation: &'static str,
        mode: LossMode,
    },

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("Forward model was built as {built:?}; {requested:?} was requested")]
    ForwardModeMismatch {
        built: ForwardSpec,
        requested: ForwardSpec,
    },

    #[error("Parameter {0} is shared between views")]
    ParameterAliasing(String),

    #[error("Loss is the invalid-loss sentinel and cannot be optimised")]
    SentinelLoss,
}

impl From<VisionError> for IcmError {
    fn from(e: VisionError) -> Self {
        match e {
            VisionError::Config(c) => IcmError::Config(c),
            VisionError::Candle(c) => IcmError::Candle(c),
            VisionError::ParameterAliasing(name) => IcmError::ParameterAliasing(name),
            other => IcmError::Vision(other),
        }
    }
}
