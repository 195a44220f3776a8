//! `curio-vision` – trainable building blocks beneath the curiosity module.
//!
//! # Modules
//!
//! - [`params`] – [`ParamStore`][params::ParamStore] and
//!   [`ParameterSet`][params::ParameterSet]: a scoped view over one
//!   `candle_nn::VarMap` and the ordered, name-keyed parameter collections
//!   that checkpoints and optimizers consume.
//! - [`feed_forward`] – [`FeedForward`][feed_forward::FeedForward]: the
//!   configurable dense stack used for inverse/forward heads and policy
//!   heads (optional zero-init, linear final layer, batch normalisation).
//! - [`extractor`] – the [`FeatureExtractor`][extractor::FeatureExtractor]
//!   capability and [`ConvExtractor`][extractor::ConvExtractor], which
//!   realises all 13 extractor revisions over RGB-D observations.

pub mod extractor;
pub mod feed_forward;
pub mod params;

use thiserror::Error;

pub use extractor::{ConvExtractor, ExtractorSpec, FeatureExtractor, build_extractor};
pub use feed_forward::{FeedForward, FeedForwardConfig, apply_activation};
pub use params::{ParamStore, ParameterSet};

/// Errors raised while building or running vision components.
#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Configuration error: {0}")]
    Config(#[from] curio_types::ConfigError),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Unexpected input shape: {0}")]
    Shape(String),

    #[error("Parameter {0} appears in more than one scope")]
    ParameterAliasing(String),
}
