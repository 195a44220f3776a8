//! `curio-icm` – multi-view intrinsic curiosity modules.
//!
//! An intrinsic curiosity module (ICM) extracts per-view features from a
//! pair of RGB-D observations, predicts the action taken between them
//! (inverse model) and predicts the next features from the current ones and
//! the action (forward model).  Per-view predictions are folded into one
//! world-frame prediction by permutation voting.
//!
//! # Modules
//!
//! - [`observation`] – [`Observations`][observation::Observations]: the
//!   validated transition batch every variant is built over.
//! - [`voting`] – [`PermutationVoting`][voting::PermutationVoting]: local →
//!   world voting and world → local action mapping.
//! - [`model`] – the [`CuriosityModel`][model::CuriosityModel] capability,
//!   [`ModelOutput`][model::ModelOutput] and the shared loss functions.
//! - [`single`] – [`IntrinsicCuriosityModule`][single::IntrinsicCuriosityModule]
//!   (ICM-Single).
//! - [`committee`] – [`IcmCommittee`][committee::IcmCommittee]: jointly
//!   trained per-view modules whose inverse predictions are summed.
//! - [`independent`] –
//!   [`IcmIndependentCommittee`][independent::IcmIndependentCommittee]:
//!   independently checkpointed per-view modules combined by a softmax vote.
//! - [`saver`] – [`Saver`][saver::Saver]: scoped, all-or-nothing parameter
//!   restore from a [`CheckpointStore`][curio_checkpoint::CheckpointStore].
//! - [`stage`] – [`Stage`][stage::Stage]: the build-once state behind every
//!   memoised artifact.
//!
//! Models are built eagerly over one batch.  All trainable state lives in the
//! [`ParamStore`][curio_vision::ParamStore] passed at construction, so a
//! model rebuilt over the next batch with the same store reuses the same
//! variables.

pub mod committee;
pub mod error;
pub mod independent;
pub mod model;
pub mod observation;
pub mod saver;
pub mod single;
pub mod stage;
pub mod voting;

#[cfg(test)]
mod fixtures;

pub use committee::IcmCommittee;
pub use error::IcmError;
pub use independent::IcmIndependentCommittee;
pub use model::{
    CuriosityModel, INVALID_LOSS, ModelOutput, ensure_trainable_loss, invalid_loss,
    softmax_cross_entropy,
};
pub use observation::Observations;
pub use saver::{Saver, StagedRestore};
pub use single::IntrinsicCuriosityModule;
pub use stage::Stage;
pub use voting::PermutationVoting;

/// Parameter scope of view `i` inside a committee.
pub fn view_scope_name(i: usize) -> String {
    format!("icm_view{i}")
}
