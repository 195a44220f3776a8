//! Synthetic inverse-model pretraining, evaluation and inspection.
//!
//! Every step draws a fresh batch, rebuilds an [`IntrinsicCuriosityModule`]
//! over the run's [`ParamStore`] (so the variables carry over) and takes one
//! AdamW step on the discrete inverse loss.  The extractor and inverse head
//! are checkpointed through the module's pretrain saver, which is exactly
//! what [`evaluate`] and downstream committees restore.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{D, DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use curio_checkpoint::{CheckpointStore, FileCheckpointStore};
use curio_icm::{
    CuriosityModel, IcmError, IntrinsicCuriosityModule, Observations, ensure_trainable_loss,
};
use curio_types::{IcmConfig, LossMode, PermutationMatrices};
use curio_vision::ParamStore;
use tracing::{info, info_span, warn};

use crate::config::Config;
use crate::synthetic::SyntheticTransitions;

/// Steps between progress reports.
pub const REPORT_EVERY: u64 = 10;

/// Everything a run needs, resolved from a [`Config`].
pub struct RunSettings {
    pub icm: IcmConfig,
    pub permutations: PermutationMatrices,
    pub device: Device,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_prefix: String,
    pub steps: u64,
    pub batch: usize,
    pub learning_rate: f64,
    pub checkpoint_every: u64,
    pub seed: u64,
}

impl RunSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let icm = cfg.resolved_icm();
        icm.validate().map_err(|e| format!("Invalid icm configuration: {e}"))?;
        Ok(Self {
            icm,
            permutations: cfg.resolved_permutations()?,
            device: cfg.device()?,
            checkpoint_dir: cfg.checkpoint_dir.clone(),
            checkpoint_prefix: cfg.checkpoint_prefix.clone(),
            steps: cfg.training.steps,
            batch: cfg.training.batch,
            learning_rate: cfg.training.learning_rate,
            checkpoint_every: cfg.training.checkpoint_every,
            seed: cfg.training.seed,
        })
    }

    fn transitions(&self, seed: u64) -> SyntheticTransitions {
        SyntheticTransitions::new(
            seed,
            self.batch,
            self.icm.vision.image_size,
            self.permutations.clone(),
            self.device.clone(),
        )
    }

    /// Build the module over `obs`; `training` selects batch statistics
    /// for batch-normalised layers.
    fn build(
        &self,
        obs: Observations,
        store: &ParamStore,
        training: bool,
    ) -> Result<IntrinsicCuriosityModule, IcmError> {
        let config = IcmConfig {
            batch_norm_training: training,
            ..self.icm.clone()
        };
        IntrinsicCuriosityModule::new(obs, &config, Some(&self.permutations), store)
    }
}

/// Outcome of [`train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub steps: u64,
    pub final_loss: f32,
    pub checkpoint: Option<PathBuf>,
    pub interrupted: bool,
}

/// Outcome of [`evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub restored: bool,
    pub batches: usize,
    pub accuracy: f32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Training
// ─────────────────────────────────────────────────────────────────────────────

/// Pretrain until `settings.steps` or until `shutdown` is raised, then write
/// a final checkpoint.
///
/// `on_report(step, mean_loss)` is called every [`REPORT_EVERY`] steps.
pub fn train(
    settings: &RunSettings,
    checkpoints: &dyn CheckpointStore,
    shutdown: &AtomicBool,
    mut on_report: impl FnMut(u64, f32),
) -> Result<TrainReport, IcmError> {
    let run_id = uuid::Uuid::new_v4();
    let _span = info_span!("pretrain", %run_id, ferev = settings.icm.ferev).entered();
    let started = chrono::Utc::now();

    let store = ParamStore::new(settings.device.clone());
    let mut source = settings.transitions(settings.seed);
    let mut optimizer: Option<AdamW> = None;
    let mut last: Option<IntrinsicCuriosityModule> = None;
    let mut last_saved: Option<(u64, PathBuf)> = None;
    let mut window = Vec::with_capacity(REPORT_EVERY as usize);
    let mut final_loss = f32::NAN;
    let mut step = 0;

    while step < settings.steps {
        if shutdown.load(Ordering::SeqCst) {
            warn!(step, "pretraining interrupted");
            break;
        }
        step += 1;

        let (obs, _) = source.next_batch()?;
        let mut icm = settings.build(obs, &store, true)?;
        let loss = icm.inverse_loss(LossMode::Discrete)?;
        ensure_trainable_loss(&loss)?;

        if optimizer.is_none() {
            let vars = icm.create_pretrain_saver(0)?.params().vars();
            let params = ParamsAdamW {
                lr: settings.learning_rate,
                ..Default::default()
            };
            optimizer = Some(AdamW::new(vars, params)?);
        }
        if let Some(opt) = optimizer.as_mut() {
            opt.backward_step(&loss)?;
        }

        final_loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        window.push(final_loss);
        if step % REPORT_EVERY == 0 {
            let mean = window.iter().sum::<f32>() / window.len() as f32;
            info!(step, loss = mean, "pretrain progress");
            on_report(step, mean);
            window.clear();
        }

        if settings.checkpoint_every > 0 && step % settings.checkpoint_every == 0 {
            let path = save(&mut icm, settings, checkpoints, step)?;
            last_saved = Some((step, path));
        }
        last = Some(icm);
    }

    let interrupted = step < settings.steps;
    let checkpoint = match (last.as_mut(), last_saved) {
        (Some(_), Some((saved, path))) if saved == step => Some(path),
        (Some(icm), _) => Some(save(icm, settings, checkpoints, step)?),
        (None, _) => None,
    };
    info!(
        step,
        interrupted,
        elapsed_ms = (chrono::Utc::now() - started).num_milliseconds(),
        "pretraining finished"
    );
    Ok(TrainReport {
        steps: step,
        final_loss,
        checkpoint,
        interrupted,
    })
}

fn save(
    icm: &mut IntrinsicCuriosityModule,
    settings: &RunSettings,
    checkpoints: &dyn CheckpointStore,
    step: u64,
) -> Result<PathBuf, IcmError> {
    icm.save_pretrain(
        checkpoints,
        &settings.checkpoint_dir,
        &settings.checkpoint_prefix,
        step,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────────────

/// Restore the latest pretraining checkpoint and measure argmax accuracy of
/// the inverse model on `batches` held-out batches.
///
/// Held-out batches come from `seed + 1`, so they never repeat a training
/// batch of the same run.  When nothing could be restored the report says
/// so and the accuracy is that of the untrained model.
pub fn evaluate(
    settings: &RunSettings,
    checkpoints: &dyn CheckpointStore,
    batches: usize,
) -> Result<EvalReport, IcmError> {
    let store = ParamStore::new(settings.device.clone());
    let mut source = settings.transitions(settings.seed.wrapping_add(1));
    let mut restored = false;
    let mut correct = 0usize;
    let mut total = 0usize;

    for i in 0..batches {
        let (obs, world) = source.next_batch()?;
        let mut icm = settings.build(obs.clone(), &store, false)?;
        if i == 0 {
            restored = icm.load_pretrain(checkpoints, &settings.checkpoint_dir, 0)?;
            // Predictions are computed at build time; rebuild over the
            // restored variables.
            icm = settings.build(obs, &store, false)?;
        }
        let predicted = icm
            .inverse_model()?
            .output
            .argmax(D::Minus1)?
            .flatten_all()?
            .to_vec1::<u32>()?;
        correct += predicted
            .iter()
            .zip(&world)
            .filter(|(p, w)| **p as usize == **w)
            .count();
        total += world.len();
    }

    let accuracy = if total == 0 { 0.0 } else { correct as f32 / total as f32 };
    info!(restored, batches, accuracy, "evaluation finished");
    Ok(EvalReport {
        restored,
        batches,
        accuracy,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Inspection
// ─────────────────────────────────────────────────────────────────────────────

/// One parameter of a built model.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub name: String,
    pub dims: Vec<usize>,
}

/// Build the configured module over a single synthetic batch and list every
/// parameter it owns, plus whether the extractor exposes a backbone.
pub fn inspect(settings: &RunSettings) -> Result<(Vec<ParamInfo>, bool), IcmError> {
    let store = ParamStore::new(settings.device.clone());
    let (obs, _) = settings.transitions(settings.seed).next_batch()?;
    let mut icm = settings.build(obs, &store, false)?;
    let params = icm.all_params()?;
    let infos = params
        .iter()
        .map(|(name, var)| ParamInfo {
            name: name.to_string(),
            dims: var.dims().to_vec(),
        })
        .collect();
    Ok((infos, icm.backbone_params().is_some()))
}

/// File-backed store used by the binary.
pub fn checkpoint_store() -> FileCheckpointStore {
    FileCheckpointStore::new()
}
