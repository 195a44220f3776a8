//! Configuration vault – reads/writes `~/.curio/config.toml`.

use candle_core::Device;
use curio_types::{HiddenLayerDefaults, IcmConfig, PermutationMatrices};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Pretraining loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_steps")]
    pub steps: u64,

    /// Transitions per synthetic batch.
    #[serde(default = "default_batch")]
    pub batch: usize,

    /// Cameras per observation.
    #[serde(default = "default_views")]
    pub views: usize,

    /// Size of the discrete action space.
    #[serde(default = "default_actions")]
    pub actions: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Write a checkpoint every this many steps; `0` only saves on exit.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,

    /// Seed of the synthetic data generator.
    #[serde(default)]
    pub seed: u64,
}

fn default_steps() -> u64 {
    1000
}
fn default_batch() -> usize {
    16
}
fn default_views() -> usize {
    1
}
fn default_actions() -> usize {
    4
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_checkpoint_every() -> u64 {
    100
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            batch: default_batch(),
            views: default_views(),
            actions: default_actions(),
            learning_rate: default_learning_rate(),
            checkpoint_every: default_checkpoint_every(),
            seed: 0,
        }
    }
}

/// Persisted configuration stored in `~/.curio/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Curiosity-module hyperparameters.  Empty head widths are filled from
    /// [`HiddenLayerDefaults`] by [`Config::resolved_icm`].
    #[serde(default)]
    pub icm: IcmConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    /// Per-view action permutations; identity tables are used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permutations: Option<PermutationMatrices>,

    /// Directory holding pretraining snapshots and their index.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    #[serde(default = "default_checkpoint_prefix")]
    pub checkpoint_prefix: String,

    /// `"cpu"` or `"cuda:<ordinal>"`.
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints").join("pretrain")
}
fn default_checkpoint_prefix() -> String {
    "icm".to_string()
}
fn default_device() -> String {
    "cpu".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            icm: IcmConfig::default(),
            training: TrainingConfig::default(),
            permutations: None,
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_prefix: default_checkpoint_prefix(),
            device: default_device(),
        }
    }
}

impl Config {
    /// The curiosity-module configuration with head defaults applied.
    pub fn resolved_icm(&self) -> IcmConfig {
        self.icm
            .clone()
            .resolve_hidden(&HiddenLayerDefaults::default())
    }

    /// The configured permutation table, or identities for every view.
    pub fn resolved_permutations(&self) -> Result<PermutationMatrices, String> {
        match &self.permutations {
            Some(pm) => {
                if pm.view_num() != self.training.views || pm.dimension() != self.training.actions
                {
                    return Err(format!(
                        "permutation table is {} views × {} actions, training expects {} × {}",
                        pm.view_num(),
                        pm.dimension(),
                        self.training.views,
                        self.training.actions
                    ));
                }
                Ok(pm.clone())
            }
            None => PermutationMatrices::identity(self.training.views, self.training.actions)
                .map_err(|e| format!("Failed to build identity permutations: {e}")),
        }
    }

    /// Parse [`Config::device`].
    pub fn device(&self) -> Result<Device, String> {
        parse_device(&self.device)
    }
}

pub(crate) fn parse_device(spec: &str) -> Result<Device, String> {
    match spec.trim() {
        "cpu" => Ok(Device::Cpu),
        other => {
            let ordinal = other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| format!("Unknown device '{other}' (expected cpu or cuda:<n>)"))?;
            Device::new_cuda(ordinal).map_err(|e| format!("Failed to open {other}: {e}"))
        }
    }
}

/// Return the path to `~/.curio/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".curio").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `CURIO_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CURIO_CKPT_DIR` | `checkpoint_dir` |
/// | `CURIO_DEVICE` | `device` |
/// | `CURIO_FEREV` | `icm.ferev` |
/// | `CURIO_FEATNUM` | `icm.featnum` |
/// | `CURIO_BATCH` | `training.batch` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CURIO_CKPT_DIR") {
        cfg.checkpoint_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CURIO_DEVICE") {
        cfg.device = v;
    }
    if let Ok(v) = std::env::var("CURIO_FEREV")
        && let Ok(rev) = v.parse::<u8>()
    {
        cfg.icm.ferev = rev;
    }
    if let Ok(v) = std::env::var("CURIO_FEATNUM")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.icm.featnum = n;
    }
    if let Ok(v) = std::env::var("CURIO_BATCH")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.training.batch = n;
    }
}

/// Save the config to disk, creating `~/.curio/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.permutations =
            Some(PermutationMatrices::from_index_maps(&[vec![0, 1, 2, 3], vec![1, 2, 3, 0]]).unwrap());
        cfg.training.views = 2;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.permutations, cfg.permutations);
        assert_eq!(loaded.training.views, 2);
        assert_eq!(loaded.training.learning_rate, 1e-3);
        assert_eq!(loaded.checkpoint_prefix, "icm");
        assert_eq!(loaded.icm.vision, cfg.icm.vision);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("device = \"cpu\"\n[training]\nsteps = 7\n").unwrap();
        assert_eq!(cfg.training.steps, 7);
        assert_eq!(cfg.training.batch, 16);
        assert_eq!(cfg.icm, IcmConfig::default());
        assert!(cfg.permutations.is_none());
    }

    #[test]
    fn invalid_permutations_fail_to_parse() {
        let raw = "permutations = [[[1.0, 1.0], [0.0, 1.0]]]\n";
        assert!(toml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn config_path_points_to_curio_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".curio"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn resolved_icm_fills_empty_heads() {
        let cfg = Config::default();
        let icm = cfg.resolved_icm();
        let defaults = HiddenLayerDefaults::default();
        assert_eq!(icm.imhidden, defaults.inverse);
        assert_eq!(icm.fwhidden, defaults.forward);
    }

    #[test]
    fn identity_permutations_cover_every_view() {
        let mut cfg = Config::default();
        cfg.training.views = 3;
        let pm = cfg.resolved_permutations().unwrap();
        assert_eq!(pm.view_num(), 3);
        assert_eq!(pm.dimension(), cfg.training.actions);
    }

    #[test]
    fn mismatched_permutation_table_is_rejected() {
        let mut cfg = Config::default();
        cfg.permutations = Some(PermutationMatrices::identity(2, 4).unwrap());
        assert!(cfg.resolved_permutations().is_err());
    }

    #[test]
    fn device_strings_are_validated() {
        assert!(matches!(parse_device("cpu"), Ok(Device::Cpu)));
        assert!(parse_device("tpu").is_err());
        assert!(parse_device("cuda:x").is_err());
    }

    #[test]
    fn apply_env_overrides_changes_checkpoint_dir() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("CURIO_CKPT_DIR", "/tmp/curio-ckpt") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.checkpoint_dir, PathBuf::from("/tmp/curio-ckpt"));
        unsafe { std::env::remove_var("CURIO_CKPT_DIR") };
    }

    #[test]
    fn apply_env_overrides_changes_revision() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("CURIO_FEREV", "12") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.icm.ferev, 12);
        unsafe { std::env::remove_var("CURIO_FEREV") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_featnum() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("CURIO_FEATNUM", "wide") };
        let mut cfg = Config::default();
        let original = cfg.icm.featnum;
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.icm.featnum, original);
        unsafe { std::env::remove_var("CURIO_FEATNUM") };
    }

    #[test]
    fn apply_env_overrides_changes_batch() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("CURIO_BATCH", "3") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.training.batch, 3);
        unsafe { std::env::remove_var("CURIO_BATCH") };
    }
}
