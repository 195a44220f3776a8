//! `curio-types` – shared configuration vocabulary for the Curio workspace.
//!
//! Everything in here is plain data: no tensors, no devices.  The crates that
//! build models (`curio-vision`, `curio-icm`) consume these types, and the CLI
//! loads them from `~/.curio/config.toml`.
//!
//! # Modules
//!
//! - [`permutation`] – [`PermutationMatrices`][permutation::PermutationMatrices]:
//!   the validated per-view table that maps local-frame action vectors into the
//!   world frame.

pub mod permutation;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use permutation::PermutationMatrices;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Construction-time configuration faults.
///
/// These are raised before any tensor is built so a bad configuration never
/// propagates into a half-constructed model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Feature extractor revision {0} is not supported (expected 1..=13)")]
    InvalidRevision(u8),

    #[error("Layer widths for {0} must be non-zero")]
    InvalidWidth(String),

    #[error("Vision configuration is invalid: {0}")]
    InvalidVision(String),

    #[error("Permutation table is empty")]
    EmptyPermutationTable,

    #[error("Permutation matrix of view {view} is not square")]
    NotSquare { view: usize },

    #[error("Permutation matrix of view {view} has dimension {found}, expected {expected}")]
    PermutationDimension {
        view: usize,
        expected: usize,
        found: usize,
    },

    #[error("Permutation matrix of view {view} is not orthogonal")]
    NotOrthogonal { view: usize },

    #[error("Permutation table holds {found} matrices but the model observes {expected} views")]
    PermutationCount { expected: usize, found: usize },

    #[error("{views} views require a permutation table; only single-view models may omit it")]
    MissingPermutation { views: usize },

    #[error("View {view} is out of range for a {views}-view model")]
    ViewOutOfRange { view: usize, views: usize },

    #[error("Expected {expected} checkpoint directories, got {found}")]
    CheckpointCount { expected: usize, found: usize },
}

// ────────────────────────────────────────────────────────────────────────────
// Small enums
// ────────────────────────────────────────────────────────────────────────────

/// Non-linearity applied after each hidden layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Elu,
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Activation::Relu => write!(f, "relu"),
            Activation::Elu => write!(f, "elu"),
        }
    }
}

/// How a loss compares prediction and ground truth.
///
/// `Discrete` treats the action vector as a one-hot label and uses softmax
/// cross-entropy; `Continuous` uses an L2 norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossMode {
    Continuous,
    #[default]
    Discrete,
}

/// Feature-extractor revision ("ferev"), one of 13 backbone topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractorRevision {
    /// Shared conv tower, single FC to `featnum`.
    Rev1,
    /// Shared conv tower, FC `[2f, f]`.
    Rev2,
    /// Per-view conv towers, FC `[2f, f]`.
    Rev3,
    /// Shared tower followed by per-view (non-shared) towers.
    Rev4,
    /// Naive conv stack at 64 px.
    Rev5,
    /// Dilated ("hole") convolutions, low resolution.
    Rev6,
    /// Dilated convolutions, mid resolution.
    Rev7,
    /// Dilated convolutions, high resolution.
    Rev8,
    /// VGG16-style strides.
    Rev9,
    /// Naive conv stack at 224 px.
    Rev10,
    /// Residual tower (ResNet-18 layout).
    Rev11,
    /// Residual tower with gradient blocked at the backbone output.
    Rev12,
    /// Residual tower, full ResNet-18 depth.
    Rev13,
}

impl ExtractorRevision {
    pub const ALL: [ExtractorRevision; 13] = [
        Self::Rev1,
        Self::Rev2,
        Self::Rev3,
        Self::Rev4,
        Self::Rev5,
        Self::Rev6,
        Self::Rev7,
        Self::Rev8,
        Self::Rev9,
        Self::Rev10,
        Self::Rev11,
        Self::Rev12,
        Self::Rev13,
    ];

    /// The integer code (1..=13).
    pub fn code(self) -> u8 {
        match self {
            Self::Rev1 => 1,
            Self::Rev2 => 2,
            Self::Rev3 => 3,
            Self::Rev4 => 4,
            Self::Rev5 => 5,
            Self::Rev6 => 6,
            Self::Rev7 => 7,
            Self::Rev8 => 8,
            Self::Rev9 => 9,
            Self::Rev10 => 10,
            Self::Rev11 => 11,
            Self::Rev12 => 12,
            Self::Rev13 => 13,
        }
    }

    /// Parameter scope the extractor's variables live under.
    pub fn scope_name(self) -> String {
        format!("vision_rev{}", self.code())
    }

    /// Widths of the fully-connected tail that maps backbone output to
    /// `featnum`.
    pub fn fc_widths(self, featnum: usize, fehidden: &[usize]) -> Vec<usize> {
        match self {
            Self::Rev1 => vec![featnum],
            Self::Rev2 | Self::Rev3 | Self::Rev4 => vec![featnum * 2, featnum],
            _ => fehidden.iter().copied().chain(Some(featnum)).collect(),
        }
    }
}

impl TryFrom<u8> for ExtractorRevision {
    type Error = ConfigError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.code() == code)
            .ok_or(ConfigError::InvalidRevision(code))
    }
}

impl std::fmt::Display for ExtractorRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ferev {}", self.code())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Vision configuration
// ────────────────────────────────────────────────────────────────────────────

/// One convolution in a backbone tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvLayer {
    pub filters: usize,
    pub kernel: usize,
    pub stride: usize,
}

impl ConvLayer {
    pub const fn new(filters: usize, kernel: usize, stride: usize) -> Self {
        Self {
            filters,
            kernel,
            stride,
        }
    }
}

/// Configuration of a convolutional tower (the per-view "svconf" and the
/// multi-view "mvconf" dictionaries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Expected square input resolution (pixels).
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_conv_layers")]
    pub conv_layers: Vec<ConvLayer>,
}

fn default_image_size() -> usize {
    32
}
fn default_conv_layers() -> Vec<ConvLayer> {
    vec![ConvLayer::new(16, 3, 2), ConvLayer::new(32, 3, 2)]
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            image_size: default_image_size(),
            conv_layers: default_conv_layers(),
        }
    }
}

impl VisionConfig {
    /// Reject zero-sized layers and empty towers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_size == 0 {
            return Err(ConfigError::InvalidVision("image_size must be positive".into()));
        }
        if self.conv_layers.is_empty() {
            return Err(ConfigError::InvalidVision("at least one conv layer is required".into()));
        }
        for (i, l) in self.conv_layers.iter().enumerate() {
            if l.filters == 0 || l.kernel == 0 || l.stride == 0 {
                return Err(ConfigError::InvalidVision(format!(
                    "conv layer {i} has a zero filters/kernel/stride"
                )));
            }
        }
        Ok(())
    }

    /// The tower each revision was designed around.
    ///
    /// Call sites resolve presets explicitly; model code never falls back to
    /// these on its own.
    pub fn preset(revision: ExtractorRevision) -> Self {
        use ExtractorRevision::*;
        let c = ConvLayer::new;
        let (image_size, conv_layers) = match revision {
            Rev1 | Rev2 | Rev3 | Rev4 => (
                64,
                vec![c(32, 5, 2), c(64, 3, 2), c(64, 3, 2), c(128, 3, 2)],
            ),
            Rev5 => (
                64,
                vec![c(16, 3, 2), c(32, 3, 2), c(64, 3, 2), c(128, 3, 2)],
            ),
            Rev6 => (32, vec![c(32, 3, 1), c(64, 3, 2), c(64, 3, 2)]),
            Rev7 => (64, vec![c(32, 3, 2), c(64, 3, 2), c(64, 3, 2)]),
            Rev8 => (
                128,
                vec![c(32, 5, 2), c(64, 3, 2), c(64, 3, 2), c(128, 3, 2)],
            ),
            Rev9 => (
                224,
                vec![
                    c(64, 3, 1),
                    c(64, 3, 2),
                    c(128, 3, 1),
                    c(128, 3, 2),
                    c(256, 3, 1),
                    c(256, 3, 2),
                    c(512, 3, 2),
                    c(512, 3, 2),
                ],
            ),
            Rev10 => (
                224,
                vec![
                    c(32, 3, 2),
                    c(64, 3, 2),
                    c(128, 3, 2),
                    c(256, 3, 2),
                    c(256, 3, 2),
                ],
            ),
            Rev11 | Rev12 => (
                224,
                vec![
                    c(64, 7, 2),
                    c(64, 3, 2),
                    c(64, 3, 1),
                    c(128, 3, 2),
                    c(128, 3, 1),
                    c(256, 3, 2),
                    c(256, 3, 1),
                    c(512, 3, 2),
                    c(512, 3, 1),
                ],
            ),
            Rev13 => (
                224,
                vec![
                    c(64, 7, 2),
                    c(64, 3, 2),
                    c(64, 3, 1),
                    c(64, 3, 1),
                    c(128, 3, 2),
                    c(128, 3, 1),
                    c(128, 3, 1),
                    c(256, 3, 2),
                    c(256, 3, 1),
                    c(256, 3, 1),
                    c(512, 3, 2),
                    c(512, 3, 1),
                    c(512, 3, 1),
                ],
            ),
        };
        Self {
            image_size,
            conv_layers,
        }
    }

    /// Non-shared per-view tower used by revision 4 on top of the shared one.
    pub fn multiview_preset() -> Self {
        Self {
            image_size: 4,
            conv_layers: vec![ConvLayer::new(128, 3, 1), ConvLayer::new(128, 3, 1)],
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Heads
// ────────────────────────────────────────────────────────────────────────────

/// Forward-model topology.
///
/// `joint` predicts all views from one flattened multi-view feature;
/// otherwise each view is predicted from its own feature and local action.
/// `output_width` only applies to joint mode and keeps the flat
/// `[batch, 1, output_width]` result instead of reshaping to per-view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForwardSpec {
    #[serde(default)]
    pub joint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_width: Option<usize>,
}

impl ForwardSpec {
    pub fn per_view() -> Self {
        Self::default()
    }

    pub fn joint() -> Self {
        Self {
            joint: true,
            output_width: None,
        }
    }

    pub fn joint_with_width(width: usize) -> Self {
        Self {
            joint: true,
            output_width: Some(width),
        }
    }
}

/// Hidden-layer widths used when an [`IcmConfig`] leaves a head's list empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenLayerDefaults {
    pub inverse: Vec<usize>,
    pub forward: Vec<usize>,
}

impl Default for HiddenLayerDefaults {
    fn default() -> Self {
        Self {
            inverse: vec![256],
            forward: vec![256, 256],
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// IcmConfig
// ────────────────────────────────────────────────────────────────────────────

/// Everything needed to build one intrinsic curiosity module besides the
/// observation tensors themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcmConfig {
    /// Per-view embedding width.
    #[serde(default = "default_featnum")]
    pub featnum: usize,

    #[serde(default)]
    pub activation: Activation,

    /// Feature-extractor revision code, validated by [`IcmConfig::revision`].
    #[serde(default = "default_ferev")]
    pub ferev: u8,

    /// Hidden widths of the extractor's FC tail (revisions 5–13).
    #[serde(default = "default_fehidden")]
    pub fehidden: Vec<usize>,

    /// Inverse-model hidden widths.
    #[serde(default)]
    pub imhidden: Vec<usize>,

    /// Forward-model hidden widths.
    #[serde(default)]
    pub fwhidden: Vec<usize>,

    #[serde(default)]
    pub batch_normalization: bool,

    /// Batch-normalised layers normalise with (and update) the statistics of
    /// the current batch.  Off, they use their running averages.  A run mode,
    /// never persisted.
    #[serde(skip)]
    pub batch_norm_training: bool,

    #[serde(default)]
    pub vision: VisionConfig,

    #[serde(default = "VisionConfig::multiview_preset")]
    pub multiview: VisionConfig,

    #[serde(default)]
    pub forward: ForwardSpec,

    /// Independent committee only: sum raw logits before one softmax instead
    /// of softmax-per-view.
    #[serde(default)]
    pub singlesoftmax: bool,
}

fn default_featnum() -> usize {
    256
}
fn default_ferev() -> u8 {
    1
}
fn default_fehidden() -> Vec<usize> {
    vec![1024, 1024]
}

impl Default for IcmConfig {
    fn default() -> Self {
        Self {
            featnum: default_featnum(),
            activation: Activation::default(),
            ferev: default_ferev(),
            fehidden: default_fehidden(),
            imhidden: Vec::new(),
            fwhidden: Vec::new(),
            batch_normalization: false,
            batch_norm_training: false,
            vision: VisionConfig::default(),
            multiview: VisionConfig::multiview_preset(),
            forward: ForwardSpec::default(),
            singlesoftmax: false,
        }
    }
}

impl IcmConfig {
    /// Validated extractor revision.
    pub fn revision(&self) -> Result<ExtractorRevision, ConfigError> {
        ExtractorRevision::try_from(self.ferev)
    }

    /// Fill empty inverse/forward hidden lists from `defaults`.
    ///
    /// Meant to be called once where the configuration is assembled.
    pub fn resolve_hidden(mut self, defaults: &HiddenLayerDefaults) -> Self {
        if self.imhidden.is_empty() {
            self.imhidden = defaults.inverse.clone();
        }
        if self.fwhidden.is_empty() {
            self.fwhidden = defaults.forward.clone();
        }
        self
    }

    /// Check everything that can be checked without tensors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.revision()?;
        if self.featnum == 0 {
            return Err(ConfigError::InvalidWidth("featnum".into()));
        }
        for (name, widths) in [
            ("fehidden", &self.fehidden),
            ("imhidden", &self.imhidden),
            ("fwhidden", &self.fwhidden),
        ] {
            if widths.contains(&0) {
                return Err(ConfigError::InvalidWidth(name.into()));
            }
        }
        if self.forward.output_width == Some(0) {
            return Err(ConfigError::InvalidWidth("forward.output_width".into()));
        }
        self.vision.validate()?;
        if self.revision()? == ExtractorRevision::Rev4 {
            self.multiview.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_revision_code_roundtrips() {
        for code in 1..=13u8 {
            let rev = ExtractorRevision::try_from(code).unwrap();
            assert_eq!(rev.code(), code);
        }
    }

    #[test]
    fn out_of_range_revision_is_rejected() {
        assert_eq!(
            ExtractorRevision::try_from(0),
            Err(ConfigError::InvalidRevision(0))
        );
        assert_eq!(
            ExtractorRevision::try_from(14),
            Err(ConfigError::InvalidRevision(14))
        );
    }

    #[test]
    fn config_with_bad_ferev_fails_validation() {
        let cfg = IcmConfig {
            ferev: 42,
            ..IcmConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn fc_widths_follow_revision_family() {
        assert_eq!(ExtractorRevision::Rev1.fc_widths(8, &[100]), vec![8]);
        assert_eq!(ExtractorRevision::Rev3.fc_widths(8, &[100]), vec![16, 8]);
        assert_eq!(ExtractorRevision::Rev11.fc_widths(8, &[100, 50]), vec![100, 50, 8]);
        assert_eq!(ExtractorRevision::Rev5.fc_widths(8, &[]), vec![8]);
    }

    #[test]
    fn resolve_hidden_only_fills_empty_lists() {
        let defaults = HiddenLayerDefaults {
            inverse: vec![7],
            forward: vec![9, 9],
        };
        let cfg = IcmConfig {
            imhidden: vec![3],
            ..IcmConfig::default()
        }
        .resolve_hidden(&defaults);
        assert_eq!(cfg.imhidden, vec![3]);
        assert_eq!(cfg.fwhidden, vec![9, 9]);
    }

    #[test]
    fn zero_width_is_rejected() {
        let cfg = IcmConfig {
            fwhidden: vec![4, 0],
            ..IcmConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidWidth("fwhidden".into()))
        );

        let cfg = IcmConfig {
            forward: ForwardSpec::joint_with_width(0),
            ..IcmConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn every_preset_is_valid() {
        for rev in ExtractorRevision::ALL {
            VisionConfig::preset(rev).validate().unwrap();
        }
    }

    #[test]
    fn config_toml_defaults_fill_missing_fields() {
        let cfg: IcmConfig = toml::from_str("ferev = 5\nactivation = \"elu\"\n").unwrap();
        assert_eq!(cfg.ferev, 5);
        assert_eq!(cfg.activation, Activation::Elu);
        assert_eq!(cfg.featnum, 256);
        assert_eq!(cfg.fehidden, vec![1024, 1024]);
        assert!(!cfg.forward.joint);
    }

    #[test]
    fn forward_spec_serialization_omits_absent_width() {
        let json = serde_json::to_string(&ForwardSpec::joint()).unwrap();
        assert!(!json.contains("output_width"));
        let back: ForwardSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ForwardSpec::joint());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::PermutationCount {
            expected: 3,
            found: 2,
        };
        assert!(err.to_string().contains("3 views"));
    }
}
