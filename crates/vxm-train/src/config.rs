//! Training configuration.
//!
//! Every knob of a run lives in [`TrainingConfig`], a burn [`Config`] that
//! round-trips through JSON. The binary loads one from disk and applies
//! command-line overrides on top.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};
use vxm_model::VoxelMorphConfig;

use crate::error::TrainError;

/// Compute device for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// `Autodiff<NdArray>`.
    #[default]
    Cpu,
    /// `Autodiff<Wgpu>`.
    Gpu,
}

impl FromStr for DeviceKind {
    type Err = TrainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "wgpu" => Ok(Self::Gpu),
            other => Err(TrainError::invalid_configuration(format!(
                "unknown device '{other}', expected 'cpu' or 'gpu'"
            ))),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

/// What the training loop does with a batch whose shape differs from `dims`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimMismatchPolicy {
    /// Stop the run with [`TrainError::DimensionMismatch`].
    #[default]
    Abort,
    /// Log a warning and skip the batch.
    Skip,
}

impl FromStr for DimMismatchPolicy {
    type Err = TrainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(TrainError::invalid_configuration(format!(
                "unknown mismatch policy '{other}', expected 'abort' or 'skip'"
            ))),
        }
    }
}

/// Where patient volumes live on disk.
///
/// Each patient `ID` has `{root}/{ID}/{subdir}/{fixed_file}` and
/// `{root}/{ID}/{subdir}/{moving_file}`.
#[derive(Config, Debug)]
pub struct DatasetConfig {
    pub root: PathBuf,
    #[config(default = "\"normalized\".to_string()")]
    pub subdir: String,
    /// T1-weighted target volume.
    #[config(default = "\"T1w_1mm_normalized.nii.gz\".to_string()")]
    pub fixed_file: String,
    /// T2-weighted volume to be aligned.
    #[config(default = "\"T2w_1mm_normalized.nii.gz\".to_string()")]
    pub moving_file: String,
    /// Patients `first..first + count`, zero padded to `id_width`.
    #[config(default = "200")]
    pub patient_count: usize,
    #[config(default = "1")]
    pub first_patient: usize,
    #[config(default = "3")]
    pub id_width: usize,
    /// List patient directories under `root` instead of generating ids.
    #[config(default = "false")]
    pub discover: bool,
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub dataset: DatasetConfig,
    #[config(default = "VoxelMorphConfig::new()")]
    pub model: VoxelMorphConfig,
    /// Spatial shape `[D, H, W]` every volume must have.
    #[config(default = "[182, 218, 182]")]
    pub dims: [usize; 3],
    #[config(default = "1")]
    pub batch_size: usize,
    #[config(default = "2")]
    pub num_epochs: usize,
    #[config(default = "true")]
    pub shuffle: bool,
    /// Data loader threads; 0 reads on the training thread.
    #[config(default = "6")]
    pub num_workers: usize,
    #[config(default = "1e-4")]
    pub learning_rate: f64,
    #[config(default = "0.99")]
    pub momentum: f64,
    /// Weight of the smoothness penalty.
    #[config(default = "0.01")]
    pub lambda: f64,
    /// Side of the NCC window.
    #[config(default = "9")]
    pub ncc_window: usize,
    #[config(default = "0.33")]
    pub validation_ratio: f64,
    #[config(default = "42")]
    pub seed: u64,
    #[config(default = "DeviceKind::Cpu")]
    pub device: DeviceKind,
    #[config(default = "PathBuf::from(\"output_images\")")]
    pub output_dir: PathBuf,
    /// Checkpoint path; the recorder appends `.mpk`.
    #[config(default = "PathBuf::from(\"model\")")]
    pub checkpoint: PathBuf,
    /// Write registered volumes every this many batches; 0 disables.
    #[config(default = "1")]
    pub save_every: usize,
    /// Run a validation pass after each epoch.
    #[config(default = "true")]
    pub validate: bool,
    #[config(default = "DimMismatchPolicy::Abort")]
    pub on_dim_mismatch: DimMismatchPolicy,
    /// Network record to start from instead of random weights.
    pub resume_from: Option<PathBuf>,
}

impl TrainingConfig {
    /// Reject values that cannot produce a run.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.batch_size == 0 {
            return Err(TrainError::invalid_configuration("batch_size must be positive"));
        }
        if self.num_epochs == 0 {
            return Err(TrainError::invalid_configuration("num_epochs must be positive"));
        }
        if self.dims.contains(&0) {
            return Err(TrainError::invalid_configuration(format!(
                "dims must be positive, got {:?}",
                self.dims
            )));
        }
        if !(0.0..1.0).contains(&self.validation_ratio) {
            return Err(TrainError::invalid_configuration(format!(
                "validation_ratio must be in [0, 1), got {}",
                self.validation_ratio
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(TrainError::invalid_configuration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(TrainError::invalid_configuration(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if self.lambda < 0.0 {
            return Err(TrainError::invalid_configuration("lambda must be non-negative"));
        }
        if self.ncc_window == 0 || self.ncc_window % 2 == 0 {
            return Err(TrainError::invalid_configuration(format!(
                "ncc_window must be odd, got {}",
                self.ncc_window
            )));
        }
        if !self.dataset.discover && self.dataset.patient_count == 0 {
            return Err(TrainError::invalid_configuration("patient_count must be positive"));
        }
        self.model
            .validate()
            .map_err(|e| TrainError::invalid_configuration(e.to_string()))
    }
}
