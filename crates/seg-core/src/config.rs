//! Configuration structures for tiled segmentation training.
//!
//! Every section has defaults, so a TOML file only needs the keys it wants to
//! change. CLI flags are applied on top and the result is checked with
//! [`TrainingConfig::validate`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::backend::Device;
use crate::error::{Error, Result};
use crate::stitch::OverlapPolicy;
use crate::tiling::ChipGrid;
use crate::types::CheckpointMode;

/// Main configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub device: Device,
    /// Number of training epochs
    pub epochs: usize,
    /// Training batch size
    pub batch_size: usize,
    /// Seed for shuffling and weight initialization
    pub seed: u64,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerType,
    pub tiling: TilingConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            device: Device::default(),
            epochs: 50,
            batch_size: 4,
            seed: 1,
            data: DataConfig::default(),
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerType::default(),
            tiling: TilingConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Checks the resolved configuration before any work starts
    pub fn validate(&self) -> Result<()> {
        if self.data.num_classes < 2 {
            return Err(Error::Config(format!(
                "num_classes must be at least 2, got {}",
                self.data.num_classes
            )));
        }
        if self.data.num_classes > 256 {
            return Err(Error::Config(format!(
                "num_classes ({}) does not fit 8-bit ground truth",
                self.data.num_classes
            )));
        }
        if self.epochs == 0 {
            return Err(Error::Config("epochs must be greater than 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if self.checkpoint.save_every == 0 {
            return Err(Error::Config("save_every must be greater than 0".into()));
        }
        if self.tiling.batch_size == 0 {
            return Err(Error::Config("tiling.batch_size must be greater than 0".into()));
        }
        if !(self.optimizer.learning_rate > 0.0 && self.optimizer.learning_rate.is_finite()) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.optimizer.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            return Err(Error::Config(format!(
                "momentum must be in [0, 1), got {}",
                self.optimizer.momentum
            )));
        }
        if self.model.base_channels == 0 {
            return Err(Error::Config("model.base_channels must be greater than 0".into()));
        }

        self.scheduler.validate()?;
        self.tiling.grid()?;

        if self.checkpoint.mode == CheckpointMode::Load && !self.checkpoint.path.exists() {
            return Err(Error::Config(format!(
                "checkpoint mode is load but {} does not exist",
                self.checkpoint.path.display()
            )));
        }

        Ok(())
    }

    /// Checks that the data directories exist
    pub fn validate_paths(&self, training: bool) -> Result<()> {
        if training && !self.data.train_data_path.is_dir() {
            return Err(Error::Config(format!(
                "training data directory {} does not exist",
                self.data.train_data_path.display()
            )));
        }
        if let Some(val) = &self.data.val_data_path {
            if !val.is_dir() {
                return Err(Error::Config(format!(
                    "validation data directory {} does not exist",
                    val.display()
                )));
            }
        }
        Ok(())
    }
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory with `image/` and `gt/` subdirectories
    pub train_data_path: PathBuf,
    /// Validation directory, same layout; validation is skipped when unset
    pub val_data_path: Option<PathBuf>,
    /// Number of segmentation classes
    pub num_classes: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_data_path: PathBuf::from("data/train"),
            val_data_path: None,
            num_classes: 12,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Name recorded in checkpoints and the run record
    pub name: String,
    /// Width of the first convolution block
    pub base_channels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "tiny_segnet".to_string(),
            base_channels: 16,
        }
    }
}

/// SGD optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.9,
            weight_decay: None,
        }
    }
}

/// Learning rate scheduler type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,

    /// Multiply LR by gamma every step_size epochs
    StepLR { step_size: usize, gamma: f64 },

    /// Multiply LR by gamma every epoch
    ExponentialLR { gamma: f64 },

    /// Reduce LR when the monitored loss stops improving
    ReduceLROnPlateau {
        factor: f64,
        patience: usize,
        /// Relative improvement required to reset patience
        threshold: f64,
        min_lr: f64,
    },
}

impl Default for SchedulerType {
    fn default() -> Self {
        Self::ReduceLROnPlateau {
            factor: 0.5,
            patience: 2,
            threshold: 1e-4,
            min_lr: 1e-6,
        }
    }
}

impl SchedulerType {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerType::Constant => "Constant",
            SchedulerType::StepLR { .. } => "StepLR",
            SchedulerType::ExponentialLR { .. } => "ExponentialLR",
            SchedulerType::ReduceLROnPlateau { .. } => "ReduceLROnPlateau",
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            SchedulerType::Constant => Ok(()),
            SchedulerType::StepLR { step_size, gamma } => {
                if step_size == 0 {
                    return Err(Error::Config("StepLR step_size must be greater than 0".into()));
                }
                check_factor("StepLR gamma", gamma)
            }
            SchedulerType::ExponentialLR { gamma } => check_factor("ExponentialLR gamma", gamma),
            SchedulerType::ReduceLROnPlateau {
                factor,
                threshold,
                min_lr,
                ..
            } => {
                check_factor("ReduceLROnPlateau factor", factor)?;
                if threshold < 0.0 || min_lr < 0.0 {
                    return Err(Error::Config(
                        "ReduceLROnPlateau threshold and min_lr must be non-negative".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn check_factor(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be in (0, 1], got {value}")))
    }
}

/// Sliding-window validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    pub chip_size: usize,
    pub stride: usize,
    pub overlap_policy: OverlapPolicy,
    /// Chips per inference batch during validation
    pub batch_size: usize,
    /// Directory for stitched prediction PNGs, none when unset
    pub save_predictions: Option<PathBuf>,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            chip_size: 256,
            stride: 128,
            overlap_policy: OverlapPolicy::default(),
            batch_size: 8,
            save_predictions: None,
        }
    }
}

impl TilingConfig {
    pub fn grid(&self) -> Result<ChipGrid> {
        ChipGrid::new(self.chip_size, self.stride)
    }
}

/// Snapshot and checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub mode: CheckpointMode,
    /// Checkpoint file
    pub path: PathBuf,
    /// Directory for weight snapshots, history and the run record
    pub save_model_path: PathBuf,
    /// Snapshot and validation interval in epochs
    pub save_every: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            mode: CheckpointMode::None,
            path: PathBuf::from("checkpoints/checkpoint.json"),
            save_model_path: PathBuf::from("models"),
            save_every: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainingConfig::default();
        assert_eq!(config.data.num_classes, 12);
        assert_eq!(config.checkpoint.save_every, 5);
        assert_eq!(config.seed, 1);
        assert!(matches!(config.scheduler, SchedulerType::ReduceLROnPlateau { patience: 2, .. }));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            epochs = 10
            device = "cpu"

            [data]
            train_data_path = "/data/train"
            num_classes = 4

            [scheduler]
            type = "StepLR"
            step_size = 3
            gamma = 0.5

            [tiling]
            chip_size = 64
            stride = 32
            overlap_policy = "max"
        "#;
        let config: TrainingConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.epochs, 10);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.data.num_classes, 4);
        assert_eq!(config.data.val_data_path, None);
        assert_eq!(config.scheduler, SchedulerType::StepLR { step_size: 3, gamma: 0.5 });
        assert_eq!(config.tiling.overlap_policy, OverlapPolicy::Max);
        assert_eq!(config.tiling.batch_size, 8);
        assert_eq!(config.optimizer.momentum, 0.9);
        config.validate().unwrap();
    }

    #[test]
    fn test_shipped_config_parses() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/train.toml");
        let config: TrainingConfig = crate::load_toml_config(&path).unwrap();
        assert_eq!(config.checkpoint.mode, CheckpointMode::Save);
        assert_eq!(config.data.val_data_path, Some(PathBuf::from("data/val")));
        assert_eq!(config.scheduler, SchedulerType::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = TrainingConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: TrainingConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.scheduler, config.scheduler);
        assert_eq!(parsed.tiling.chip_size, config.tiling.chip_size);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TrainingConfig::default();
        config.tiling.stride = config.tiling.chip_size + 1;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.data.num_classes = 1;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.checkpoint.save_every = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.scheduler = SchedulerType::ExponentialLR { gamma: 1.5 };
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.optimizer.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_mode_requires_checkpoint_file() {
        let dir = TempDir::new().unwrap();
        let mut config = TrainingConfig::default();
        config.checkpoint.mode = CheckpointMode::Load;
        config.checkpoint.path = dir.path().join("checkpoint.json");
        assert!(config.validate().is_err());

        std::fs::write(&config.checkpoint.path, "{}").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_paths() {
        let dir = TempDir::new().unwrap();
        let mut config = TrainingConfig::default();
        config.data.train_data_path = dir.path().to_path_buf();
        config.validate_paths(true).unwrap();

        config.data.val_data_path = Some(dir.path().join("missing"));
        assert!(config.validate_paths(false).is_err());
    }
}
