//! Append-only record of run configurations.
//!
//! Every invocation appends one JSON line to `run_config.jsonl` in the model
//! output directory, so the hyperparameters behind each weight snapshot can
//! be recovered later.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use seg_core::{Result, SchedulerType, TrainingConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File name of the record inside the model directory
pub const RUN_RECORD_FILE: &str = "run_config.jsonl";

/// Optimizer identity and hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerDescription {
    pub name: String,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: Option<f64>,
}

/// One line of the run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: String,
    pub crate_version: String,
    /// `train` or `validate`
    pub mode: String,
    pub start_epoch: usize,
    pub optimizer: OptimizerDescription,
    pub scheduler: SchedulerType,
    pub config: TrainingConfig,
}

impl RunRecord {
    pub fn new(config: &TrainingConfig, mode: &str, start_epoch: usize) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            mode: mode.to_string(),
            start_epoch,
            optimizer: OptimizerDescription {
                name: "SGD".to_string(),
                learning_rate: config.optimizer.learning_rate,
                momentum: config.optimizer.momentum,
                weight_decay: config.optimizer.weight_decay,
            },
            scheduler: config.scheduler.clone(),
            config: config.clone(),
        }
    }

    /// Appends this record to `<dir>/run_config.jsonl`
    pub fn append(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(RUN_RECORD_FILE);

        let mut line = serde_json::to_string(self)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;

        debug!("Run record appended to {}", path.display());
        Ok(path)
    }

    /// Reads every record in a run record file
    pub fn read_all(path: &Path) -> Result<Vec<RunRecord>> {
        fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_keeps_previous_runs() {
        let dir = TempDir::new().unwrap();
        let mut config = TrainingConfig::default();

        RunRecord::new(&config, "train", 1).append(dir.path()).unwrap();
        config.optimizer.learning_rate = 0.05;
        let path = RunRecord::new(&config, "train", 6).append(dir.path()).unwrap();

        let records = RunRecord::read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].optimizer.learning_rate, 0.01);
        assert_eq!(records[1].optimizer.learning_rate, 0.05);
        assert_eq!(records[1].start_epoch, 6);
        assert_eq!(records[1].scheduler.name(), "ReduceLROnPlateau");
        assert_eq!(records[0].optimizer.name, "SGD");
    }
}
