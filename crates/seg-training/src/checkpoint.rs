//! Checkpoints and weight snapshots.
//!
//! A checkpoint is one JSON record holding the epoch, the model and optimizer
//! records as Burn binary bytes, and the scheduler state. Every file written
//! here goes to a sibling temporary file first and is then renamed over the
//! target, so an interrupted save never leaves a truncated file behind.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use seg_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lr_schedule::{LearningRateScheduler, SchedulerState};

type BytesRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Checkpoint containing model, optimizer and scheduler state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last completed epoch
    pub epoch: usize,
    pub model_state: Vec<u8>,
    pub optimizer_state: Vec<u8>,
    pub scheduler_state: SchedulerState,
    pub timestamp: String,
    pub metadata: CheckpointMetadata,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_name: String,
    pub num_classes: usize,
    pub num_parameters: usize,
    pub crate_version: String,
}

impl Checkpoint {
    /// Captures the state of a run at the end of `epoch`
    pub fn capture<B, M, O>(
        epoch: usize,
        model: &M,
        optimizer: &O,
        scheduler: &LearningRateScheduler,
        metadata: CheckpointMetadata,
    ) -> Result<Self>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let optimizer_state = Recorder::<B>::record(&BytesRecorder::default(), optimizer.to_record(), ())
            .map_err(|e| Error::Checkpoint(format!("Failed to record optimizer: {e:?}")))?;

        Ok(Self {
            epoch,
            model_state: model_to_bytes::<B, M>(model)?,
            optimizer_state,
            scheduler_state: scheduler.state(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata,
        })
    }

    /// Epoch a resumed run starts at
    pub fn next_epoch(&self) -> usize {
        self.epoch + 1
    }

    /// Fails when the checkpoint was trained for a different class count
    pub fn check_compatible(&self, num_classes: usize) -> Result<()> {
        if self.metadata.num_classes != num_classes {
            return Err(Error::Config(format!(
                "checkpoint was trained with {} classes but the run is configured with {}",
                self.metadata.num_classes, num_classes
            )));
        }
        Ok(())
    }

    /// Loads the saved weights into `model`
    pub fn restore_model<B: Backend, M: Module<B>>(&self, model: M, device: &B::Device) -> Result<M> {
        model_from_bytes(model, self.model_state.clone(), device)
    }

    /// Loads the saved optimizer state into `optimizer`
    pub fn restore_optimizer<B, M, O>(&self, optimizer: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let record = Recorder::<B>::load(&BytesRecorder::default(), self.optimizer_state.clone(), device)
            .map_err(|e| Error::Checkpoint(format!("Failed to load optimizer state: {e:?}")))?;
        Ok(optimizer.load_record(record))
    }

    /// Save checkpoint to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {}", e)))?;

        write_atomic(path, &json)?;

        info!("epoch {} checkpoint saved to {}", self.epoch, path.display());
        Ok(())
    }

    /// Load checkpoint from file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read(path)
            .map_err(|e| Error::Checkpoint(format!("Failed to read checkpoint {}: {}", path.display(), e)))?;

        let checkpoint: Checkpoint = serde_json::from_slice(&json)
            .map_err(|e| Error::Checkpoint(format!("Malformed checkpoint {}: {}", path.display(), e)))?;

        info!("Checkpoint loaded from {} (epoch {})", path.display(), checkpoint.epoch);
        Ok(checkpoint)
    }
}

/// Serializes a module's record to Burn binary bytes
pub fn model_to_bytes<B: Backend, M: Module<B>>(model: &M) -> Result<Vec<u8>> {
    Recorder::<B>::record(&BytesRecorder::default(), model.clone().into_record(), ())
        .map_err(|e| Error::Checkpoint(format!("Failed to record model: {e:?}")))
}

/// Loads Burn binary bytes into a module
pub fn model_from_bytes<B: Backend, M: Module<B>>(model: M, bytes: Vec<u8>, device: &B::Device) -> Result<M> {
    let record = Recorder::<B>::load(&BytesRecorder::default(), bytes, device)
        .map_err(|e| Error::Checkpoint(format!("Failed to load model record: {e:?}")))?;
    Ok(model.load_record(record))
}

/// Path of the weight snapshot for `epoch` in `dir`
pub fn snapshot_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("model_epoch_{epoch}.bin"))
}

/// Writes `model_epoch_<epoch>.bin` into `dir`
pub fn save_weights<B: Backend, M: Module<B>>(model: &M, dir: &Path, epoch: usize) -> Result<PathBuf> {
    let path = snapshot_path(dir, epoch);
    write_atomic(&path, &model_to_bytes::<B, M>(model)?)?;
    info!("epoch {} model saved to {}", epoch, path.display());
    Ok(path)
}

/// Loads a weight snapshot written by [`save_weights`]
pub fn load_weights<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<M> {
    let bytes = fs::read(path)
        .map_err(|e| Error::NotFound(format!("Failed to read weights {}: {}", path.display(), e)))?;
    model_from_bytes(model, bytes, device)
}

/// Writes `bytes` to a sibling temporary file, then renames it over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("not a file path: {}", path.display())))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, bytes)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SegmentationModel, TinySegNet, TinySegNetConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::loss::CrossEntropyLossConfig;
    use burn::optim::{adaptor::OptimizerAdaptor, momentum::MomentumConfig, GradientsParams, Sgd, SgdConfig};
    use burn::tensor::{Int, Tensor, TensorData};
    use seg_core::SchedulerType;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn metadata() -> CheckpointMetadata {
        CheckpointMetadata {
            model_name: "tiny_segnet".into(),
            num_classes: 2,
            num_parameters: 0,
            crate_version: "test".into(),
        }
    }

    fn model(device: &<TestBackend as Backend>::Device) -> TinySegNet<TestBackend> {
        TinySegNetConfig::new(2).with_base_channels(2).init(device)
    }

    fn input(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        let data: Vec<f32> = (0..3 * 4 * 4).map(|i| (i % 7) as f32 / 7.0).collect();
        Tensor::from_floats(TensorData::new(data, [1, 3, 4, 4]), device)
    }

    fn sgd() -> OptimizerAdaptor<Sgd<NdArray>, TinySegNet<TestBackend>, TestBackend> {
        SgdConfig::new()
            .with_momentum(Some(MomentumConfig::new().with_momentum(0.9)))
            .init::<TestBackend, TinySegNet<TestBackend>>()
    }

    fn grads(net: &TinySegNet<TestBackend>, device: &<TestBackend as Backend>::Device) -> GradientsParams {
        let logits = net.forward(input(device));
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![1i64; 16], [16]), device);
        let loss = CrossEntropyLossConfig::new()
            .init(device)
            .forward(logits.swap_dims(1, 3).swap_dims(1, 2).reshape([16, 2]), targets);
        GradientsParams::from_grads(loss.backward(), net)
    }

    fn max_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        let a: Vec<f32> = a.into_data().to_vec().unwrap();
        let b: Vec<f32> = b.into_data().to_vec().unwrap();
        a.iter().zip(&b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    fn assert_close(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) {
        let a: Vec<f32> = a.into_data().to_vec().unwrap();
        let b: Vec<f32> = b.into_data().to_vec().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }

    #[test]
    fn test_write_atomic_replaces_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[test]
    fn test_load_malformed_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "{\"epoch\": 3}").unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(Error::Checkpoint(_))));
        assert!(Checkpoint::load(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_weight_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let original = model(&device);

        let path = save_weights::<TestBackend, _>(&original, dir.path(), 5).unwrap();
        assert!(path.ends_with("model_epoch_5.bin"));

        let restored = load_weights::<TestBackend, _>(model(&device), &path, &device).unwrap();
        assert_close(original.forward(input(&device)), restored.forward(input(&device)));
    }

    #[test]
    fn test_checkpoint_round_trip_restores_state() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();

        let mut net = model(&device);
        let mut optimizer = sgd();
        let mut scheduler = LearningRateScheduler::new(SchedulerType::default(), 0.01);

        // one real step so the optimizer has momentum state
        let step_grads = grads(&net, &device);
        net = optimizer.step(0.01, net, step_grads);
        scheduler.step(0.7);

        let checkpoint = Checkpoint::capture::<TestBackend, _, _>(7, &net, &optimizer, &scheduler, metadata()).unwrap();
        let path = dir.path().join("checkpoint.json");
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.next_epoch(), 8);
        assert_eq!(loaded.metadata, metadata());
        assert_eq!(loaded.scheduler_state, scheduler.state());
        loaded.check_compatible(2).unwrap();
        assert!(loaded.check_compatible(3).is_err());

        let restored = loaded.restore_model::<TestBackend, _>(model(&device), &device).unwrap();
        assert_close(net.forward(input(&device)), restored.forward(input(&device)));

        let mut restored_optimizer = loaded
            .restore_optimizer::<TestBackend, TinySegNet<TestBackend>, _>(sgd(), &device)
            .unwrap();
        assert_eq!(restored_optimizer.to_record().len(), optimizer.to_record().len());

        // the next step carries the saved velocity, a blank optimizer does not
        let expected = optimizer.step(0.01, net.clone(), grads(&net, &device));
        let continued = restored_optimizer.step(0.01, restored.clone(), grads(&restored, &device));
        let blank = sgd().step(0.01, restored.clone(), grads(&restored, &device));

        assert_close(expected.forward(input(&device)), continued.forward(input(&device)));
        assert!(max_diff(expected.forward(input(&device)), blank.forward(input(&device))) > 1e-6);

        let mut resumed = LearningRateScheduler::new(SchedulerType::default(), 0.01);
        resumed.restore(loaded.scheduler_state).unwrap();
        assert_eq!(resumed.get_lr(), scheduler.get_lr());
        assert_eq!(resumed.current_epoch(), 1);
    }
}
