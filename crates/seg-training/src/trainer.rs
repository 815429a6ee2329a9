//! Epoch loop for segmentation training.
//!
//! Each epoch shuffles the training set with a seeded RNG, drops the last
//! incomplete batch, and runs forward / pixel-wise cross-entropy / backward /
//! SGD step per batch. Training predictions feed a confusion matrix that is
//! logged and cleared at the end of the epoch, and the scheduler is stepped
//! with the mean epoch loss. Every `save_every` epochs the weights are
//! snapshotted, the checkpoint is written when enabled, and the validation
//! set is scored through the tile stitcher.

use std::marker::PhantomData;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Int, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use seg_core::{
    EpochRecord, Error, Result, SegmentationEvaluator, SegmentationMetrics, TrainingConfig, TrainingHistory,
};
use seg_dataset::{SegmentationBatch, SegmentationBatcher, SegmentationDataset};
use tracing::{info, warn};

use crate::checkpoint::{save_weights, Checkpoint, CheckpointMetadata};
use crate::lr_schedule::LearningRateScheduler;
use crate::model::SegmentationModel;
use crate::validation::Validator;

/// File the per-epoch history is exported to
pub const HISTORY_FILE: &str = "training_history.csv";

/// Summary of one training epoch
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub mean_loss: f64,
    pub learning_rate: f64,
    pub metrics: SegmentationMetrics,
}

/// Drives training of a segmentation model
pub struct Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SegmentationModel<B>,
    M::InnerModule: SegmentationModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    config: TrainingConfig,
    model: M,
    optimizer: O,
    scheduler: LearningRateScheduler,
    evaluator: SegmentationEvaluator,
    history: TrainingHistory,
    device: B::Device,
    start_epoch: usize,
    _backend: PhantomData<B>,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SegmentationModel<B>,
    M::InnerModule: SegmentationModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// Fails when the configuration does not pass [`TrainingConfig::validate`]
    pub fn new(config: TrainingConfig, model: M, optimizer: O, device: B::Device) -> Result<Self> {
        config.validate()?;
        let scheduler = LearningRateScheduler::new(config.scheduler.clone(), config.optimizer.learning_rate);
        let evaluator = SegmentationEvaluator::new(config.data.num_classes);

        Ok(Self {
            config,
            model,
            optimizer,
            scheduler,
            evaluator,
            history: TrainingHistory::new(),
            device,
            start_epoch: 1,
            _backend: PhantomData,
        })
    }

    /// Restores model, optimizer and scheduler; training continues at the
    /// epoch after the saved one
    pub fn resume_from(mut self, checkpoint: &Checkpoint) -> Result<Self> {
        checkpoint.check_compatible(self.config.data.num_classes)?;

        self.model = checkpoint.restore_model::<B, M>(self.model, &self.device)?;
        self.optimizer = checkpoint.restore_optimizer::<B, M, O>(self.optimizer, &self.device)?;
        self.scheduler.restore(checkpoint.scheduler_state.clone())?;
        self.start_epoch = checkpoint.next_epoch();

        info!(
            "Resumed from epoch {} (lr {:.6e}), continuing at epoch {}",
            checkpoint.epoch,
            self.scheduler.get_lr(),
            self.start_epoch
        );
        Ok(self)
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn scheduler(&self) -> &LearningRateScheduler {
        &self.scheduler
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Runs every remaining epoch, then exports the history
    pub fn fit(&mut self, train: &SegmentationDataset, val: Option<&SegmentationDataset>) -> Result<TrainingHistory> {
        train.uniform_dims()?;
        if train.len() < self.config.batch_size {
            return Err(Error::Config(format!(
                "{} training images cannot fill a batch of {}",
                train.len(),
                self.config.batch_size
            )));
        }

        let validator = match val {
            Some(_) => Some(Validator::from_config(&self.config)?),
            None => None,
        };

        if self.start_epoch > self.config.epochs {
            warn!(
                "Checkpoint already covers {} of {} epochs, nothing to train",
                self.start_epoch - 1,
                self.config.epochs
            );
        }

        info!(
            "Training {} images for epochs {}..={} (batch {}, lr {:.6e}, {})",
            train.len(),
            self.start_epoch,
            self.config.epochs,
            self.config.batch_size,
            self.scheduler.get_lr(),
            self.scheduler.describe()
        );

        for epoch in self.start_epoch..=self.config.epochs {
            let summary = self.train_epoch(epoch, train)?;

            let mut record = EpochRecord {
                epoch,
                loss: summary.mean_loss,
                learning_rate: summary.learning_rate,
                pixel_accuracy: summary.metrics.pixel_accuracy,
                mean_iou: summary.metrics.mean_iou,
                val_mean_iou: None,
            };

            if epoch % self.config.checkpoint.save_every == 0 {
                self.save_epoch(epoch)?;

                if let (Some(validator), Some(val)) = (&validator, val) {
                    let inner = self.model.valid();
                    let metrics = validator.validate::<B::InnerBackend, _>(&inner, val, &self.device)?;
                    record.val_mean_iou = metrics.mean_iou;
                }
            }

            self.history.push(record);
        }

        let history_path = self.config.checkpoint.save_model_path.join(HISTORY_FILE);
        self.history.export_csv(&history_path)?;

        if let Some(best) = self.history.best_loss_epoch() {
            info!("Training complete, lowest loss at epoch {}", best);
        }
        Ok(self.history.clone())
    }

    /// One pass over the shuffled training set.
    ///
    /// The batch order depends only on the seed and the epoch number, so a
    /// resumed run sees the same batches as an uninterrupted one.
    pub fn train_epoch(&mut self, epoch: usize, train: &SegmentationDataset) -> Result<EpochSummary> {
        let batch_size = self.config.batch_size;
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
        indices.shuffle(&mut rng);
        let num_batches = indices.len() / batch_size;

        let learning_rate = self.scheduler.get_lr();
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);

        let pb = ProgressBar::new(num_batches as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("  {spinner:.cyan} epoch {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_prefix(epoch.to_string());

        let mut epoch_loss = 0.0f64;
        for batch_indices in indices.chunks_exact(batch_size) {
            let items: Vec<_> = batch_indices.iter().filter_map(|&i| train.get(i)).collect();
            let batch: SegmentationBatch<B> = Batcher::<B, _, _>::batch(&SegmentationBatcher, items, &self.device);

            let logits = self.model.forward(batch.images);
            let [n, c, h, w] = logits.dims();
            if c != self.config.data.num_classes {
                return Err(Error::ShapeMismatch {
                    expected: format!("{} class channels", self.config.data.num_classes),
                    actual: format!("{c} class channels"),
                });
            }

            let flat_logits = logits.swap_dims(1, 3).swap_dims(1, 2).reshape([n * h * w, c]);
            let flat_targets: Tensor<B, 1, Int> = batch.targets.reshape([n * h * w]);

            let predicted = flat_logits.clone().argmax(1).reshape([n * h * w]);
            self.accumulate(predicted, flat_targets.clone())?;

            let loss = loss_fn.forward(flat_logits, flat_targets);
            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(Error::Training(format!("loss diverged at epoch {epoch}: {loss_value}")));
            }
            epoch_loss += loss_value;

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self.optimizer.step(learning_rate, self.model.clone(), grads);

            pb.set_message(format!("loss {loss_value:.4}"));
            pb.inc(1);
        }
        pb.finish_and_clear();

        let mean_loss = epoch_loss / num_batches.max(1) as f64;
        info!("epoch: {}    loss: {:.5}", epoch, mean_loss);
        let metrics = self.evaluator.log_metrics();
        self.evaluator.clear();
        self.scheduler.step(mean_loss);

        Ok(EpochSummary {
            epoch,
            mean_loss,
            learning_rate,
            metrics,
        })
    }

    fn accumulate(&mut self, predicted: Tensor<B, 1, Int>, truth: Tensor<B, 1, Int>) -> Result<()> {
        let to_labels = |t: Tensor<B, 1, Int>| -> Result<Vec<u32>> {
            let values: Vec<i64> = t
                .into_data()
                .convert::<i64>()
                .to_vec()
                .map_err(|e| Error::Training(format!("Failed to read labels: {e:?}")))?;
            Ok(values.into_iter().map(|v| v as u32).collect())
        };

        self.evaluator.accumulate(&to_labels(predicted)?, &to_labels(truth)?)
    }

    /// Writes the weight snapshot and, when enabled, the checkpoint
    fn save_epoch(&self, epoch: usize) -> Result<()> {
        save_weights::<B, M>(&self.model, &self.config.checkpoint.save_model_path, epoch)?;

        if self.config.checkpoint.mode.writes() {
            let checkpoint = Checkpoint::capture::<B, M, O>(
                epoch,
                &self.model,
                &self.optimizer,
                &self.scheduler,
                self.metadata(),
            )?;
            checkpoint.save(&self.config.checkpoint.path)?;
        }
        Ok(())
    }

    fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            model_name: self.config.model.name.clone(),
            num_classes: self.config.data.num_classes,
            num_parameters: self.model.num_params(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
