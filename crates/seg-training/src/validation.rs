//! Sliding-window validation.
//!
//! Validation images are cut into chips, run through the model in batches,
//! and the softmax scores are stitched back into full label maps before
//! scoring. Each stitched image is compared against its ground truth as soon
//! as it completes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use indicatif::ProgressBar;
use seg_core::{
    Chip, ChipBatch, ChipGrid, Error, ImageId, LabelMap, OverlapPolicy, Result, SegmentationEvaluator,
    SegmentationMetrics, StitchedImage, TileStitcher, TrainingConfig,
};
use seg_dataset::{ChipBatcher, ChipDataset, SegmentationDataset};
use tracing::{debug, info};

use crate::model::SegmentationModel;

/// Validation settings resolved from the configuration
#[derive(Debug, Clone)]
pub struct Validator {
    grid: ChipGrid,
    policy: OverlapPolicy,
    batch_size: usize,
    num_classes: usize,
    save_predictions: Option<PathBuf>,
}

impl Validator {
    pub fn new(grid: ChipGrid, policy: OverlapPolicy, batch_size: usize, num_classes: usize) -> Self {
        Self {
            grid,
            policy,
            batch_size: batch_size.max(1),
            num_classes,
            save_predictions: None,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        let mut validator = Self::new(
            config.tiling.grid()?,
            config.tiling.overlap_policy,
            config.tiling.batch_size,
            config.data.num_classes,
        );
        validator.save_predictions = config.tiling.save_predictions.clone();
        Ok(validator)
    }

    /// Writes stitched label maps as PNG into `dir`
    pub fn with_save_predictions(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_predictions = Some(dir.into());
        self
    }

    /// Runs a full validation pass and returns the metrics
    pub fn validate<B, M>(&self, model: &M, dataset: &SegmentationDataset, device: &B::Device) -> Result<SegmentationMetrics>
    where
        B: Backend,
        M: SegmentationModel<B>,
    {
        if model.num_classes() != self.num_classes {
            return Err(Error::Config(format!(
                "model predicts {} classes but validation expects {}",
                model.num_classes(),
                self.num_classes
            )));
        }

        let chips = ChipDataset::new(dataset.items(), self.grid)?;
        let mut stitcher = TileStitcher::new(chips.images(), self.grid, self.num_classes, self.policy)?;
        let mut evaluator = SegmentationEvaluator::new(self.num_classes);
        let truths: HashMap<&ImageId, &LabelMap> =
            dataset.items().iter().map(|item| (&item.id, &item.labels)).collect();

        let batcher = ChipBatcher::new(self.grid.chip_size());
        let num_batches = chips.len().div_ceil(self.batch_size);
        info!(
            "Validating {} images as {} chips ({}x{} stride {}, {} overlap)",
            dataset.len(),
            chips.len(),
            self.grid.chip_size(),
            self.grid.chip_size(),
            self.grid.stride(),
            self.policy
        );

        let pb = ProgressBar::new(num_batches as u64);
        for batch_idx in 0..num_batches {
            let start = batch_idx * self.batch_size;
            let end = (start + self.batch_size).min(chips.len());
            let items: Vec<_> = (start..end).filter_map(|i| chips.get(i)).collect();

            let batch = Batcher::<B, _, _>::batch(&batcher, items, device);
            let scores = softmax(model.forward(batch.images), 1);
            let scores: Vec<f32> = scores
                .into_data()
                .convert::<f32>()
                .to_vec()
                .map_err(|e| Error::Training(format!("Failed to read chip scores: {e:?}")))?;

            let per_chip = scores.len() / batch.positions.len().max(1);
            let chip_batch = ChipBatch::new(
                batch
                    .positions
                    .into_iter()
                    .zip(scores.chunks(per_chip.max(1)))
                    .map(|(position, scores)| Chip::new(position, scores.to_vec()))
                    .collect(),
                batch_idx + 1 == num_batches,
            );

            for stitched in stitcher.push(chip_batch)? {
                self.score(&stitched, &truths, &mut evaluator)?;
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        if !stitcher.is_finished() {
            stitcher.finish()?;
        }

        Ok(evaluator.log_metrics())
    }

    fn score(
        &self,
        stitched: &StitchedImage,
        truths: &HashMap<&ImageId, &LabelMap>,
        evaluator: &mut SegmentationEvaluator,
    ) -> Result<()> {
        let truth = truths.get(&stitched.image_id).ok_or_else(|| {
            Error::Stitching(format!("no ground truth for stitched image {}", stitched.image_id))
        })?;
        evaluator.accumulate(stitched.labels.as_slice(), truth.as_slice())?;
        debug!("Scored {}", stitched.image_id);

        if let Some(dir) = &self.save_predictions {
            save_label_map(dir, &stitched.image_id, &stitched.labels)?;
        }
        Ok(())
    }
}

/// Writes a label map as an 8-bit grayscale PNG named after the image
pub fn save_label_map(dir: &Path, id: &ImageId, labels: &LabelMap) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let dims = labels.dims();
    let pixels: Vec<u8> = labels.as_slice().iter().map(|&l| l.min(u8::MAX as u32) as u8).collect();

    let img = image::GrayImage::from_raw(dims.width as u32, dims.height as u32, pixels)
        .ok_or_else(|| Error::Image(format!("label map for {id} does not match {dims}")))?;

    let path = dir.join(format!("{id}.png"));
    img.save(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TinySegNetConfig;
    use burn::backend::NdArray;
    use burn::module::Module;
    use burn::tensor::Tensor;
    use seg_core::ImageDimensions;
    use seg_dataset::SegmentationItem;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    /// Predicts class 1 wherever the red channel is bright
    #[derive(Module, Clone, Debug)]
    struct Threshold {
        num_classes: usize,
    }

    impl<B: Backend> SegmentationModel<B> for Threshold {
        fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
            let red = images.narrow(1, 0, 1);
            Tensor::cat(vec![red.clone().neg(), red], 1)
        }

        fn num_classes(&self) -> usize {
            self.num_classes
        }
    }

    fn item(id: &str, height: usize, width: usize, bright: &[bool]) -> SegmentationItem {
        let plane = height * width;
        let mut image = vec![0.5f32; 3 * plane];
        for (p, &on) in bright.iter().enumerate() {
            image[p] = if on { 1.0 } else { 0.0 };
        }
        let labels = bright.iter().map(|&on| on as u32).collect();
        SegmentationItem {
            id: ImageId::new(id),
            image,
            labels: LabelMap::new(ImageDimensions::new(height, width), labels).unwrap(),
        }
    }

    fn dataset() -> SegmentationDataset {
        let a: Vec<bool> = (0..16).map(|p| p % 4 < 2).collect();
        let b: Vec<bool> = (0..24).map(|p| p / 6 >= 2).collect();
        SegmentationDataset::from_items(vec![item("a", 4, 4, &a), item("b", 4, 6, &b)])
    }

    #[test]
    fn test_perfect_model_scores_one() {
        let device = Default::default();
        let validator = Validator::new(ChipGrid::new(2, 1).unwrap(), OverlapPolicy::Sum, 3, 2);

        let metrics = validator
            .validate::<TestBackend, _>(&Threshold { num_classes: 2 }, &dataset(), &device)
            .unwrap();

        assert_eq!(metrics.total_pixels, 16 + 24);
        assert_eq!(metrics.pixel_accuracy, Some(1.0));
        assert_eq!(metrics.mean_iou, Some(1.0));
    }

    #[test]
    fn test_saves_predictions() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let validator = Validator::new(ChipGrid::new(2, 2).unwrap(), OverlapPolicy::Max, 4, 2)
            .with_save_predictions(dir.path());

        validator
            .validate::<TestBackend, _>(&Threshold { num_classes: 2 }, &dataset(), &device)
            .unwrap();

        let saved = image::open(dir.path().join("b.png")).unwrap().to_luma8();
        assert_eq!(saved.dimensions(), (6, 4));
        assert_eq!(saved.get_pixel(0, 3)[0], 1);
        assert_eq!(saved.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_class_count_mismatch() {
        let device = Default::default();
        let model = TinySegNetConfig::new(3).with_base_channels(2).init::<TestBackend>(&device);
        let validator = Validator::new(ChipGrid::new(2, 2).unwrap(), OverlapPolicy::Sum, 2, 2);
        assert!(matches!(
            validator.validate::<TestBackend, _>(&model, &dataset(), &device),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_chip_larger_than_image_is_a_config_error() {
        let device = Default::default();
        let validator = Validator::new(ChipGrid::new(5, 5).unwrap(), OverlapPolicy::Sum, 2, 2);
        assert!(validator
            .validate::<TestBackend, _>(&Threshold { num_classes: 2 }, &dataset(), &device)
            .is_err());
    }
}
