//! Burn dataset and batcher for full-image segmentation training.

use std::path::Path;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use seg_core::{Error, ImageDimensions, ImageId, LabelMap, Result};
use tracing::info;

use crate::loader::PairedImageLoader;

/// ImageNet channel statistics used to normalise inputs
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A decoded image and its ground truth
#[derive(Debug, Clone)]
pub struct SegmentationItem {
    pub id: ImageId,
    /// CHW floats in `[0, 1]`
    pub image: Vec<f32>,
    pub labels: LabelMap,
}

impl SegmentationItem {
    pub fn dims(&self) -> ImageDimensions {
        self.labels.dims()
    }
}

/// In-memory dataset of decoded pairs
#[derive(Debug, Clone, Default)]
pub struct SegmentationDataset {
    items: Vec<SegmentationItem>,
}

impl SegmentationDataset {
    pub fn from_items(items: Vec<SegmentationItem>) -> Self {
        Self { items }
    }

    /// Loads every pair under `root` into memory
    pub fn load(root: &Path, num_classes: usize) -> Result<Self> {
        let loader = PairedImageLoader::new(root, num_classes);
        let pairs = loader.scan()?;

        info!("Loading {} images from {}", pairs.len(), root.display());
        let pb = ProgressBar::new(pairs.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut items = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            let (_, image, labels) = loader.load_pair(pair)?;
            items.push(SegmentationItem {
                id: pair.id.clone(),
                image,
                labels,
            });
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(Self { items })
    }

    pub fn items(&self) -> &[SegmentationItem] {
        &self.items
    }

    /// Shared dimensions of every item; training batches need them equal
    pub fn uniform_dims(&self) -> Result<ImageDimensions> {
        let first = self
            .items
            .first()
            .ok_or_else(|| Error::Dataset("dataset is empty".into()))?
            .dims();

        if let Some(other) = self.items.iter().find(|item| item.dims() != first) {
            return Err(Error::Config(format!(
                "All training images must share dimensions: {} is {} but {} is {}",
                self.items[0].id,
                first,
                other.id,
                other.dims()
            )));
        }

        Ok(first)
    }
}

impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Batch of training images
#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// `[batch, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch, height, width]`
    pub targets: Tensor<B, 3, Int>,
}

/// Stacks items of equal size into a normalised batch
#[derive(Clone, Debug, Default)]
pub struct SegmentationBatcher;

impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let batch_size = items.len();
        let dims = items.first().map(|item| item.dims()).unwrap_or(ImageDimensions::new(0, 0));

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, dims.height, dims.width]),
            device,
        );

        let targets_data: Vec<i64> = items
            .iter()
            .flat_map(|item| item.labels.as_slice().iter().map(|&l| l as i64))
            .collect();
        let targets = Tensor::<B, 3, Int>::from_data(
            TensorData::new(targets_data, [batch_size, dims.height, dims.width]),
            device,
        );

        SegmentationBatch {
            images: normalize(images),
            targets,
        }
    }
}

/// Applies `(x - mean) / std` per channel
pub fn normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 4>::from_floats(TensorData::new(CHANNEL_MEAN.to_vec(), [1, 3, 1, 1]), &device);
    let std = Tensor::<B, 4>::from_floats(TensorData::new(CHANNEL_STD.to_vec(), [1, 3, 1, 1]), &device);
    (images - mean) / std
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::test_support::write_pair;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn test_load_dataset() {
        let dir = TempDir::new().unwrap();
        write_pair(dir.path(), "a", 4, 2, &[0, 1, 1, 0, 1, 1, 0, 0]);
        write_pair(dir.path(), "b", 4, 2, &[1; 8]);

        let dataset = SegmentationDataset::load(dir.path(), 2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.uniform_dims().unwrap(), ImageDimensions::new(2, 4));
        assert_eq!(dataset.get(1).unwrap().labels.as_slice(), &[1; 8]);
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn test_uniform_dims_rejects_mixed_sizes() {
        let dir = TempDir::new().unwrap();
        write_pair(dir.path(), "a", 2, 2, &[0; 4]);
        write_pair(dir.path(), "b", 3, 2, &[0; 6]);

        let dataset = SegmentationDataset::load(dir.path(), 2).unwrap();
        assert!(dataset.uniform_dims().is_err());
        assert!(SegmentationDataset::default().uniform_dims().is_err());
    }

    #[test]
    fn test_batcher_shapes() {
        let item = |id: &str, label: u32| SegmentationItem {
            id: ImageId::new(id),
            image: vec![0.5; 3 * 2 * 3],
            labels: LabelMap::new(ImageDimensions::new(2, 3), vec![label; 6]).unwrap(),
        };

        let device = Default::default();
        let batch: SegmentationBatch<TestBackend> =
            Batcher::<TestBackend, _, _>::batch(&SegmentationBatcher, vec![item("a", 0), item("b", 1)], &device);

        assert_eq!(batch.images.dims(), [2, 3, 2, 3]);
        assert_eq!(batch.targets.dims(), [2, 2, 3]);

        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(&targets[..6], &[0; 6]);
        assert_eq!(&targets[6..], &[1; 6]);

        let red: Vec<f32> = batch.images.into_data().to_vec().unwrap();
        let expected = (0.5 - CHANNEL_MEAN[0]) / CHANNEL_STD[0];
        assert!((red[0] - expected).abs() < 1e-5);
    }
}
