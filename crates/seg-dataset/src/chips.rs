//! Sliding-window chips for validation.
//!
//! Each source image is cut on a [`ChipGrid`]; chips are produced lazily
//! from the decoded image in row-major grid order, image by image.

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use seg_core::{ChipGrid, ChipPosition, ImageDimensions, ImageId, Result};

use crate::dataset::{normalize, SegmentationItem};

/// One chip cut from a source image
#[derive(Debug, Clone)]
pub struct ChipItem {
    pub position: ChipPosition,
    /// CHW floats, `3 × chip_size × chip_size`
    pub image: Vec<f32>,
}

/// Every chip of a set of images, borrowed from the decoded items
#[derive(Debug, Clone)]
pub struct ChipDataset<'a> {
    grid: ChipGrid,
    items: &'a [SegmentationItem],
    /// `(item index, row, col)` for every chip
    index: Vec<(usize, usize, usize)>,
}

impl<'a> ChipDataset<'a> {
    pub fn new(items: &'a [SegmentationItem], grid: ChipGrid) -> Result<Self> {
        let mut index = Vec::new();
        for (source, item) in items.iter().enumerate() {
            for (row, col) in grid.offsets(item.dims())? {
                index.push((source, row, col));
            }
        }

        Ok(Self { grid, items, index })
    }

    pub fn grid(&self) -> ChipGrid {
        self.grid
    }

    /// The source items chips are cut from
    pub fn items(&self) -> &'a [SegmentationItem] {
        self.items
    }

    /// Source images and their sizes, in chip order
    pub fn images(&self) -> Vec<(ImageId, ImageDimensions)> {
        self.items.iter().map(|item| (item.id.clone(), item.dims())).collect()
    }
}

impl Dataset<ChipItem> for ChipDataset<'_> {
    fn get(&self, index: usize) -> Option<ChipItem> {
        let &(source, row, col) = self.index.get(index)?;
        let source = self.items.get(source)?;

        Some(ChipItem {
            position: ChipPosition::new(source.id.clone(), row, col),
            image: extract_chip(&source.image, source.dims(), self.grid.chip_size(), row, col),
        })
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Copies the `chip_size` square at `(row, col)` out of a CHW image
pub fn extract_chip(image: &[f32], dims: ImageDimensions, chip_size: usize, row: usize, col: usize) -> Vec<f32> {
    let channels = image.len() / dims.pixels().max(1);
    let mut chip = Vec::with_capacity(channels * chip_size * chip_size);

    for c in 0..channels {
        let plane = c * dims.pixels();
        for y in row..row + chip_size {
            let start = plane + y * dims.width + col;
            chip.extend_from_slice(&image[start..start + chip_size]);
        }
    }

    chip
}

/// Batch of chips ready for inference
#[derive(Clone, Debug)]
pub struct ChipTensorBatch<B: Backend> {
    /// `[batch, 3, chip_size, chip_size]`
    pub images: Tensor<B, 4>,
    pub positions: Vec<ChipPosition>,
}

/// Stacks chips into a normalised batch
#[derive(Clone, Debug)]
pub struct ChipBatcher {
    chip_size: usize,
}

impl ChipBatcher {
    pub fn new(chip_size: usize) -> Self {
        Self { chip_size }
    }
}

impl<B: Backend> Batcher<B, ChipItem, ChipTensorBatch<B>> for ChipBatcher {
    fn batch(&self, items: Vec<ChipItem>, device: &B::Device) -> ChipTensorBatch<B> {
        let batch_size = items.len();
        let mut data = Vec::with_capacity(batch_size * 3 * self.chip_size * self.chip_size);
        let mut positions = Vec::with_capacity(batch_size);

        for item in items {
            data.extend_from_slice(&item.image);
            positions.push(item.position);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(data, [batch_size, 3, self.chip_size, self.chip_size]),
            device,
        );

        ChipTensorBatch {
            images: normalize(images),
            positions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use seg_core::LabelMap;

    fn item(id: &str, height: usize, width: usize) -> SegmentationItem {
        let plane = height * width;
        // channel c, pixel p holds c * 100 + p
        let image = (0..3 * plane).map(|i| ((i / plane) * 100 + i % plane) as f32).collect();
        SegmentationItem {
            id: ImageId::new(id),
            image,
            labels: LabelMap::new(ImageDimensions::new(height, width), vec![0; plane]).unwrap(),
        }
    }

    #[test]
    fn test_extract_chip() {
        let source = item("a", 4, 4);
        let chip = extract_chip(&source.image, source.dims(), 2, 2, 1);
        assert_eq!(chip.len(), 12);
        assert_eq!(&chip[..4], &[9.0, 10.0, 13.0, 14.0]);
        assert_eq!(&chip[4..8], &[109.0, 110.0, 113.0, 114.0]);
    }

    #[test]
    fn test_chip_dataset_covers_every_grid_offset() {
        let grid = ChipGrid::new(2, 1).unwrap();
        let items = [item("a", 3, 3), item("b", 2, 4)];
        let dataset = ChipDataset::new(&items, grid).unwrap();

        // a: 2x2 offsets, b: 1x3 offsets
        assert_eq!(dataset.len(), 4 + 3);
        assert_eq!(dataset.images().len(), 2);

        let last = dataset.get(6).unwrap();
        assert_eq!(last.position, ChipPosition::new(ImageId::new("b"), 0, 2));
        assert!(dataset.get(7).is_none());
    }

    #[test]
    fn test_chip_dataset_borrows_source_images() {
        let items = vec![item("a", 4, 4), item("b", 4, 4)];
        let dataset = ChipDataset::new(&items, ChipGrid::new(2, 2).unwrap()).unwrap();

        assert!(std::ptr::eq(dataset.items().as_ptr(), items.as_ptr()));
        assert!(std::ptr::eq(dataset.items()[1].image.as_ptr(), items[1].image.as_ptr()));
        assert_eq!(&dataset.get(4).unwrap().image[..4], &[0.0, 1.0, 4.0, 5.0]);
    }

    #[test]
    fn test_chip_dataset_rejects_small_images() {
        let grid = ChipGrid::new(4, 4).unwrap();
        assert!(ChipDataset::new(&[item("a", 2, 8)], grid).is_err());
    }

    #[test]
    fn test_chip_batcher() {
        let grid = ChipGrid::new(2, 2).unwrap();
        let items = [item("a", 2, 4)];
        let dataset = ChipDataset::new(&items, grid).unwrap();
        let chips: Vec<ChipItem> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();

        let device = Default::default();
        let batch: ChipTensorBatch<NdArray> =
            Batcher::<NdArray, _, _>::batch(&ChipBatcher::new(2), chips, &device);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.positions[1].col, 2);
    }
}
