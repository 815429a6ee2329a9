//! Segmentation dataset loading and batching.
//!
//! Data roots contain an `image/` and a `gt/` directory whose files are
//! paired by stem. Training items are stacked into Burn batches; validation
//! images are cut into chips on a [`seg_core::ChipGrid`].

pub mod chips;
pub mod dataset;
pub mod loader;

pub use chips::{ChipDataset, ChipItem, ChipTensorBatch, ChipBatcher};
pub use dataset::{SegmentationBatch, SegmentationBatcher, SegmentationDataset, SegmentationItem};
pub use loader::{PairedImageLoader, IMAGE_EXTENSIONS};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::chips::*;
    pub use crate::dataset::*;
    pub use crate::loader::*;
}
