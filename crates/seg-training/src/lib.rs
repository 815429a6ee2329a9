//! Training infrastructure for tiled segmentation.
//!
//! This crate provides:
//! - The segmentation model capability and a small default network
//! - Learning rate scheduling with persistable state
//! - Checkpoints and weight snapshots written by atomic replace
//! - Sliding-window validation through the tile stitcher
//! - The epoch loop

pub mod checkpoint;
pub mod lr_schedule;
pub mod model;
pub mod run_record;
pub mod trainer;
pub mod validation;

pub use checkpoint::{Checkpoint, CheckpointMetadata};
pub use lr_schedule::{LearningRateScheduler, SchedulerState};
pub use model::{SegmentationModel, TinySegNet, TinySegNetConfig};
pub use run_record::RunRecord;
pub use trainer::{EpochSummary, Trainer, HISTORY_FILE};
pub use validation::Validator;

/// Re-export commonly used types
pub mod prelude {
    pub use super::checkpoint::{Checkpoint, CheckpointMetadata};
    pub use super::lr_schedule::{LearningRateScheduler, SchedulerState};
    pub use super::model::{SegmentationModel, TinySegNet, TinySegNetConfig};
    pub use super::trainer::Trainer;
    pub use super::validation::Validator;
}
