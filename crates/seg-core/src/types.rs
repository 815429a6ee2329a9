//! Core type definitions for tiled segmentation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Identifier of a source image: the file stem shared by an image and its
/// ground truth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Image dimensions in pixels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ImageDimensions {
    /// Image height in pixels
    pub height: usize,
    /// Image width in pixels
    pub width: usize,
}

impl ImageDimensions {
    /// Creates new image dimensions
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Total number of pixels
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

impl fmt::Display for ImageDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Top-left placement of a chip inside its source image
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChipPosition {
    pub image_id: ImageId,
    pub row: usize,
    pub col: usize,
}

impl ChipPosition {
    pub fn new(image_id: ImageId, row: usize, col: usize) -> Self {
        Self { image_id, row, col }
    }
}

/// Class scores predicted for one chip.
///
/// `scores` is channel-major: `num_classes × chip_size × chip_size`.
#[derive(Debug, Clone)]
pub struct Chip {
    pub position: ChipPosition,
    pub scores: Vec<f32>,
}

impl Chip {
    pub fn new(position: ChipPosition, scores: Vec<f32>) -> Self {
        Self { position, scores }
    }
}

/// Dense per-pixel class labels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    dims: ImageDimensions,
    labels: Vec<u32>,
}

impl LabelMap {
    /// Wraps raw labels, checking that their count matches the dimensions
    pub fn new(dims: ImageDimensions, labels: Vec<u32>) -> Result<Self> {
        if labels.len() != dims.pixels() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} labels for {}", dims.pixels(), dims),
                actual: format!("{} labels", labels.len()),
            });
        }
        Ok(Self { dims, labels })
    }

    pub fn dims(&self) -> ImageDimensions {
        self.dims
    }

    pub fn get(&self, row: usize, col: usize) -> Option<u32> {
        if row >= self.dims.height || col >= self.dims.width {
            return None;
        }
        Some(self.labels[row * self.dims.width + col])
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.labels
    }

    pub fn into_vec(self) -> Vec<u32> {
        self.labels
    }
}

/// An image file paired with its ground-truth file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImagePair {
    pub id: ImageId,
    pub image_path: PathBuf,
    pub gt_path: PathBuf,
}

/// Checkpoint handling for a run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// Only weight snapshots are written
    #[default]
    None,
    /// Write a checkpoint alongside every weight snapshot
    Save,
    /// Resume from the checkpoint, then keep saving to it
    Load,
}

impl CheckpointMode {
    /// Whether checkpoints are written during this run
    pub fn writes(&self) -> bool {
        matches!(self, CheckpointMode::Save | CheckpointMode::Load)
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointMode::None => write!(f, "none"),
            CheckpointMode::Save => write!(f, "save"),
            CheckpointMode::Load => write!(f, "load"),
        }
    }
}

impl std::str::FromStr for CheckpointMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CheckpointMode::None),
            "save" => Ok(CheckpointMode::Save),
            "load" => Ok(CheckpointMode::Load),
            other => Err(Error::InvalidArgument(format!(
                "unknown checkpoint mode '{other}' (expected none, save or load)"
            ))),
        }
    }
}
