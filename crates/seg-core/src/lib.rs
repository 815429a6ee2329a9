//! Core types and utilities for tiled segmentation training.
//!
//! This crate holds everything that does not need a tensor runtime: the
//! error type, configuration, the sliding-window chip grid, the tile
//! stitcher that reassembles chip predictions into full label maps, and the
//! streaming confusion-matrix evaluator.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod stitch;
pub mod tiling;
pub mod types;

pub use backend::*;
pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use stitch::{stitch, ChipBatch, OverlapPolicy, Stitched, StitchedImage, TileStitcher};
pub use tiling::{expected_chip_count, ChipGrid};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::stitch::*;
    pub use crate::tiling::*;
    pub use crate::types::*;
}
