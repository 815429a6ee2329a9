//! Sliding-window chip grid.
//!
//! Along an axis of length `len`, windows start at `0, stride, 2*stride, ...`
//! while they fit. If the last fitting window stops short of the border, one
//! more window is anchored at `len - chip_size` so every pixel is covered.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ImageDimensions;

/// Tiling rule shared by chip generation and stitching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipGrid {
    chip_size: usize,
    stride: usize,
}

impl ChipGrid {
    /// Creates a grid, rejecting strides that would leave gaps
    pub fn new(chip_size: usize, stride: usize) -> Result<Self> {
        if chip_size == 0 {
            return Err(Error::Config("chip_size must be greater than 0".into()));
        }
        if stride == 0 {
            return Err(Error::Config("stride must be greater than 0".into()));
        }
        if stride > chip_size {
            return Err(Error::Config(format!(
                "stride ({stride}) must not exceed chip_size ({chip_size})"
            )));
        }
        Ok(Self { chip_size, stride })
    }

    pub fn chip_size(&self) -> usize {
        self.chip_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Window offsets along one axis
    pub fn axis_offsets(&self, len: usize) -> Result<Vec<usize>> {
        if self.chip_size > len {
            return Err(Error::Config(format!(
                "chip_size ({}) exceeds image extent ({len})",
                self.chip_size
            )));
        }

        let mut offsets: Vec<usize> = (0..)
            .step_by(self.stride)
            .take_while(|offset| offset + self.chip_size <= len)
            .collect();

        if let Some(&last) = offsets.last() {
            if last + self.chip_size < len {
                offsets.push(len - self.chip_size);
            }
        }

        Ok(offsets)
    }

    /// All chip offsets `(row, col)` for an image, row-major
    pub fn offsets(&self, dims: ImageDimensions) -> Result<Vec<(usize, usize)>> {
        let rows = self.axis_offsets(dims.height)?;
        let cols = self.axis_offsets(dims.width)?;

        Ok(rows
            .iter()
            .flat_map(|&row| cols.iter().map(move |&col| (row, col)))
            .collect())
    }

    /// Number of chips the grid produces for an image
    pub fn expected_chip_count(&self, dims: ImageDimensions) -> Result<usize> {
        Ok(self.axis_offsets(dims.height)?.len() * self.axis_offsets(dims.width)?.len())
    }

    /// Whether `(row, col)` is one of the grid's chip offsets for `dims`
    pub fn contains(&self, dims: ImageDimensions, row: usize, col: usize) -> bool {
        let on_axis = |offset: usize, len: usize| {
            self.axis_offsets(len)
                .map(|offsets| offsets.contains(&offset))
                .unwrap_or(false)
        };
        on_axis(row, dims.height) && on_axis(col, dims.width)
    }
}

/// Number of chips produced by tiling `image` with `chip_size` and `stride`
pub fn expected_chip_count(image: ImageDimensions, chip_size: usize, stride: usize) -> Result<usize> {
    ChipGrid::new(chip_size, stride)?.expected_chip_count(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_rejects_bad_parameters() {
        assert!(ChipGrid::new(0, 1).is_err());
        assert!(ChipGrid::new(4, 0).is_err());
        assert!(ChipGrid::new(4, 5).is_err());
        assert!(ChipGrid::new(4, 4).is_ok());
    }

    #[test]
    fn test_non_overlapping_offsets() {
        let grid = ChipGrid::new(2, 2).unwrap();
        assert_eq!(grid.axis_offsets(4).unwrap(), vec![0, 2]);
        assert_eq!(
            grid.offsets(ImageDimensions::new(4, 4)).unwrap(),
            vec![(0, 0), (0, 2), (2, 0), (2, 2)]
        );
    }

    #[test]
    fn test_overlapping_offsets() {
        let grid = ChipGrid::new(4, 2).unwrap();
        assert_eq!(grid.axis_offsets(8).unwrap(), vec![0, 2, 4]);
    }

    #[test]
    fn test_border_window_is_appended() {
        let grid = ChipGrid::new(4, 3).unwrap();
        // 0 and 3 fit; 3 + 4 = 7 < 9 so a final window at 5 covers the edge
        assert_eq!(grid.axis_offsets(9).unwrap(), vec![0, 3, 5]);
    }

    #[test]
    fn test_chip_equal_to_image() {
        let grid = ChipGrid::new(5, 2).unwrap();
        assert_eq!(grid.axis_offsets(5).unwrap(), vec![0]);
    }

    #[test]
    fn test_chip_larger_than_image() {
        let grid = ChipGrid::new(8, 8).unwrap();
        assert!(grid.axis_offsets(4).is_err());
        assert!(grid.expected_chip_count(ImageDimensions::new(4, 16)).is_err());
    }

    #[test]
    fn test_expected_chip_count() {
        assert_eq!(expected_chip_count(ImageDimensions::new(4, 4), 2, 2).unwrap(), 4);
        assert_eq!(expected_chip_count(ImageDimensions::new(8, 9), 4, 3).unwrap(), 2 * 3);
    }

    #[test]
    fn test_offsets_cover_every_pixel() {
        for (len, chip, stride) in [(10, 3, 1), (10, 3, 2), (10, 3, 3), (17, 5, 4), (6, 6, 1)] {
            let grid = ChipGrid::new(chip, stride).unwrap();
            let offsets = grid.axis_offsets(len).unwrap();
            let mut covered = vec![false; len];
            for offset in offsets {
                assert!(offset + chip <= len);
                covered[offset..offset + chip].iter_mut().for_each(|c| *c = true);
            }
            assert!(covered.iter().all(|&c| c), "gap for len={len} chip={chip} stride={stride}");
        }
    }

    #[test]
    fn test_contains() {
        let grid = ChipGrid::new(2, 2).unwrap();
        let dims = ImageDimensions::new(4, 4);
        assert!(grid.contains(dims, 2, 0));
        assert!(!grid.contains(dims, 1, 0));
        assert!(!grid.contains(dims, 4, 0));
    }
}
