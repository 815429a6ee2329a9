//! Reassembly of chip predictions into full-resolution label maps.
//!
//! A [`TileStitcher`] is built for one inference pass with the dimensions of
//! every image that will be tiled. Chips arrive in batches; each chip's class
//! scores are merged into its image's buffer at the chip's offset. Once an
//! image has received every chip of its grid, the buffer is reduced with a
//! channel argmax and emitted. Images are emitted in completion order.
//!
//! Every image must be complete by the batch flagged as last. Anything else
//! (missing, duplicated or misplaced chips) means the tiling and the
//! stitching disagree and is reported as [`Error::Stitching`].
//!
//! Errors are fatal for the pass. When a push fails partway through a
//! batch, images that batch had already completed are discarded with the
//! error and are never emitted; a new pass needs a new stitcher.

use std::collections::{HashMap, HashSet, VecDeque};
use std::iter::FusedIterator;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tiling::ChipGrid;
use crate::types::{Chip, ImageDimensions, ImageId, LabelMap};

/// How scores from overlapping chips are merged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Scores are summed, so the argmax acts as an ensemble over overlaps
    #[default]
    Sum,
    /// Per-pixel, per-class maximum
    Max,
    /// The most recent chip wins
    Overwrite,
}

impl OverlapPolicy {
    fn initial_score(&self) -> f32 {
        match self {
            OverlapPolicy::Sum | OverlapPolicy::Overwrite => 0.0,
            OverlapPolicy::Max => f32::NEG_INFINITY,
        }
    }

    fn merge(&self, acc: &mut f32, score: f32) {
        match self {
            OverlapPolicy::Sum => *acc += score,
            OverlapPolicy::Max => *acc = acc.max(score),
            OverlapPolicy::Overwrite => *acc = score,
        }
    }
}

impl std::fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlapPolicy::Sum => write!(f, "sum"),
            OverlapPolicy::Max => write!(f, "max"),
            OverlapPolicy::Overwrite => write!(f, "overwrite"),
        }
    }
}

/// One batch of chip predictions
#[derive(Debug, Clone)]
pub struct ChipBatch {
    pub chips: Vec<Chip>,
    /// Set on the final batch of the pass
    pub is_last: bool,
}

impl ChipBatch {
    pub fn new(chips: Vec<Chip>, is_last: bool) -> Self {
        Self { chips, is_last }
    }
}

/// A finished image
#[derive(Debug, Clone, PartialEq)]
pub struct StitchedImage {
    pub image_id: ImageId,
    pub labels: LabelMap,
}

/// Partially filled accumulation buffer for one image
struct ReconstructionBuffer {
    dims: ImageDimensions,
    scores: Vec<f32>,
    pending: HashSet<(usize, usize)>,
    received: HashSet<(usize, usize)>,
}

impl ReconstructionBuffer {
    fn new(dims: ImageDimensions, num_classes: usize, grid: &ChipGrid, policy: OverlapPolicy) -> Result<Self> {
        let pending: HashSet<_> = grid.offsets(dims)?.into_iter().collect();
        Ok(Self {
            dims,
            scores: vec![policy.initial_score(); num_classes * dims.pixels()],
            received: HashSet::with_capacity(pending.len()),
            pending,
        })
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    fn accumulate(&mut self, chip: &Chip, chip_size: usize, num_classes: usize, policy: OverlapPolicy) {
        let (row, col) = (chip.position.row, chip.position.col);
        let plane = self.dims.pixels();
        let chip_plane = chip_size * chip_size;

        for class in 0..num_classes {
            for y in 0..chip_size {
                let src = class * chip_plane + y * chip_size;
                let dst = class * plane + (row + y) * self.dims.width + col;
                let src_row = &chip.scores[src..src + chip_size];
                let dst_row = &mut self.scores[dst..dst + chip_size];
                for (acc, &score) in dst_row.iter_mut().zip(src_row) {
                    policy.merge(acc, score);
                }
            }
        }
    }

    fn finalize(self, num_classes: usize) -> Result<LabelMap> {
        let plane = self.dims.pixels();
        let labels = (0..plane)
            .map(|pixel| {
                let mut best_class = 0u32;
                let mut best_score = self.scores[pixel];
                for class in 1..num_classes {
                    let score = self.scores[class * plane + pixel];
                    if score > best_score {
                        best_score = score;
                        best_class = class as u32;
                    }
                }
                best_class
            })
            .collect();

        LabelMap::new(self.dims, labels)
    }
}

/// Reassembles chip predictions of one inference pass
pub struct TileStitcher {
    grid: ChipGrid,
    num_classes: usize,
    policy: OverlapPolicy,
    /// Registered images not yet touched by any chip
    waiting: HashMap<ImageId, ImageDimensions>,
    buffers: HashMap<ImageId, ReconstructionBuffer>,
    finished: bool,
}

impl TileStitcher {
    /// Creates a stitcher expecting chips for every image in `images`
    pub fn new(
        images: impl IntoIterator<Item = (ImageId, ImageDimensions)>,
        grid: ChipGrid,
        num_classes: usize,
        policy: OverlapPolicy,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::Config("num_classes must be greater than 0".into()));
        }

        let mut waiting = HashMap::new();
        for (id, dims) in images {
            // Surface images the grid cannot tile before any chip arrives
            grid.expected_chip_count(dims)?;
            if waiting.insert(id.clone(), dims).is_some() {
                return Err(Error::Stitching(format!("image {id} registered twice")));
            }
        }

        Ok(Self {
            grid,
            num_classes,
            policy,
            waiting,
            buffers: HashMap::new(),
            finished: false,
        })
    }

    /// Number of images not yet emitted
    pub fn pending(&self) -> usize {
        self.waiting.len() + self.buffers.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Merges a batch of chips, returning the images it completed.
    ///
    /// On error, images completed earlier in the same batch are dropped.
    pub fn push(&mut self, batch: ChipBatch) -> Result<Vec<StitchedImage>> {
        if self.finished {
            return Err(Error::Stitching(
                "chips received after the last batch of the pass".into(),
            ));
        }

        let mut completed = Vec::new();
        for chip in &batch.chips {
            if let Some(image) = self.add_chip(chip)? {
                completed.push(image);
            }
        }

        if batch.is_last {
            self.finish()?;
        }

        Ok(completed)
    }

    /// Declares the pass over; fails if any image is still incomplete
    pub fn finish(&mut self) -> Result<()> {
        self.finished = true;

        if self.pending() == 0 {
            return Ok(());
        }

        let mut incomplete: Vec<String> = self
            .buffers
            .iter()
            .map(|(id, buffer)| format!("{id} ({} chips missing)", buffer.pending.len()))
            .chain(self.waiting.keys().map(|id| format!("{id} (no chips received)")))
            .collect();
        incomplete.sort();

        Err(Error::Stitching(format!(
            "{} image(s) incomplete at the last batch, check chip_size/stride: {}",
            incomplete.len(),
            incomplete.join(", ")
        )))
    }

    fn add_chip(&mut self, chip: &Chip) -> Result<Option<StitchedImage>> {
        let id = &chip.position.image_id;
        let chip_size = self.grid.chip_size();

        let expected_len = self.num_classes * chip_size * chip_size;
        if chip.scores.len() != expected_len {
            return Err(Error::ShapeMismatch {
                expected: format!(
                    "{expected_len} scores ({} classes x {chip_size}x{chip_size})",
                    self.num_classes
                ),
                actual: format!("{} scores for chip of image {id}", chip.scores.len()),
            });
        }

        if let Some(dims) = self.waiting.remove(id) {
            let buffer = ReconstructionBuffer::new(dims, self.num_classes, &self.grid, self.policy)?;
            self.buffers.insert(id.clone(), buffer);
        }

        let buffer = self.buffers.get_mut(id).ok_or_else(|| {
            Error::Stitching(format!("chip for unknown or already emitted image {id}"))
        })?;

        let offset = (chip.position.row, chip.position.col);
        if !buffer.pending.remove(&offset) {
            return Err(if buffer.received.contains(&offset) {
                Error::Stitching(format!(
                    "duplicate chip at ({}, {}) for image {id}",
                    offset.0, offset.1
                ))
            } else {
                Error::Stitching(format!(
                    "chip at ({}, {}) is not on the {}x{} grid of image {id} ({})",
                    offset.0, offset.1, chip_size, self.grid.stride(), buffer.dims
                ))
            });
        }
        buffer.received.insert(offset);
        buffer.accumulate(chip, chip_size, self.num_classes, self.policy);

        if !buffer.is_complete() {
            return Ok(None);
        }

        let Some(buffer) = self.buffers.remove(id) else {
            return Ok(None);
        };
        debug!("Image {} complete after {} chips", id, buffer.received.len());

        Ok(Some(StitchedImage {
            image_id: id.clone(),
            labels: buffer.finalize(self.num_classes)?,
        }))
    }
}

/// Lazily stitches a stream of chip batches
///
/// Yields each image as soon as it completes. The stream ending without a
/// batch flagged as last is treated like a last batch. After the first error
/// the iterator is exhausted; images completed by the failing batch are not
/// yielded.
pub struct Stitched<I> {
    batches: I,
    stitcher: TileStitcher,
    ready: VecDeque<StitchedImage>,
    done: bool,
}

impl<I> Stitched<I>
where
    I: Iterator<Item = ChipBatch>,
{
    pub fn new(batches: I, stitcher: TileStitcher) -> Self {
        Self {
            batches,
            stitcher,
            ready: VecDeque::new(),
            done: false,
        }
    }
}

impl<I> Iterator for Stitched<I>
where
    I: Iterator<Item = ChipBatch>,
{
    type Item = Result<StitchedImage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(image) = self.ready.pop_front() {
                return Some(Ok(image));
            }
            if self.done {
                return None;
            }

            let outcome = match self.batches.next() {
                Some(batch) => {
                    let is_last = batch.is_last;
                    let outcome = self.stitcher.push(batch);
                    if is_last {
                        self.done = true;
                    }
                    outcome
                }
                None => {
                    self.done = true;
                    if self.stitcher.is_finished() {
                        Ok(Vec::new())
                    } else {
                        self.stitcher.finish().map(|_| Vec::new())
                    }
                }
            };

            match outcome {
                Ok(images) => self.ready.extend(images),
                Err(err) => {
                    self.done = true;
                    self.ready.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}

impl<I> FusedIterator for Stitched<I> where I: Iterator<Item = ChipBatch> {}

/// Stitches `batches` with `stitcher`, see [`Stitched`]
pub fn stitch<I>(batches: I, stitcher: TileStitcher) -> Stitched<I::IntoIter>
where
    I: IntoIterator<Item = ChipBatch>,
{
    Stitched::new(batches.into_iter(), stitcher)
}
