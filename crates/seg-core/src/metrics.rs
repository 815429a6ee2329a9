//! Segmentation metrics.
//!
//! [`SegmentationEvaluator`] keeps a streaming confusion matrix over every
//! pixel it is fed and derives per-class and aggregate metrics from it
//! without retaining any label maps. [`TrainingHistory`] tracks per-epoch
//! summaries for the run.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};

/// Per-class metrics derived from the confusion matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_id: usize,
    /// Intersection over union, `None` when the class never appears
    pub iou: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    /// Pixels whose true label is this class (row sum)
    pub support: u64,
    /// Pixels predicted as this class (column sum)
    pub predicted: u64,
}

/// Metrics summary for one evaluation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMetrics {
    pub per_class: Vec<ClassMetrics>,
    /// Mean IoU over classes with non-zero support
    pub mean_iou: Option<f64>,
    /// Correct pixels over all pixels
    pub pixel_accuracy: Option<f64>,
    /// Mean recall over classes with non-zero support
    pub mean_class_accuracy: Option<f64>,
    /// IoU weighted by class support
    pub frequency_weighted_iou: Option<f64>,
    pub total_pixels: u64,
}

impl SegmentationMetrics {
    pub fn iou(&self, class_id: usize) -> Option<f64> {
        self.per_class.get(class_id).and_then(|m| m.iou)
    }

    /// Whether any pixel contributed to these metrics
    pub fn has_support(&self) -> bool {
        self.total_pixels > 0
    }
}

/// Streaming confusion-matrix accumulator.
///
/// Rows are true labels, columns predicted labels. Driven from a single
/// sequence of calls per epoch; [`clear`](Self::clear) at the epoch boundary.
#[derive(Debug, Clone)]
pub struct SegmentationEvaluator {
    num_classes: usize,
    matrix: Vec<u64>,
    total: u64,
}

impl SegmentationEvaluator {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
            total: 0,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Adds every pixel of a prediction/ground-truth pair.
    ///
    /// Both slices are flattened label maps of the same shape. Labels outside
    /// `[0, num_classes)` are rejected and nothing from the call is counted.
    pub fn accumulate(&mut self, predicted: &[u32], truth: &[u32]) -> Result<()> {
        if predicted.len() != truth.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} predicted labels", truth.len()),
                actual: format!("{} predicted labels", predicted.len()),
            });
        }

        if let Some(&label) = predicted
            .iter()
            .chain(truth)
            .find(|&&label| label as usize >= self.num_classes)
        {
            return Err(Error::LabelOutOfRange {
                label,
                num_classes: self.num_classes,
            });
        }

        for (&pred, &actual) in predicted.iter().zip(truth) {
            self.matrix[actual as usize * self.num_classes + pred as usize] += 1;
        }
        self.total += predicted.len() as u64;

        Ok(())
    }

    /// Count of pixels with true label `actual` predicted as `predicted`
    pub fn count(&self, actual: usize, predicted: usize) -> u64 {
        if actual >= self.num_classes || predicted >= self.num_classes {
            return 0;
        }
        self.matrix[actual * self.num_classes + predicted]
    }

    /// Total number of accumulated pixels
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Matrix rows (true label major)
    pub fn confusion_matrix(&self) -> Vec<Vec<u64>> {
        self.matrix
            .chunks(self.num_classes.max(1))
            .map(|row| row.to_vec())
            .collect()
    }

    /// Per-class true pixel counts
    pub fn row_sums(&self) -> Vec<u64> {
        (0..self.num_classes)
            .map(|c| (0..self.num_classes).map(|p| self.count(c, p)).sum())
            .collect()
    }

    /// Per-class predicted pixel counts
    pub fn col_sums(&self) -> Vec<u64> {
        (0..self.num_classes)
            .map(|p| (0..self.num_classes).map(|c| self.count(c, p)).sum())
            .collect()
    }

    pub fn trace(&self) -> u64 {
        (0..self.num_classes).map(|c| self.count(c, c)).sum()
    }

    /// Computes metrics from the current matrix without changing it
    pub fn metrics(&self) -> SegmentationMetrics {
        let rows = self.row_sums();
        let cols = self.col_sums();

        let ratio = |num: u64, den: u64| (den > 0).then(|| num as f64 / den as f64);

        let per_class: Vec<ClassMetrics> = (0..self.num_classes)
            .map(|c| {
                let tp = self.count(c, c);
                ClassMetrics {
                    class_id: c,
                    iou: ratio(tp, rows[c] + cols[c] - tp),
                    precision: ratio(tp, cols[c]),
                    recall: ratio(tp, rows[c]),
                    support: rows[c],
                    predicted: cols[c],
                }
            })
            .collect();

        let supported: Vec<&ClassMetrics> = per_class.iter().filter(|m| m.support > 0).collect();
        let mean_of = |values: Vec<f64>| {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };

        let mean_iou = mean_of(supported.iter().filter_map(|m| m.iou).collect());
        let mean_class_accuracy = mean_of(supported.iter().filter_map(|m| m.recall).collect());
        let frequency_weighted_iou = (self.total > 0).then(|| {
            supported
                .iter()
                .map(|m| m.support as f64 / self.total as f64 * m.iou.unwrap_or(0.0))
                .sum()
        });

        SegmentationMetrics {
            per_class,
            mean_iou,
            pixel_accuracy: ratio(self.trace(), self.total),
            mean_class_accuracy,
            frequency_weighted_iou,
            total_pixels: self.total,
        }
    }

    /// Computes the metrics and writes a summary to the log
    pub fn log_metrics(&self) -> SegmentationMetrics {
        let metrics = self.metrics();

        if !metrics.has_support() {
            info!("No pixels accumulated, metrics undefined");
            return metrics;
        }

        info!(
            "pixel_acc={} mean_iou={} mean_class_acc={} fw_iou={} pixels={}",
            fmt_metric(metrics.pixel_accuracy),
            fmt_metric(metrics.mean_iou),
            fmt_metric(metrics.mean_class_accuracy),
            fmt_metric(metrics.frequency_weighted_iou),
            metrics.total_pixels
        );

        let mut per_class = String::new();
        for m in &metrics.per_class {
            let _ = write!(per_class, " {}:{}", m.class_id, fmt_metric(m.iou));
        }
        info!("per-class iou:{}", per_class);

        metrics
    }

    /// Resets the matrix to zero
    pub fn clear(&mut self) {
        self.matrix.iter_mut().for_each(|count| *count = 0);
        self.total = 0;
    }
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"))
}

/// One epoch's summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub learning_rate: f64,
    pub pixel_accuracy: Option<f64>,
    pub mean_iou: Option<f64>,
    /// Mean IoU of the stitched validation pass, when one ran this epoch
    pub val_mean_iou: Option<f64>,
}

/// Per-epoch history of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Epoch with the lowest training loss
    pub fn best_loss_epoch(&self) -> Option<usize> {
        self.epochs
            .iter()
            .min_by(|a, b| a.loss.total_cmp(&b.loss))
            .map(|r| r.epoch)
    }

    /// Best validation mean IoU seen so far
    pub fn best_val_mean_iou(&self) -> Option<f64> {
        self.epochs
            .iter()
            .filter_map(|r| r.val_mean_iou)
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Writes the history as CSV
    pub fn export_csv(&self, path: &Path) -> Result<()> {
        let opt = |v: Option<f64>| v.map(|v| format!("{v:.6}")).unwrap_or_default();

        let mut csv = String::from("epoch,loss,learning_rate,pixel_accuracy,mean_iou,val_mean_iou\n");
        for r in &self.epochs {
            let _ = writeln!(
                csv,
                "{},{:.6},{:.8},{},{},{}",
                r.epoch,
                r.loss,
                r.learning_rate,
                opt(r.pixel_accuracy),
                opt(r.mean_iou),
                opt(r.val_mean_iou)
            );
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, csv)?;
        info!("Training history exported to {}", path.display());
        Ok(())
    }
}
