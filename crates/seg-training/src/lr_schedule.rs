//! Learning rate scheduling.
//!
//! The scheduler is stepped once per epoch with the mean epoch loss. Its
//! mutable state is exposed as [`SchedulerState`] so a checkpoint can carry
//! it and a resumed run continues where the previous one stopped.

use seg_core::{Error, Result, SchedulerType};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Minimum change for a plateau reduction to be applied
const LR_EPSILON: f64 = 1e-8;

/// Persistable scheduler state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub scheduler: SchedulerType,
    pub base_lr: f64,
    pub current_lr: f64,
    /// Number of completed steps
    pub epoch: usize,
    /// Best monitored value so far (plateau only)
    pub best_metric: Option<f64>,
    /// Consecutive steps without improvement (plateau only)
    pub num_bad_epochs: usize,
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    scheduler_type: SchedulerType,
    base_lr: f64,
    current_lr: f64,
    current_epoch: usize,

    // For ReduceLROnPlateau
    best_metric: Option<f64>,
    num_bad_epochs: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_lr: base_lr,
            current_epoch: 0,
            best_metric: None,
            num_bad_epochs: 0,
        }
    }

    /// Get the current learning rate
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn scheduler_type(&self) -> &SchedulerType {
        &self.scheduler_type
    }

    /// Advances one epoch.
    ///
    /// `metric` is the monitored value (lower is better); only
    /// `ReduceLROnPlateau` looks at it.
    pub fn step(&mut self, metric: f64) {
        self.current_epoch += 1;

        match self.scheduler_type {
            SchedulerType::Constant => {}

            SchedulerType::StepLR { step_size, gamma } => {
                if self.current_epoch % step_size == 0 {
                    self.current_lr *= gamma;
                }
            }

            SchedulerType::ExponentialLR { gamma } => {
                self.current_lr *= gamma;
            }

            SchedulerType::ReduceLROnPlateau {
                factor,
                patience,
                threshold,
                min_lr,
            } => {
                let improved = match self.best_metric {
                    Some(best) => metric < best * (1.0 - threshold),
                    None => !metric.is_nan(),
                };

                if improved {
                    self.best_metric = Some(metric);
                    self.num_bad_epochs = 0;
                } else {
                    self.num_bad_epochs += 1;
                }

                if self.num_bad_epochs > patience {
                    let new_lr = (self.current_lr * factor).max(min_lr);
                    if self.current_lr - new_lr > LR_EPSILON {
                        info!(
                            "Reducing learning rate from {:.6e} to {:.6e}",
                            self.current_lr, new_lr
                        );
                        self.current_lr = new_lr;
                    }
                    self.num_bad_epochs = 0;
                }
            }
        }
    }

    /// Snapshot of the mutable state
    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            scheduler: self.scheduler_type.clone(),
            base_lr: self.base_lr,
            current_lr: self.current_lr,
            epoch: self.current_epoch,
            best_metric: self.best_metric,
            num_bad_epochs: self.num_bad_epochs,
        }
    }

    /// Restores a snapshot taken from a scheduler of the same type
    pub fn restore(&mut self, state: SchedulerState) -> Result<()> {
        if state.scheduler.name() != self.scheduler_type.name() {
            return Err(Error::Checkpoint(format!(
                "checkpoint scheduler is {} but the run is configured with {}",
                state.scheduler.name(),
                self.scheduler_type.name()
            )));
        }

        self.scheduler_type = state.scheduler;
        self.base_lr = state.base_lr;
        self.current_lr = state.current_lr;
        self.current_epoch = state.epoch;
        self.best_metric = state.best_metric;
        self.num_bad_epochs = state.num_bad_epochs;
        Ok(())
    }

    /// Short human-readable description
    pub fn describe(&self) -> String {
        match self.scheduler_type {
            SchedulerType::Constant => format!("Constant(lr={})", self.base_lr),
            SchedulerType::StepLR { step_size, gamma } => {
                format!("StepLR(step_size={step_size}, gamma={gamma})")
            }
            SchedulerType::ExponentialLR { gamma } => format!("ExponentialLR(gamma={gamma})"),
            SchedulerType::ReduceLROnPlateau {
                factor,
                patience,
                threshold,
                min_lr,
            } => format!(
                "ReduceLROnPlateau(mode=min, factor={factor}, patience={patience}, threshold={threshold}, min_lr={min_lr})"
            ),
        }
    }
}
