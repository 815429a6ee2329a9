//! Segmentation Training CLI Tool
//!
//! Trains a segmentation network on paired image / ground-truth directories
//! and scores it on a validation set by stitching chip predictions back into
//! full images. Settings come from an optional TOML file with command-line
//! overrides on top.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::SgdConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::Parser;
use seg_core::{load_toml_config, setup_cli_logging, CheckpointMode, Device, TrainingConfig};
use seg_dataset::SegmentationDataset;
use seg_training::checkpoint::load_weights;
use seg_training::{Checkpoint, RunRecord, TinySegNet, TinySegNetConfig, Trainer, Validator};
use tracing::{info, warn};

/// Tiled Segmentation Training Tool
#[derive(Parser, Debug)]
#[command(
    name = "seg-train",
    version,
    about = "Train and validate tiled image segmentation models",
    long_about = "Train a segmentation network on image / ground-truth pairs. Validation cuts each \
                  image into overlapping chips and stitches the per-chip class scores back into a \
                  full label map before scoring."
)]
struct Args {
    /// Path to training configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Training data directory (contains image/ and gt/)
    #[arg(long, value_name = "DIR")]
    train_data: Option<PathBuf>,

    /// Validation data directory (contains image/ and gt/)
    #[arg(long, value_name = "DIR")]
    val_data: Option<PathBuf>,

    /// Directory for weight snapshots, history and run record
    #[arg(long, value_name = "DIR")]
    save_model_path: Option<PathBuf>,

    /// Override batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Override number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Override learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Override random seed
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Override number of classes
    #[arg(long, value_name = "N")]
    num_classes: Option<usize>,

    /// Validation chip edge length
    #[arg(long, value_name = "PX")]
    chip_size: Option<usize>,

    /// Validation chip stride
    #[arg(long, value_name = "PX")]
    stride: Option<usize>,

    /// Checkpoint handling: none, save or load
    #[arg(long, value_name = "MODE")]
    checkpoint_mode: Option<CheckpointMode>,

    /// Checkpoint file
    #[arg(long, value_name = "FILE")]
    checkpoint_path: Option<PathBuf>,

    /// Compute device: cpu, gpu, gpu:N or auto
    #[arg(long, value_name = "DEVICE")]
    device: Option<Device>,

    /// Validate only (no training)
    #[arg(long, requires = "weights")]
    validate_only: bool,

    /// Weight snapshot to validate
    #[arg(long, value_name = "FILE")]
    weights: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Dry run (validate config without training)
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    info!("Tiled Segmentation - Training Tool");
    info!("==================================");

    let mut config = match &args.config {
        Some(path) => load_toml_config::<TrainingConfig>(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
        None => TrainingConfig::default(),
    };
    apply_overrides(&mut config, &args);

    config.validate().context("Invalid configuration")?;
    config
        .validate_paths(!args.validate_only)
        .context("Invalid data paths")?;
    if args.validate_only && config.data.val_data_path.is_none() {
        anyhow::bail!("--validate-only needs a validation directory (--val-data)");
    }

    let device = config.device.resolve(cfg!(feature = "wgpu"));
    print_config_summary(&config, device);

    if args.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    match device {
        #[cfg(feature = "wgpu")]
        Device::Gpu(id) => {
            use burn::backend::wgpu::{Wgpu, WgpuDevice};
            dispatch::<Autodiff<Wgpu>>(&config, &args, WgpuDevice::DiscreteGpu(id))
        }
        _ => dispatch::<Autodiff<NdArray>>(&config, &args, NdArrayDevice::Cpu),
    }
}

fn apply_overrides(config: &mut TrainingConfig, args: &Args) {
    if let Some(ref path) = args.train_data {
        config.data.train_data_path = path.clone();
    }
    if let Some(ref path) = args.val_data {
        config.data.val_data_path = Some(path.clone());
    }
    if let Some(ref path) = args.save_model_path {
        config.checkpoint.save_model_path = path.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(lr) = args.lr {
        config.optimizer.learning_rate = lr;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(num_classes) = args.num_classes {
        config.data.num_classes = num_classes;
    }
    if let Some(chip_size) = args.chip_size {
        config.tiling.chip_size = chip_size;
    }
    if let Some(stride) = args.stride {
        config.tiling.stride = stride;
    }
    if let Some(mode) = args.checkpoint_mode {
        config.checkpoint.mode = mode;
    }
    if let Some(ref path) = args.checkpoint_path {
        config.checkpoint.path = path.clone();
    }
    if let Some(device) = args.device {
        config.device = device;
    }
}

fn print_config_summary(config: &TrainingConfig, device: Device) {
    info!("");
    info!("Configuration Summary:");
    info!("  Model: {} (base channels {})", config.model.name, config.model.base_channels);
    info!("  Classes: {}", config.data.num_classes);
    info!("  Epochs: {}", config.epochs);
    info!("  Batch size: {}", config.batch_size);
    info!("  Learning rate: {}", config.optimizer.learning_rate);
    info!("  Momentum: {}", config.optimizer.momentum);
    info!("  LR Scheduler: {}", config.scheduler.name());
    info!("  Seed: {}", config.seed);
    info!("  Device: {} (requested {})", device, config.device);
    info!("  Train dir: {}", config.data.train_data_path.display());
    match &config.data.val_data_path {
        Some(path) => info!("  Val dir: {}", path.display()),
        None => info!("  Val dir: none"),
    }
    info!(
        "  Chips: {}px stride {} ({} overlap)",
        config.tiling.chip_size, config.tiling.stride, config.tiling.overlap_policy
    );
    info!("  Checkpoint: {} ({})", config.checkpoint.mode, config.checkpoint.path.display());
    info!("  Output dir: {}", config.checkpoint.save_model_path.display());
    info!("");
}

fn dispatch<B: AutodiffBackend>(config: &TrainingConfig, args: &Args, device: B::Device) -> Result<()> {
    B::seed(config.seed);

    if args.validate_only {
        let weights = args
            .weights
            .as_ref()
            .context("--validate-only needs --weights")?;
        run_validation::<B::InnerBackend>(config, weights, &device)
    } else {
        run_training::<B>(config, device)
    }
}

fn run_training<B: AutodiffBackend>(config: &TrainingConfig, device: B::Device) -> Result<()> {
    info!("Loading dataset...");
    let train = SegmentationDataset::load(&config.data.train_data_path, config.data.num_classes)
        .context("Failed to load training data")?;
    let val = match &config.data.val_data_path {
        Some(path) => Some(
            SegmentationDataset::load(path, config.data.num_classes).context("Failed to load validation data")?,
        ),
        None => None,
    };

    let model: TinySegNet<B> = TinySegNetConfig::new(config.data.num_classes)
        .with_base_channels(config.model.base_channels)
        .init(&device);

    let momentum = (config.optimizer.momentum > 0.0)
        .then(|| MomentumConfig::new().with_momentum(config.optimizer.momentum));
    let optimizer = SgdConfig::new()
        .with_momentum(momentum)
        .with_weight_decay(config.optimizer.weight_decay.map(|w| WeightDecayConfig::new(w as f32)))
        .init::<B, TinySegNet<B>>();

    let mut trainer = Trainer::new(config.clone(), model, optimizer, device).context("Failed to set up training")?;

    if config.checkpoint.mode == CheckpointMode::Load {
        info!("Resuming from checkpoint: {}", config.checkpoint.path.display());
        let checkpoint = Checkpoint::load(&config.checkpoint.path).context("Failed to load checkpoint")?;
        trainer = trainer.resume_from(&checkpoint).context("Failed to resume from checkpoint")?;
    }

    let record = RunRecord::new(config, "train", trainer.start_epoch());
    let record_path = record
        .append(&config.checkpoint.save_model_path)
        .context("Failed to write run record")?;
    info!("Run configuration recorded in {}", record_path.display());

    let history = trainer.fit(&train, val.as_ref()).context("Training failed")?;

    match history.best_val_mean_iou() {
        Some(miou) => info!("Best validation mIoU: {:.4}", miou),
        None if val.is_some() => warn!("No validation pass ran (epochs < save_every?)"),
        None => {}
    }
    info!("Training completed successfully!");
    Ok(())
}

fn run_validation<B: Backend>(config: &TrainingConfig, weights: &Path, device: &B::Device) -> Result<()> {
    let Some(val_path) = &config.data.val_data_path else {
        anyhow::bail!("No validation directory configured");
    };

    let val = SegmentationDataset::load(val_path, config.data.num_classes).context("Failed to load validation data")?;

    let model: TinySegNet<B> = TinySegNetConfig::new(config.data.num_classes)
        .with_base_channels(config.model.base_channels)
        .init(device);
    let model = load_weights::<B, _>(model, weights, device)
        .with_context(|| format!("Failed to load weights {}", weights.display()))?;

    RunRecord::new(config, "validate", 0)
        .append(&config.checkpoint.save_model_path)
        .context("Failed to write run record")?;

    let metrics = Validator::from_config(config)?
        .validate::<B, _>(&model, &val, device)
        .context("Validation failed")?;

    match metrics.mean_iou {
        Some(miou) => info!("Validation mIoU: {:.4}", miou),
        None => warn!("Validation set has no labelled pixels"),
    }
    Ok(())
}
