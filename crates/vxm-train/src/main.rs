#![recursion_limit = "256"]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use burn::config::Config;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vxm_train::pipeline;
use vxm_train::{
    ConsoleProgressCallback, CpuBackend, DatasetConfig, DeviceKind, DimMismatchPolicy, GpuBackend, ProgressTracker,
    TrainingConfig,
};

#[derive(Parser)]
#[command(name = "vxm-train")]
#[command(about = "Train a VoxelMorph-style network to register T2 onto T1 MRI volumes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and write registered volumes plus a checkpoint
    Train {
        #[command(flatten)]
        overrides: Overrides,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Write a default configuration file
    InitConfig {
        /// Where to write the JSON configuration
        #[arg(default_value = "train.json")]
        output: PathBuf,

        /// Dataset root recorded in the configuration
        #[arg(long, default_value = "data")]
        data_root: PathBuf,
    },

    /// Score a checkpoint on the validation partition
    Evaluate {
        #[command(flatten)]
        overrides: Overrides,

        /// Checkpoint to load; `.mpk` is implied
        #[arg(long)]
        weights: PathBuf,
    },
}

/// Configuration source plus command-line overrides.
#[derive(Args)]
struct Overrides {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset root containing one directory per patient
    #[arg(long)]
    data_root: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// cpu or gpu
    #[arg(long)]
    device: Option<DeviceKind>,

    /// Data loader threads; 0 reads on the training thread
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Checkpoint path written at the end of training
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Write registered volumes every N batches; 0 disables
    #[arg(long)]
    save_every: Option<usize>,

    /// abort or skip
    #[arg(long)]
    on_dim_mismatch: Option<DimMismatchPolicy>,

    /// Skip the per-epoch validation pass
    #[arg(long)]
    no_validate: bool,

    /// Start from a saved network instead of random weights
    #[arg(long)]
    resume_from: Option<PathBuf>,
}

impl Overrides {
    fn resolve(self) -> Result<TrainingConfig> {
        let mut config = match (&self.config, &self.data_root) {
            (Some(path), _) => load_config(path)?,
            (None, Some(root)) => TrainingConfig::new(DatasetConfig::new(root.clone())),
            (None, None) => bail!("either --config or --data-root is required"),
        };

        if let Some(root) = self.data_root {
            config.dataset.root = root;
        }
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(checkpoint) = self.checkpoint {
            config.checkpoint = checkpoint;
        }
        if let Some(every) = self.save_every {
            config.save_every = every;
        }
        if let Some(policy) = self.on_dim_mismatch {
            config.on_dim_mismatch = policy;
        }
        if self.no_validate {
            config.validate = false;
        }
        if self.resume_from.is_some() {
            config.resume_from = self.resume_from;
        }

        config.validate()?;
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<TrainingConfig> {
    TrainingConfig::load(path).map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { overrides, no_progress } => {
            let config = overrides.resolve()?;
            let mut console = ConsoleProgressCallback::default();
            if no_progress {
                console = console.without_progress_bar();
            }
            let mut tracker = ProgressTracker::new();
            tracker.add_callback(Arc::new(console));

            let report = match config.device {
                DeviceKind::Cpu => pipeline::train::<CpuBackend>(&config, Default::default(), tracker),
                DeviceKind::Gpu => pipeline::train::<GpuBackend>(&config, Default::default(), tracker),
            }?;

            info!(
                "Wrote {} registered volumes to {} and checkpoint {}",
                report.volumes_written.len(),
                config.output_dir.display(),
                report.checkpoint.display()
            );
        }
        Commands::InitConfig { output, data_root } => {
            let config = TrainingConfig::new(DatasetConfig::new(data_root));
            config
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Wrote default configuration to {}", output.display());
        }
        Commands::Evaluate { overrides, weights } => {
            let config = overrides.resolve()?;
            let metrics = match config.device {
                DeviceKind::Cpu => pipeline::evaluate_checkpoint::<CpuBackend>(&config, &weights, Default::default()),
                DeviceKind::Gpu => pipeline::evaluate_checkpoint::<GpuBackend>(&config, &weights, Default::default()),
            }?;
            match (metrics.mean_loss(), metrics.mean_score()) {
                (Some(loss), Some(score)) => info!(
                    "Validation over {} samples: loss {:.6}, DICE {:.4} ({} batches skipped)",
                    metrics.samples(),
                    loss,
                    score,
                    metrics.skipped
                ),
                _ => bail!("Validation scored no samples ({} batches skipped)", metrics.skipped),
            }
        }
    }

    Ok(())
}
