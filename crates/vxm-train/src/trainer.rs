//! The epoch/batch training loop.
//!
//! ```text
//! Idle -> EpochRunning -> BatchRunning -> ... -> EpochRunning (next epoch)
//!                                              -> Checkpointing -> Done
//! ```
//!
//! Any error stops the run where it happened; the state stays at the step
//! that failed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use vxm_core::Geometry;
use vxm_model::{batch_to_volumes, Registerable, Scoreable};

use crate::checkpoint;
use crate::config::{DimMismatchPolicy, TrainingConfig};
use crate::error::{Result, TrainError};
use crate::loader::{BatchItem, BatchLoader, PairBatch};
use crate::model::RegistrationModel;
use crate::progress::{BatchProgress, EpochSummary, ProgressTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    EpochRunning { epoch: usize },
    BatchRunning { epoch: usize, batch: usize },
    Checkpointing,
    Done,
}

/// Settings of the loop itself, separate from the model's.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOptions {
    pub num_epochs: usize,
    pub save_every: usize,
    pub output_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub on_dim_mismatch: DimMismatchPolicy,
    pub validate: bool,
}

impl LoopOptions {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            num_epochs: config.num_epochs,
            save_every: config.save_every,
            output_dir: config.output_dir.clone(),
            checkpoint: config.checkpoint.clone(),
            on_dim_mismatch: config.on_dim_mismatch,
            validate: config.validate,
        }
    }
}

/// Sample-weighted running sums, reset every epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    loss_sum: f64,
    score_sum: f64,
    samples: usize,
    pub batches: usize,
    pub skipped: usize,
}

impl EpochMetrics {
    /// Add one batch whose per-sample means are `loss` and `score`.
    pub fn add(&mut self, loss: f64, score: f64, samples: usize) {
        self.loss_sum += loss * samples as f64;
        self.score_sum += score * samples as f64;
        self.samples += samples;
        self.batches += 1;
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// `None` until a sample has been scored.
    pub fn mean_loss(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.loss_sum / self.samples as f64)
    }

    pub fn mean_score(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.score_sum / self.samples as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    /// Checkpoint file as written, `.mpk` included.
    pub checkpoint: PathBuf,
    pub volumes_written: Vec<PathBuf>,
    pub elapsed: Duration,
}

pub struct TrainingLoop<B, N, O, S>
where
    B: AutodiffBackend,
    N: AutodiffModule<B> + Registerable<B>,
    N::InnerModule: Registerable<B::InnerBackend>,
    O: Optimizer<N, B>,
    S: Scoreable,
{
    model: RegistrationModel<B, N, O, S>,
    train: BatchLoader<B>,
    validation: Option<BatchLoader<B::InnerBackend>>,
    options: LoopOptions,
    tracker: ProgressTracker,
    state: TrainingState,
}

impl<B, N, O, S> TrainingLoop<B, N, O, S>
where
    B: AutodiffBackend,
    N: AutodiffModule<B> + Registerable<B>,
    N::InnerModule: Registerable<B::InnerBackend>,
    O: Optimizer<N, B>,
    S: Scoreable,
{
    pub fn new(
        model: RegistrationModel<B, N, O, S>,
        train: BatchLoader<B>,
        validation: Option<BatchLoader<B::InnerBackend>>,
        options: LoopOptions,
        tracker: ProgressTracker,
    ) -> Self {
        Self {
            model,
            train,
            validation,
            options,
            tracker,
            state: TrainingState::Idle,
        }
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn model(&self) -> &RegistrationModel<B, N, O, S> {
        &self.model
    }

    /// Train for every configured epoch, then write the checkpoint.
    pub fn run(&mut self) -> Result<TrainingReport> {
        match self.run_epochs() {
            Ok(report) => Ok(report),
            Err(e) => {
                self.tracker.error(&e.to_string());
                Err(e)
            }
        }
    }

    fn run_epochs(&mut self) -> Result<TrainingReport> {
        if self.state != TrainingState::Idle {
            return Err(TrainError::invalid_configuration("training loop has already run"));
        }
        if self.train.num_items() == 0 {
            return Err(TrainError::invalid_configuration("training partition is empty"));
        }
        if self.options.save_every > 0 {
            std::fs::create_dir_all(&self.options.output_dir)
                .map_err(|e| TrainError::io(&self.options.output_dir, e.into()))?;
        }

        let run_start = Instant::now();
        self.tracker.start(self.options.num_epochs, self.train.num_batches());

        let mut epochs = Vec::with_capacity(self.options.num_epochs);
        let mut volumes_written = Vec::new();
        for epoch in 0..self.options.num_epochs {
            let summary = self.run_epoch(epoch, &mut volumes_written)?;
            self.tracker.epoch(&summary);
            epochs.push(summary);
        }

        self.state = TrainingState::Checkpointing;
        let checkpoint = checkpoint::save_network(self.model.network().clone(), &self.options.checkpoint)?;
        self.state = TrainingState::Done;

        let elapsed = run_start.elapsed();
        self.tracker.complete(elapsed, &checkpoint);
        Ok(TrainingReport {
            epochs,
            checkpoint,
            volumes_written,
            elapsed,
        })
    }

    fn run_epoch(&mut self, epoch: usize, volumes_written: &mut Vec<PathBuf>) -> Result<EpochSummary> {
        self.state = TrainingState::EpochRunning { epoch };
        let start = Instant::now();
        let num_batches = self.train.num_batches();
        let mut metrics = EpochMetrics::default();

        for (index, item) in self.train.iter().enumerate() {
            self.state = TrainingState::BatchRunning { epoch, batch: index };
            let Some(batch) = accept_batch(item, self.options.on_dim_mismatch, epoch, index)? else {
                metrics.skip();
                continue;
            };
            tracing::debug!(
                epoch,
                batch = index,
                ids = ?batch.ids,
                moving = ?batch.moving.dims(),
                fixed = ?batch.fixed.dims(),
                "batch shapes"
            );

            let samples = batch.len();
            let step = self
                .model
                .train_step(batch.moving, batch.fixed)
                .map_err(|e| e.at(epoch, index))?;
            metrics.add(step.loss, step.score, samples);

            if self.options.save_every > 0 && index % self.options.save_every == 0 {
                let path = self
                    .options
                    .output_dir
                    .join(format!("registered_image_epoch{epoch}_batch{index}.nii.gz"));
                write_registered(&path, step.registered, &batch.geometries)?;
                volumes_written.push(path);
            }

            self.tracker.batch(&BatchProgress {
                epoch,
                num_epochs: self.options.num_epochs,
                batch: index,
                num_batches,
                loss: step.loss,
                score: step.score,
                learning_rate: self.model.learning_rate(),
                elapsed: start.elapsed(),
            });
            self.state = TrainingState::EpochRunning { epoch };
        }

        let (Some(train_loss), Some(train_score)) = (metrics.mean_loss(), metrics.mean_score()) else {
            return Err(TrainError::EmptyEpoch {
                epoch,
                skipped: metrics.skipped,
            });
        };

        let validation = match (&self.validation, self.options.validate) {
            (Some(loader), true) if loader.num_items() > 0 => {
                Some(evaluate(&self.model, loader, epoch, self.options.on_dim_mismatch)?)
            }
            _ => None,
        };

        Ok(EpochSummary {
            epoch,
            elapsed: start.elapsed(),
            train_loss,
            train_score,
            val_loss: validation.and_then(|m| m.mean_loss()),
            val_score: validation.and_then(|m| m.mean_score()),
            batches: metrics.batches + metrics.skipped,
            skipped: metrics.skipped,
        })
    }
}

/// Run `eval_step` over one pass of `loader`. `epoch` only locates errors.
pub fn evaluate<B, N, O, S>(
    model: &RegistrationModel<B, N, O, S>,
    loader: &BatchLoader<B::InnerBackend>,
    epoch: usize,
    policy: DimMismatchPolicy,
) -> Result<EpochMetrics>
where
    B: AutodiffBackend,
    N: AutodiffModule<B> + Registerable<B>,
    N::InnerModule: Registerable<B::InnerBackend>,
    O: Optimizer<N, B>,
    S: Scoreable,
{
    let mut metrics = EpochMetrics::default();
    for (index, item) in loader.iter().enumerate() {
        let Some(batch) = accept_batch(item, policy, epoch, index)? else {
            metrics.skip();
            continue;
        };
        let samples = batch.len();
        let step = model
            .eval_step(batch.moving, batch.fixed)
            .map_err(|e| e.at(epoch, index))?;
        metrics.add(step.loss, step.score, samples);
    }
    Ok(metrics)
}

/// Apply the mismatch policy to a loader item. `Ok(None)` means skip it.
fn accept_batch<BB: Backend>(
    item: BatchItem<BB>,
    policy: DimMismatchPolicy,
    epoch: usize,
    index: usize,
) -> Result<Option<PairBatch<BB>>> {
    let shared = match item {
        Ok(batch) => return Ok(Some(batch)),
        Err(shared) => shared,
    };
    match (TrainError::from(shared), policy) {
        (e @ TrainError::DimensionMismatch { .. }, DimMismatchPolicy::Skip) => {
            tracing::warn!(epoch, batch = index, "skipping batch: {e}");
            Ok(None)
        }
        (e, _) => Err(e),
    }
}

/// One 3-D file for a single sample, a 4-D stack otherwise.
fn write_registered<BB: Backend>(path: &Path, registered: Tensor<BB, 5>, geometries: &[Geometry]) -> Result<()> {
    let volumes = batch_to_volumes(registered, geometries).map_err(|e| TrainError::io(path, e))?;
    let written = match volumes.as_slice() {
        [single] => vxm_io::write_nifti(path, single),
        stack => vxm_io::write_nifti_stack(path, stack),
    };
    written.map_err(|e| TrainError::io(path, e))?;
    tracing::debug!(path = %path.display(), samples = volumes.len(), "wrote registered volume");
    Ok(())
}
