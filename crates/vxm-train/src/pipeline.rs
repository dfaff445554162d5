//! Assemble a full run from a [`TrainingConfig`].

use std::path::Path;

use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::tensor::backend::AutodiffBackend;

use crate::config::TrainingConfig;
use crate::dataset::{discover_patient_ids, patient_ids, Partition, VolumePairDataset};
use crate::error::{Result, TrainError};
use crate::loader::{BatchLoader, LoaderOptions, PairBatcher};
use crate::model::VoxelMorphModel;
use crate::progress::ProgressTracker;
use crate::trainer::{evaluate, EpochMetrics, LoopOptions, TrainingLoop, TrainingReport};

/// GPU training backend: Wgpu with autodiff
pub type GpuBackend = Autodiff<Wgpu>;

/// CPU training backend: NdArray with autodiff
pub type CpuBackend = Autodiff<NdArray>;

/// Patient ids split into train and validation partitions.
pub fn partition(config: &TrainingConfig) -> Result<Partition> {
    let dataset = &config.dataset;
    let ids = if dataset.discover {
        discover_patient_ids(&dataset.root)?
    } else {
        patient_ids(dataset.patient_count, dataset.first_patient, dataset.id_width)
    };
    let partition = Partition::split(&ids, config.validation_ratio, config.seed)?;
    tracing::info!(
        train = partition.train.len(),
        validation = partition.validation.len(),
        "partitioned patients"
    );
    Ok(partition)
}

/// Loaders for both partitions. Validation is read in dataset order.
pub fn loaders<B: AutodiffBackend>(
    config: &TrainingConfig,
    partition: Partition,
    device: &B::Device,
) -> Result<(BatchLoader<B>, BatchLoader<B::InnerBackend>)> {
    let batcher = PairBatcher::new(config.dims);
    let train = VolumePairDataset::new(partition.train, &config.dataset);
    let validation = VolumePairDataset::new(partition.validation, &config.dataset);

    let options = LoaderOptions {
        batch_size: config.batch_size,
        shuffle: config.shuffle.then_some(config.seed),
        num_workers: config.num_workers,
    };
    let val_options = LoaderOptions { shuffle: None, ..options };

    Ok((
        BatchLoader::new(train, batcher, options, device.clone())?,
        BatchLoader::new(validation, batcher, val_options, device.clone())?,
    ))
}

/// Train the configured model on `B` and write its checkpoint.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: B::Device,
    tracker: ProgressTracker,
) -> Result<TrainingReport> {
    config.validate()?;
    let (train, validation) = loaders::<B>(config, partition(config)?, &device)?;
    let model = VoxelMorphModel::<B>::from_config(config, device)?;
    tracing::info!(
        device = %config.device,
        batch_size = config.batch_size,
        epochs = config.num_epochs,
        lr = model.learning_rate(),
        "starting training"
    );

    let mut training = TrainingLoop::new(model, train, Some(validation), LoopOptions::from_config(config), tracker);
    training.run()
}

/// Load `checkpoint` and run one pass over the validation partition.
pub fn evaluate_checkpoint<B: AutodiffBackend>(
    config: &TrainingConfig,
    checkpoint: &Path,
    device: B::Device,
) -> Result<EpochMetrics> {
    config.validate()?;
    let (_, validation) = loaders::<B>(config, partition(config)?, &device)?;
    if validation.num_items() == 0 {
        return Err(TrainError::invalid_configuration("validation partition is empty"));
    }

    let mut model = VoxelMorphModel::<B>::from_config(config, device)?;
    model.load_network(checkpoint)?;
    evaluate(&model, &validation, 0, config.on_dim_mismatch)
}
