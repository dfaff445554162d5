//! Batches of volume pairs on top of burn's data loader.
//!
//! [`PairBatcher`] stacks the pairs a [`DataLoader`] draws from a
//! [`VolumePairDataset`] into `[N, 1, D, H, W]` tensors. A read failure or a
//! volume of the wrong shape turns the whole batch into an error item, so the
//! training loop decides what to do with it. [`BatchLoader`] configures the
//! loader: shuffling is seeded and reshuffles on every pass, and with
//! `num_workers > 0` burn reads on background threads, each shuffling with its
//! own sub-seed drawn from the run seed.

use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder, DataLoaderIterator};
use burn::prelude::*;
use vxm_core::{Geometry, Volume};
use vxm_model::volumes_to_batch;

use crate::dataset::{PairItem, PatientId, VolumePairDataset};
use crate::error::{Result, TrainError};

/// Stacked volumes of one batch, in draw order.
#[derive(Debug, Clone)]
pub struct PairBatch<B: Backend> {
    pub ids: Vec<PatientId>,
    pub moving: Tensor<B, 5>,
    pub fixed: Tensor<B, 5>,
    /// Geometry of each fixed volume.
    pub geometries: Vec<Geometry>,
}

impl<B: Backend> PairBatch<B> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// What the loader yields per batch.
pub type BatchItem<B> = std::result::Result<PairBatch<B>, Arc<TrainError>>;

/// Builds [`PairBatch`]es whose volumes are all `[1, D, H, W]` with `dims`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairBatcher {
    dims: [usize; 3],
}

impl PairBatcher {
    pub fn new(dims: [usize; 3]) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Fail unless `volume` is single-channel with the configured dims.
    pub fn check_dims(&self, volume: &Volume) -> Result<()> {
        let [d, h, w] = self.dims;
        let expected = [1, d, h, w];
        let actual = volume.shape();
        if actual != expected {
            return Err(TrainError::dimension_mismatch(&expected, &actual));
        }
        Ok(())
    }

    fn assemble<B: Backend>(&self, items: Vec<PairItem>, device: &B::Device) -> BatchItem<B> {
        let mut ids = Vec::with_capacity(items.len());
        let mut fixed = Vec::with_capacity(items.len());
        let mut moving = Vec::with_capacity(items.len());
        for item in items {
            let pair = item?;
            ids.push(pair.id);
            fixed.push(pair.fixed);
            moving.push(pair.moving);
        }

        for volume in fixed.iter().chain(&moving) {
            self.check_dims(volume).map_err(Arc::new)?;
        }

        let geometries = fixed.iter().map(|v| v.geometry().clone()).collect();
        Ok(PairBatch {
            ids,
            moving: stack(&moving, device)?,
            fixed: stack(&fixed, device)?,
            geometries,
        })
    }
}

impl<B: Backend> Batcher<B, PairItem, BatchItem<B>> for PairBatcher {
    fn batch(&self, items: Vec<PairItem>, device: &B::Device) -> BatchItem<B> {
        self.assemble(items, device)
    }
}

fn stack<B: Backend>(volumes: &[Volume], device: &B::Device) -> std::result::Result<Tensor<B, 5>, Arc<TrainError>> {
    volumes_to_batch::<B>(volumes, device).map_err(|e| Arc::new(TrainError::loader(format!("{e:#}"))))
}

/// Batching knobs of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    /// Seed for shuffling; `None` keeps dataset order.
    pub shuffle: Option<u64>,
    /// Background reader threads; 0 reads on the iterating thread.
    pub num_workers: usize,
}

/// A burn [`DataLoader`] over one partition.
pub struct BatchLoader<B: Backend> {
    inner: Arc<dyn DataLoader<B, BatchItem<B>>>,
    batch_size: usize,
}

impl<B: Backend> BatchLoader<B> {
    pub fn new(
        dataset: VolumePairDataset,
        batcher: PairBatcher,
        options: LoaderOptions,
        device: B::Device,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(TrainError::invalid_configuration("batch_size must be positive"));
        }

        let mut builder = DataLoaderBuilder::new(batcher)
            .batch_size(options.batch_size)
            .set_device(device);
        if let Some(seed) = options.shuffle {
            builder = builder.shuffle(seed);
        }
        if options.num_workers > 0 {
            builder = builder.num_workers(options.num_workers);
        }

        let inner: Arc<dyn DataLoader<B, BatchItem<B>>> = builder.build(dataset);
        Ok(Self {
            inner,
            batch_size: options.batch_size,
        })
    }

    /// Batches of the next pass. A shuffled loader draws a new order per call.
    pub fn iter(&self) -> Box<dyn DataLoaderIterator<BatchItem<B>> + '_> {
        self.inner.iter()
    }

    pub fn num_items(&self) -> usize {
        self.inner.num_items()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `ceil(items / batch_size)`. With several workers each thread batches
    /// its own share, so a pass can hold a few more short batches.
    pub fn num_batches(&self) -> usize {
        self.num_items().div_ceil(self.batch_size)
    }
}
