//! Training pipeline for T2-to-T1 MRI registration.
//!
//! A run partitions patients into train and validation sets, streams
//! `(fixed, moving)` volume pairs through a burn data loader, optimizes a
//! VoxelMorph network with [`RegistrationModel::train_step`], writes the
//! registered volumes on a fixed cadence and saves one checkpoint at the end.

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod trainer;

pub use config::{DatasetConfig, DeviceKind, DimMismatchPolicy, TrainingConfig};
pub use dataset::{discover_patient_ids, patient_ids, PairItem, Partition, PatientId, VolumePair, VolumePairDataset};
pub use error::{Result, TrainError};
pub use loader::{BatchItem, BatchLoader, LoaderOptions, PairBatch, PairBatcher};
pub use model::{RegistrationModel, StepOutput, VoxelMorphModel};
pub use pipeline::{CpuBackend, GpuBackend};
pub use progress::{BatchProgress, ConsoleProgressCallback, EpochSummary, HistoryCallback, ProgressCallback, ProgressTracker};
pub use trainer::{EpochMetrics, LoopOptions, TrainingLoop, TrainingReport, TrainingState};
