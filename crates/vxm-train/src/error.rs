//! Error types for the training pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for training operations.
#[derive(Error, Debug)]
pub enum TrainError {
    /// Rejected configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A volume or batch does not have the configured shape.
    #[error("Dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Reading or writing a file failed.
    #[error("I/O error on {}: {cause:#}", path.display())]
    Io {
        path: PathBuf,
        cause: anyhow::Error,
    },

    /// An input volume, the loss or the predicted field was NaN or infinite.
    #[error("Numerical instability at epoch {epoch}, batch {batch}: {quantity} = {value}")]
    NumericalInstability {
        epoch: usize,
        batch: usize,
        quantity: &'static str,
        value: f64,
    },

    /// Every batch of a training epoch was skipped.
    #[error("Epoch {epoch} trained on no samples ({skipped} batches skipped)")]
    EmptyEpoch { epoch: usize, skipped: usize },

    /// Saving or loading the model record failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A batch could not be assembled or its error was shared.
    #[error("Loader error: {0}")]
    Loader(String),
}

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;

impl TrainError {
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn dimension_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::DimensionMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, cause: anyhow::Error) -> Self {
        Self::Io {
            path: path.into(),
            cause,
        }
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn loader(msg: impl Into<String>) -> Self {
        Self::Loader(msg.into())
    }

    /// Non-finite `value` of `quantity`, located later with [`Self::at`].
    pub fn non_finite(quantity: &'static str, value: f64) -> Self {
        Self::NumericalInstability {
            epoch: 0,
            batch: 0,
            quantity,
            value,
        }
    }

    /// Record where a numerical failure happened. Other variants pass through.
    pub fn at(self, epoch: usize, batch: usize) -> Self {
        match self {
            Self::NumericalInstability { quantity, value, .. } => Self::NumericalInstability {
                epoch,
                batch,
                quantity,
                value,
            },
            other => other,
        }
    }
}

/// Errors cross the data loader behind an `Arc`; take sole ownership back.
impl From<Arc<TrainError>> for TrainError {
    fn from(shared: Arc<TrainError>) -> Self {
        Arc::try_unwrap(shared).unwrap_or_else(|shared| Self::Loader(shared.to_string()))
    }
}
