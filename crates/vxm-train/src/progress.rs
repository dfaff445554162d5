//! Progress reporting for training runs.
//!
//! The training loop reports to any number of [`ProgressCallback`]s through
//! a [`ProgressTracker`]. [`ConsoleProgressCallback`] logs through `tracing`
//! and can draw an indicatif bar per epoch; [`HistoryCallback`] records what
//! it sees for later inspection.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// State after one training batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub epoch: usize,
    pub num_epochs: usize,
    pub batch: usize,
    pub num_batches: usize,
    pub loss: f64,
    pub score: f64,
    pub learning_rate: f64,
    pub elapsed: Duration,
}

/// Per-epoch summary.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub elapsed: Duration,
    /// Mean training loss per sample.
    pub train_loss: f64,
    /// Mean training Dice per sample.
    pub train_score: f64,
    pub val_loss: Option<f64>,
    pub val_score: Option<f64>,
    pub batches: usize,
    pub skipped: usize,
}

impl EpochSummary {
    pub fn elapsed_minutes(&self) -> f64 {
        self.elapsed.as_secs_f64() / 60.0
    }
}

pub trait ProgressCallback: Send + Sync {
    /// Called once before the first epoch.
    fn on_start(&self, _num_epochs: usize, _num_batches: usize) {}

    fn on_batch(&self, _progress: &BatchProgress) {}

    fn on_epoch(&self, _summary: &EpochSummary) {}

    /// Called after the checkpoint has been written.
    fn on_complete(&self, _elapsed: Duration, _checkpoint: &Path) {}

    fn on_error(&self, _error: &str) {}
}

/// Console progress callback that logs to tracing.
#[derive(Debug)]
pub struct ConsoleProgressCallback {
    /// Log every this many batches.
    pub log_interval: usize,
    pub show_progress_bar: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl Default for ConsoleProgressCallback {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ConsoleProgressCallback {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
            show_progress_bar: true,
            bar: Mutex::new(None),
        }
    }

    pub fn without_progress_bar(mut self) -> Self {
        self.show_progress_bar = false;
        self
    }

    fn new_bar(len: usize, epoch: usize) -> ProgressBar {
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} epoch {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(epoch.to_string());
        bar
    }
}

impl ProgressCallback for ConsoleProgressCallback {
    fn on_start(&self, num_epochs: usize, num_batches: usize) {
        tracing::info!("Training started: {} epochs x {} batches", num_epochs, num_batches);
    }

    fn on_batch(&self, progress: &BatchProgress) {
        if self.show_progress_bar {
            let mut slot = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
            let bar = slot.get_or_insert_with(|| Self::new_bar(progress.num_batches, progress.epoch));
            bar.set_position(progress.batch as u64 + 1);
            bar.set_message(format!("loss {:.4} dice {:.4}", progress.loss, progress.score));
        }

        let batch = progress.batch + 1;
        if batch % self.log_interval == 0 || batch == progress.num_batches {
            tracing::info!(
                "Epoch {}/{} batch {}/{} | Loss: {:.6} | Dice: {:.4} | LR: {:.2e} | Elapsed: {:.2}s",
                progress.epoch + 1,
                progress.num_epochs,
                batch,
                progress.num_batches,
                progress.loss,
                progress.score,
                progress.learning_rate,
                progress.elapsed.as_secs_f64()
            );
        }
    }

    fn on_epoch(&self, summary: &EpochSummary) {
        if let Some(bar) = self.bar.lock().unwrap_or_else(PoisonError::into_inner).take() {
            bar.finish_and_clear();
        }

        tracing::info!(
            "[{:.2} mins] After {} epochs, average training loss {:.6}, average DICE {:.4}",
            summary.elapsed_minutes(),
            summary.epoch + 1,
            summary.train_loss,
            summary.train_score
        );
        if let (Some(loss), Some(score)) = (summary.val_loss, summary.val_score) {
            tracing::info!("  validation loss {:.6}, validation DICE {:.4}", loss, score);
        }
        if summary.skipped > 0 {
            tracing::warn!("  {} of {} batches skipped", summary.skipped, summary.batches);
        }
    }

    fn on_complete(&self, elapsed: Duration, checkpoint: &Path) {
        tracing::info!(
            "Training completed in {:.2}s, checkpoint at {}",
            elapsed.as_secs_f64(),
            checkpoint.display()
        );
    }

    fn on_error(&self, error: &str) {
        if let Some(bar) = self.bar.lock().unwrap_or_else(PoisonError::into_inner).take() {
            bar.abandon();
        }
        tracing::error!("Training failed: {}", error);
    }
}

/// Records batch progress and epoch summaries. Clones share one history.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    batches: Arc<Mutex<Vec<BatchProgress>>>,
    epochs: Arc<Mutex<Vec<EpochSummary>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<BatchProgress> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn epochs(&self) -> Vec<EpochSummary> {
        self.epochs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.epochs.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl ProgressCallback for HistoryCallback {
    fn on_batch(&self, progress: &BatchProgress) {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(progress.clone());
    }

    fn on_epoch(&self, summary: &EpochSummary) {
        self.epochs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(summary.clone());
    }

    fn on_error(&self, error: &str) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.to_string());
    }
}

/// Fans events out to every registered callback.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    callbacks: Vec<Arc<dyn ProgressCallback>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callbacks.push(callback);
    }

    pub fn start(&self, num_epochs: usize, num_batches: usize) {
        for callback in &self.callbacks {
            callback.on_start(num_epochs, num_batches);
        }
    }

    pub fn batch(&self, progress: &BatchProgress) {
        for callback in &self.callbacks {
            callback.on_batch(progress);
        }
    }

    pub fn epoch(&self, summary: &EpochSummary) {
        for callback in &self.callbacks {
            callback.on_epoch(summary);
        }
    }

    pub fn complete(&self, elapsed: Duration, checkpoint: &Path) {
        for callback in &self.callbacks {
            callback.on_complete(elapsed, checkpoint);
        }
    }

    pub fn error(&self, error: &str) {
        for callback in &self.callbacks {
            callback.on_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(index: usize, loss: f64) -> BatchProgress {
        BatchProgress {
            epoch: 0,
            num_epochs: 1,
            batch: index,
            num_batches: 2,
            loss,
            score: 0.5,
            learning_rate: 1e-4,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_history_callback_shares_state_across_clones() {
        let history = HistoryCallback::new();
        let mut tracker = ProgressTracker::new();
        tracker.add_callback(Arc::new(history.clone()));

        tracker.batch(&batch(0, 0.9));
        tracker.batch(&batch(1, 0.8));
        tracker.error("boom");

        assert_eq!(history.batches().len(), 2);
        assert_eq!(history.batches()[1].loss, 0.8);
        assert_eq!(history.errors(), vec!["boom".to_string()]);

        history.clear();
        assert!(history.batches().is_empty());
    }

    #[test]
    fn test_console_callback_handles_full_epoch() {
        let console = ConsoleProgressCallback::new(1);
        console.on_start(1, 2);
        console.on_batch(&batch(0, 0.9));
        console.on_batch(&batch(1, 0.8));
        console.on_epoch(&EpochSummary {
            epoch: 0,
            elapsed: Duration::from_secs(90),
            train_loss: 0.85,
            train_score: 0.5,
            val_loss: Some(0.7),
            val_score: Some(0.6),
            batches: 2,
            skipped: 0,
        });
        assert!(console.bar.lock().unwrap().is_none());
    }

    #[test]
    fn test_elapsed_minutes() {
        let summary = EpochSummary {
            epoch: 0,
            elapsed: Duration::from_secs(90),
            train_loss: 0.0,
            train_score: 0.0,
            val_loss: None,
            val_score: None,
            batches: 0,
            skipped: 0,
        };
        assert_eq!(summary.elapsed_minutes(), 1.5);
    }
}
