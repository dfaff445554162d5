mod common;

use std::sync::Arc;

use burn::backend::Autodiff;
use burn::data::dataset::Dataset;
use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use vxm_core::{Geometry, Volume};
use vxm_model::volumes_to_batch;
use vxm_train::pipeline::{self, evaluate_checkpoint};
use vxm_train::trainer::evaluate;
use vxm_train::{
    BatchLoader, DimMismatchPolicy, HistoryCallback, LoaderOptions, LoopOptions, PairBatcher, PatientId,
    ProgressTracker, TrainError, TrainingConfig, TrainingLoop, TrainingState, VolumePairDataset, VoxelMorphModel,
};

use common::{blob, tiny_config, write_dataset, write_patient};

type Backend = Autodiff<NdArray<f32>>;
type Inner = NdArray<f32>;

fn tracker_with(history: &HistoryCallback) -> ProgressTracker {
    let mut tracker = ProgressTracker::new();
    tracker.add_callback(Arc::new(history.clone()));
    tracker
}

#[test]
fn test_end_to_end_six_patients() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 6);

    let config = tiny_config(data.path(), out.path(), 6);
    let partition = pipeline::partition(&config).unwrap();
    assert_eq!(partition.train.len(), 4);
    assert_eq!(partition.validation.len(), 2);

    let history = HistoryCallback::new();
    let report = pipeline::train::<Backend>(&config, Default::default(), tracker_with(&history)).unwrap();

    assert_eq!(report.epochs.len(), 1);
    assert_eq!(history.batches().len(), 2);
    assert_eq!(report.volumes_written.len(), 2);
    for (i, path) in report.volumes_written.iter().enumerate() {
        assert!(path.exists(), "{} missing", path.display());
        assert!(path.ends_with(format!("registered_image_epoch0_batch{i}.nii.gz")));
    }

    assert_eq!(report.checkpoint, out.path().join("model.mpk"));
    assert!(report.checkpoint.exists());

    let summary = &report.epochs[0];
    assert!(summary.train_loss.is_finite());
    assert!(summary.train_loss >= 0.0);
    assert!(summary.train_score >= 0.0 && summary.train_score <= 1.0 + 1e-6);
    assert!(summary.val_loss.is_some());
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.skipped, 0);
    assert_eq!(history.epochs(), report.epochs);
}

#[test]
fn test_worker_threads_run_writes_readable_volumes() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 6);

    let config = tiny_config(data.path(), out.path(), 6)
        .with_batch_size(1)
        .with_num_workers(2)
        .with_save_every(2)
        .with_validate(false);

    let report = pipeline::train::<Backend>(&config, Default::default(), ProgressTracker::new()).unwrap();

    // Four training batches, written at batch 0 and 2.
    assert_eq!(report.volumes_written.len(), 2);
    assert!(report.volumes_written[1].ends_with("registered_image_epoch0_batch2.nii.gz"));
    let volume = vxm_io::read_nifti(&report.volumes_written[0]).unwrap();
    assert_eq!(volume.shape(), [1, 8, 8, 8]);
    assert_eq!(report.epochs[0].batches, 4);
    assert!(report.epochs[0].val_loss.is_none());
}

/// Patient ids per batch for `passes` passes over a freshly built train loader.
fn groupings(config: &TrainingConfig, passes: usize) -> Vec<Vec<Vec<String>>> {
    let device = Default::default();
    let (train, _) = pipeline::loaders::<Backend>(config, pipeline::partition(config).unwrap(), &device).unwrap();
    (0..passes)
        .map(|_| {
            train
                .iter()
                .map(|batch| batch.unwrap().ids.iter().map(|id| id.to_string()).collect())
                .collect()
        })
        .collect()
}

fn sorted_ids(pass: &[Vec<String>]) -> Vec<String> {
    let mut ids: Vec<String> = pass.iter().flatten().cloned().collect();
    ids.sort();
    ids
}

#[test]
fn test_shuffled_groupings_repeat_across_runs() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 7);
    let config = tiny_config(data.path(), out.path(), 7).with_validation_ratio(0.0);

    let first = groupings(&config, 2);
    assert_eq!(first, groupings(&config, 2));

    let all: Vec<String> = (1..=7).map(|n| format!("{n:03}")).collect();
    for pass in &first {
        assert_eq!(pass.len(), 4);
        assert_eq!(pass.last().map(Vec::len), Some(1));
        assert_eq!(sorted_ids(pass), all);
    }

    // Without shuffling both passes follow partition order.
    let train: Vec<String> = pipeline::partition(&config).unwrap().train.iter().map(|id| id.to_string()).collect();
    let unshuffled = groupings(&config.clone().with_shuffle(false), 2);
    assert_eq!(unshuffled[0], unshuffled[1]);
    assert_eq!(unshuffled[0].concat(), train);
}

#[test]
fn test_worker_threads_cover_every_patient_once() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 7);
    let config = tiny_config(data.path(), out.path(), 7)
        .with_validation_ratio(0.0)
        .with_num_workers(3);

    let all: Vec<String> = (1..=7).map(|n| format!("{n:03}")).collect();
    for pass in groupings(&config, 2) {
        assert!(pass.iter().all(|batch| !batch.is_empty() && batch.len() <= 2));
        assert_eq!(sorted_ids(&pass), all);
    }
}

#[test]
fn test_dropping_worker_iterator_mid_pass() {
    let data = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 6);
    let config = tiny_config(data.path(), data.path(), 6).with_validation_ratio(0.0);
    let dataset = VolumePairDataset::new(pipeline::partition(&config).unwrap().train, &config.dataset);
    assert_eq!(dataset.len(), 6);

    let options = LoaderOptions {
        batch_size: 1,
        shuffle: Some(1),
        num_workers: 2,
    };
    let loader = BatchLoader::<Inner>::new(dataset, PairBatcher::new([8, 8, 8]), options, Default::default()).unwrap();

    let mut iter = loader.iter();
    assert!(iter.next().unwrap().is_ok());
    drop(iter);

    // A fresh pass still yields everything.
    assert_eq!(loader.iter().count(), 6);
}

#[test]
fn test_dimension_mismatch_policies() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 3);
    write_patient(data.path(), "004", [8, 8, 6], 0.0);

    let config = tiny_config(data.path(), out.path(), 4)
        .with_batch_size(1)
        .with_validation_ratio(0.0)
        .with_save_every(0);

    let err = pipeline::train::<Backend>(&config, Default::default(), ProgressTracker::new()).unwrap_err();
    assert!(matches!(err, TrainError::DimensionMismatch { .. }), "got {err}");

    let history = HistoryCallback::new();
    let skip = config.with_on_dim_mismatch(DimMismatchPolicy::Skip);
    let report = pipeline::train::<Backend>(&skip, Default::default(), tracker_with(&history)).unwrap();
    assert_eq!(report.epochs[0].skipped, 1);
    assert_eq!(report.epochs[0].batches, 4);
    assert_eq!(history.batches().len(), 3);
    assert!(report.volumes_written.is_empty());
}

#[test]
fn test_epoch_with_every_batch_skipped_fails() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    for id in ["001", "002", "003"] {
        write_patient(data.path(), id, [8, 8, 6], 0.0);
    }
    let config = tiny_config(data.path(), out.path(), 3)
        .with_batch_size(1)
        .with_validation_ratio(0.0)
        .with_on_dim_mismatch(DimMismatchPolicy::Skip);

    let history = HistoryCallback::new();
    let err = pipeline::train::<Backend>(&config, Default::default(), tracker_with(&history)).unwrap_err();
    match err {
        TrainError::EmptyEpoch { epoch, skipped } => {
            assert_eq!(epoch, 0);
            assert_eq!(skipped, 3);
        }
        other => panic!("expected EmptyEpoch, got {other}"),
    }
    assert!(history.epochs().is_empty());
    assert_eq!(history.errors().len(), 1);
    assert!(!out.path().join("model.mpk").exists());
}

fn validation_loader(config: &TrainingConfig, ids: &[&str]) -> BatchLoader<Inner> {
    let ids = ids.iter().map(|id| PatientId::new(*id)).collect();
    let dataset = VolumePairDataset::new(ids, &config.dataset);
    let options = LoaderOptions {
        batch_size: 1,
        shuffle: None,
        num_workers: 0,
    };
    BatchLoader::new(dataset, PairBatcher::new(config.dims), options, Default::default()).unwrap()
}

#[test]
fn test_validation_pass_applies_mismatch_policy() {
    let data = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 2);
    write_patient(data.path(), "003", [8, 6, 8], 0.0);
    let config = tiny_config(data.path(), data.path(), 3);
    let model = VoxelMorphModel::<Backend>::from_config(&config, Default::default()).unwrap();

    let loader = validation_loader(&config, &["001", "003", "002"]);
    let err = evaluate(&model, &loader, 0, DimMismatchPolicy::Abort).unwrap_err();
    assert!(matches!(err, TrainError::DimensionMismatch { .. }), "got {err}");

    let metrics = evaluate(&model, &loader, 0, DimMismatchPolicy::Skip).unwrap();
    assert_eq!(metrics.skipped, 1);
    assert_eq!(metrics.batches, 2);
    assert_eq!(metrics.samples(), 2);
    assert!(metrics.mean_loss().is_some_and(f64::is_finite));

    let only_mismatched = validation_loader(&config, &["003"]);
    let metrics = evaluate(&model, &only_mismatched, 0, DimMismatchPolicy::Skip).unwrap();
    assert_eq!(metrics.skipped, 1);
    assert_eq!(metrics.mean_loss(), None);
    assert_eq!(metrics.mean_score(), None);
}

#[test]
fn test_missing_patient_halts_with_io_error() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 2);
    let config = tiny_config(data.path(), out.path(), 3).with_validation_ratio(0.0);

    let history = HistoryCallback::new();
    let err = pipeline::train::<Backend>(&config, Default::default(), tracker_with(&history)).unwrap_err();
    match &err {
        TrainError::Io { path, .. } => assert!(path.to_string_lossy().contains("003")),
        other => panic!("expected Io error, got {other}"),
    }
    assert_eq!(history.errors().len(), 1);
    assert!(!out.path().join("model.mpk").exists());
}

#[test]
fn test_loop_state_ends_done() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 4);
    let config = tiny_config(data.path(), out.path(), 4).with_save_every(0);

    let device = Default::default();
    let (train, validation) = pipeline::loaders::<Backend>(&config, pipeline::partition(&config).unwrap(), &device).unwrap();
    let model = VoxelMorphModel::<Backend>::from_config(&config, Default::default()).unwrap();
    let mut training = TrainingLoop::new(
        model,
        train,
        Some(validation),
        LoopOptions::from_config(&config),
        ProgressTracker::new(),
    );
    assert_eq!(training.state(), TrainingState::Idle);

    training.run().unwrap();
    assert_eq!(training.state(), TrainingState::Done);
    assert!(training.model().steps() > 0);
    assert!(training.run().is_err());
}

fn blob_pair(shift: f32) -> (Tensor<Backend, 5>, Tensor<Backend, 5>) {
    let dims = [8, 8, 8];
    let fixed = Volume::from_vec(dims, blob(dims, [4.0, 4.0, 4.0], 2.0), Geometry::default()).unwrap();
    let moving = Volume::from_vec(dims, blob(dims, [4.0, 4.0, 4.0 + shift], 2.0), Geometry::default()).unwrap();
    let device = Default::default();
    (
        volumes_to_batch::<Backend>(&[moving], &device).unwrap(),
        volumes_to_batch::<Backend>(&[fixed], &device).unwrap(),
    )
}

#[test]
fn test_repeated_train_steps_lower_loss() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path(), dir.path(), 6)
        .with_learning_rate(0.01)
        .with_momentum(0.0);
    let mut model = VoxelMorphModel::<Backend>::from_config(&config, Default::default()).unwrap();

    let (moving, fixed) = blob_pair(1.0);
    let losses: Vec<f64> = (0..15)
        .map(|_| model.train_step(moving.clone(), fixed.clone()).unwrap().loss)
        .collect();

    assert!(losses.iter().all(|l| l.is_finite() && *l >= 0.0));
    assert!(losses[14] < losses[0], "losses {losses:?}");
    assert_eq!(model.steps(), 15);
}

#[test]
fn test_eval_step_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path(), dir.path(), 6);
    let model = VoxelMorphModel::<Backend>::from_config(&config, Default::default()).unwrap();

    let (moving, fixed) = blob_pair(0.5);
    let (moving, fixed) = (moving.inner(), fixed.inner());
    let a = model.eval_step(moving.clone(), fixed.clone()).unwrap();
    let b = model.eval_step(moving, fixed).unwrap();

    assert_eq!(a.loss, b.loss);
    assert_eq!(a.score, b.score);
    let diff = (a.registered - b.registered).abs().max().into_scalar();
    assert_eq!(diff, 0.0);
    assert_eq!(model.steps(), 0);
}

#[test]
fn test_evaluate_checkpoint_after_training() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_dataset(data.path(), 6);
    let config = tiny_config(data.path(), out.path(), 6).with_save_every(0);

    let report = pipeline::train::<Backend>(&config, Default::default(), ProgressTracker::new()).unwrap();
    let metrics = evaluate_checkpoint::<Backend>(&config, &config.checkpoint, Default::default()).unwrap();

    assert_eq!(metrics.samples(), 2);
    let val_loss = report.epochs[0].val_loss.unwrap();
    assert!((metrics.mean_loss().unwrap() - val_loss).abs() < 1e-6);
}
