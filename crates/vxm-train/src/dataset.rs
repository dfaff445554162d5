//! Patient ids, train/validation partitioning and the volume-pair dataset.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use vxm_core::Volume;

use crate::config::DatasetConfig;
use crate::error::{Result, TrainError};

/// Zero-padded patient identifier, e.g. `"007"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatientId(String);

impl PatientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `count` ids starting at `first`, each zero padded to `width` digits.
pub fn patient_ids(count: usize, first: usize, width: usize) -> Vec<PatientId> {
    (first..first + count)
        .map(|n| PatientId(format!("{n:0width$}")))
        .collect()
}

/// Sorted names of the sub-directories of `root`.
pub fn discover_patient_ids(root: &Path) -> Result<Vec<PatientId>> {
    let entries = std::fs::read_dir(root).map_err(|e| TrainError::io(root, e.into()))?;
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TrainError::io(root, e.into()))?;
        if entry.path().is_dir() {
            ids.push(PatientId(entry.file_name().to_string_lossy().into_owned()));
        }
    }
    ids.sort();
    Ok(ids)
}

/// Disjoint train/validation split of a patient list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<PatientId>,
    pub validation: Vec<PatientId>,
}

impl Partition {
    /// Shuffle `ids` with `seed`, move the first `ceil(ratio * n)` into
    /// validation and keep the rest for training.
    pub fn split(ids: &[PatientId], validation_ratio: f64, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&validation_ratio) {
            return Err(TrainError::invalid_configuration(format!(
                "validation_ratio must be in [0, 1), got {validation_ratio}"
            )));
        }

        let n = ids.len();
        let n_val = (validation_ratio * n as f64).ceil() as usize;
        if n_val >= n {
            return Err(TrainError::invalid_configuration(format!(
                "{n} patients leave no training data at validation_ratio {validation_ratio}"
            )));
        }

        let mut shuffled = ids.to_vec();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
        let train = shuffled.split_off(n_val);

        Ok(Self {
            train,
            validation: shuffled,
        })
    }
}

/// One training sample: the T1 target and the T2 volume to align to it.
#[derive(Debug, Clone)]
pub struct VolumePair {
    pub id: PatientId,
    pub fixed: Volume,
    pub moving: Volume,
}

/// Dataset item: a pair, or the error reading it. Shared so items stay
/// `Clone` for the data loader.
pub type PairItem = std::result::Result<VolumePair, Arc<TrainError>>;

/// Lazily-read pairs for one partition.
#[derive(Debug, Clone)]
pub struct VolumePairDataset {
    ids: Vec<PatientId>,
    root: PathBuf,
    subdir: String,
    fixed_file: String,
    moving_file: String,
}

impl VolumePairDataset {
    pub fn new(ids: Vec<PatientId>, config: &DatasetConfig) -> Self {
        Self {
            ids,
            root: config.root.clone(),
            subdir: config.subdir.clone(),
            fixed_file: config.fixed_file.clone(),
            moving_file: config.moving_file.clone(),
        }
    }

    pub fn ids(&self) -> &[PatientId] {
        &self.ids
    }

    pub fn fixed_path(&self, id: &PatientId) -> PathBuf {
        self.root.join(id.as_str()).join(&self.subdir).join(&self.fixed_file)
    }

    pub fn moving_path(&self, id: &PatientId) -> PathBuf {
        self.root.join(id.as_str()).join(&self.subdir).join(&self.moving_file)
    }

    /// Read both volumes of patient `id`.
    pub fn read(&self, id: &PatientId) -> Result<VolumePair> {
        let fixed = read_volume(&self.fixed_path(id))?;
        let moving = read_volume(&self.moving_path(id))?;
        tracing::trace!(patient = %id, shape = ?fixed.shape(), "loaded pair");

        Ok(VolumePair {
            id: id.clone(),
            fixed,
            moving,
        })
    }
}

impl Dataset<PairItem> for VolumePairDataset {
    /// `None` past the end; `Some(Err(..))` when a file cannot be read.
    fn get(&self, index: usize) -> Option<PairItem> {
        let id = self.ids.get(index)?;
        Some(self.read(id).map_err(Arc::new))
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

fn read_volume(path: &Path) -> Result<Volume> {
    vxm_io::read_nifti(path).map_err(|e| TrainError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_patient_ids_are_zero_padded() {
        let ids = patient_ids(200, 1, 3);
        assert_eq!(ids.len(), 200);
        assert_eq!(ids[0].as_str(), "001");
        assert_eq!(ids[9].as_str(), "010");
        assert_eq!(ids[199].as_str(), "200");
    }

    #[test]
    fn test_split_sizes_follow_ceil() {
        let ids = patient_ids(200, 1, 3);
        let partition = Partition::split(&ids, 0.33, 42).unwrap();
        assert_eq!(partition.validation.len(), 66);
        assert_eq!(partition.train.len(), 134);

        let partition = Partition::split(&patient_ids(6, 1, 3), 0.33, 42).unwrap();
        assert_eq!(partition.validation.len(), 2);
        assert_eq!(partition.train.len(), 4);
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let ids = patient_ids(50, 1, 3);
        let partition = Partition::split(&ids, 0.2, 7).unwrap();
        let train: HashSet<_> = partition.train.iter().collect();
        let val: HashSet<_> = partition.validation.iter().collect();
        assert!(train.is_disjoint(&val));
        let union: HashSet<_> = train.union(&val).copied().collect();
        assert_eq!(union, ids.iter().collect());
    }

    #[test]
    fn test_split_is_deterministic_per_seed() {
        let ids = patient_ids(30, 1, 3);
        let a = Partition::split(&ids, 0.33, 42).unwrap();
        let b = Partition::split(&ids, 0.33, 42).unwrap();
        let c = Partition::split(&ids, 0.33, 43).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_split_rejects_bad_ratios() {
        let ids = patient_ids(3, 1, 3);
        assert!(Partition::split(&ids, 1.0, 0).is_err());
        assert!(Partition::split(&ids, 0.9, 0).is_err());
        assert!(Partition::split(&[], 0.0, 0).is_err());
        let all_train = Partition::split(&ids, 0.0, 0).unwrap();
        assert_eq!(all_train.train.len(), 3);
        assert!(all_train.validation.is_empty());
    }

    #[test]
    fn test_discover_lists_directories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["010", "002", "001"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let ids = discover_patient_ids(dir.path()).unwrap();
        let names: Vec<_> = ids.iter().map(PatientId::as_str).collect();
        assert_eq!(names, vec!["001", "002", "010"]);
    }

    #[test]
    fn test_get_reports_missing_file_and_bad_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatasetConfig::new(dir.path().to_path_buf());
        let dataset = VolumePairDataset::new(patient_ids(1, 1, 3), &config);
        assert_eq!(dataset.len(), 1);

        let err = dataset.get(0).unwrap().unwrap_err();
        assert!(matches!(*err, TrainError::Io { .. }));
        assert!(err.to_string().contains("T1w_1mm_normalized.nii.gz"));

        assert!(dataset.get(5).is_none());
    }
}
