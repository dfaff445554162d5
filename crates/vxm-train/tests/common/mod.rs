#![allow(dead_code)]

use std::path::Path;

use vxm_core::{Geometry, Volume};
use vxm_model::VoxelMorphConfig;
use vxm_train::{DatasetConfig, TrainingConfig};

/// Isotropic Gaussian blob centred at `center` (z, y, x).
pub fn blob(dims: [usize; 3], center: [f32; 3], sigma: f32) -> Vec<f32> {
    let [d, h, w] = dims;
    let mut values = Vec::with_capacity(d * h * w);
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let dz = z as f32 - center[0];
                let dy = y as f32 - center[1];
                let dx = x as f32 - center[2];
                values.push((-(dz * dz + dy * dy + dx * dx) / (2.0 * sigma * sigma)).exp());
            }
        }
    }
    values
}

/// Write a fixed/moving pair for patient `id` under `root`, the moving blob
/// offset by `shift` voxels along x.
pub fn write_patient(root: &Path, id: &str, dims: [usize; 3], shift: f32) {
    let dir = root.join(id).join("normalized");
    std::fs::create_dir_all(&dir).unwrap();
    let c = [dims[0] as f32 / 2.0, dims[1] as f32 / 2.0, dims[2] as f32 / 2.0];

    let fixed = Volume::from_vec(dims, blob(dims, c, 2.0), Geometry::default()).unwrap();
    let moving = Volume::from_vec(dims, blob(dims, [c[0], c[1], c[2] + shift], 2.0), Geometry::default()).unwrap();
    vxm_io::write_nifti(dir.join("T1w_1mm_normalized.nii.gz"), &fixed).unwrap();
    vxm_io::write_nifti(dir.join("T2w_1mm_normalized.nii.gz"), &moving).unwrap();
}

/// Patients `001..=count` with 8x8x8 volumes.
pub fn write_dataset(root: &Path, count: usize) {
    for n in 1..=count {
        write_patient(root, &format!("{n:03}"), [8, 8, 8], (n % 3) as f32 * 0.5);
    }
}

pub fn tiny_model() -> VoxelMorphConfig {
    VoxelMorphConfig::new()
        .with_enc_features(vec![4, 4])
        .with_dec_features(vec![4, 4])
        .with_final_features(vec![4])
}

pub fn tiny_config(root: &Path, out: &Path, patients: usize) -> TrainingConfig {
    TrainingConfig::new(DatasetConfig::new(root.to_path_buf()).with_patient_count(patients))
        .with_model(tiny_model())
        .with_dims([8, 8, 8])
        .with_batch_size(2)
        .with_num_epochs(1)
        .with_num_workers(0)
        .with_ncc_window(3)
        .with_output_dir(out.join("registered"))
        .with_checkpoint(out.join("model"))
}
