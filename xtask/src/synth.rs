//! Synthetic T1/T2 patient volumes for smoke-testing the pipeline.
//!
//! Each patient gets an ellipsoidal "brain" with a brighter inner core. The
//! T1 volume has bright tissue; the T2 volume has the inverted contrast and is
//! displaced by a random sub-voxel offset, so there is something to register.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vxm_core::{Geometry, Volume};

#[derive(Debug, Clone)]
pub struct SynthOptions {
    pub patients: usize,
    pub first: usize,
    pub width: usize,
    pub dims: [usize; 3],
    pub max_shift: f32,
    pub noise: f32,
    pub seed: u64,
    pub subdir: String,
    pub fixed_file: String,
    pub moving_file: String,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            patients: 6,
            first: 1,
            width: 3,
            dims: [32, 32, 32],
            max_shift: 2.0,
            noise: 0.02,
            seed: 42,
            subdir: "normalized".to_string(),
            fixed_file: "T1w_1mm_normalized.nii.gz".to_string(),
            moving_file: "T2w_1mm_normalized.nii.gz".to_string(),
        }
    }
}

/// Tissue intensity at normalized ellipsoid radius `r` (1.0 at the surface).
fn tissue(r: f32) -> f32 {
    let edge = 1.0 / (1.0 + ((r - 1.0) * 12.0).exp());
    let core = 1.0 / (1.0 + ((r - 0.5) * 12.0).exp());
    0.6 * edge + 0.4 * core
}

fn phantom(dims: [usize; 3], offset: [f32; 3], invert: bool, noise: f32, rng: &mut StdRng) -> Vec<f32> {
    let [d, h, w] = dims;
    let center = [d as f32 / 2.0, h as f32 / 2.0, w as f32 / 2.0];
    let radii = [d as f32 * 0.35, h as f32 * 0.4, w as f32 * 0.35];

    let mut values = Vec::with_capacity(d * h * w);
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let p = [z as f32, y as f32, x as f32];
                let r = (0..3)
                    .map(|a| ((p[a] - center[a] - offset[a]) / radii[a]).powi(2))
                    .sum::<f32>()
                    .sqrt();
                let t = tissue(r);
                let mask = tissue(r * 0.6).min(1.0);
                let value = if invert { mask * (1.0 - t) } else { t };
                let jitter = if noise > 0.0 { rng.random_range(-noise..noise) } else { 0.0 };
                values.push((value + jitter).max(0.0));
            }
        }
    }
    values
}

/// Write the dataset; returns the patient directories created.
pub fn synthesize(root: &Path, options: &SynthOptions) -> Result<Vec<PathBuf>> {
    ensure!(options.patients > 0, "patients must be positive");
    ensure!(options.dims.iter().all(|&n| n > 0), "dims must be positive");
    ensure!(options.max_shift >= 0.0, "max_shift must be non-negative");

    let mut rng = StdRng::seed_from_u64(options.seed);
    let pb = ProgressBar::new(options.patients as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} patients")?
            .progress_chars("#>-"),
    );

    let mut created = Vec::with_capacity(options.patients);
    for n in options.first..options.first + options.patients {
        let id = format!("{n:0width$}", width = options.width);
        let dir = root.join(&id).join(&options.subdir);
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let shift = options.max_shift;
        let offset = if shift > 0.0 {
            [
                rng.random_range(-shift..=shift),
                rng.random_range(-shift..=shift),
                rng.random_range(-shift..=shift),
            ]
        } else {
            [0.0; 3]
        };

        let t1 = phantom(options.dims, [0.0; 3], false, options.noise, &mut rng);
        let t2 = phantom(options.dims, offset, true, options.noise, &mut rng);
        let fixed = Volume::from_vec(options.dims, t1, Geometry::default())?;
        let moving = Volume::from_vec(options.dims, t2, Geometry::default())?;
        vxm_io::write_nifti(dir.join(&options.fixed_file), &fixed)?;
        vxm_io::write_nifti(dir.join(&options.moving_file), &moving)?;

        tracing::debug!(patient = %id, ?offset, "wrote synthetic pair");
        created.push(root.join(&id));
        pb.inc(1);
    }
    pb.finish_with_message("Synthesis complete");
    Ok(created)
}
