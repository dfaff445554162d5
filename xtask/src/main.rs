use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

mod synth;

use synth::SynthOptions;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation for the vxm workspace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a synthetic T1/T2 patient dataset
    SynthData {
        /// Dataset root; one directory per patient is created inside
        #[arg(short, long, default_value = "data")]
        output: PathBuf,

        /// Number of patients
        #[arg(short, long, default_value_t = 6)]
        patients: usize,

        /// Volume shape as D,H,W
        #[arg(long, value_delimiter = ',', default_value = "32,32,32")]
        dims: Vec<usize>,

        /// Largest T2 displacement in voxels, per axis
        #[arg(long, default_value_t = 2.0)]
        max_shift: f32,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Check every patient directory holds a readable, matching pair
    VerifyData {
        /// Dataset root
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        /// Required volume shape as D,H,W
        #[arg(long, value_delimiter = ',')]
        dims: Option<Vec<usize>>,
    },

    /// Remove registered volumes and the checkpoint of a run
    Clean {
        #[arg(long, default_value = "output_images")]
        output_dir: PathBuf,

        #[arg(long, default_value = "model")]
        checkpoint: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::SynthData {
            output,
            patients,
            dims,
            max_shift,
            seed,
        } => {
            let options = SynthOptions {
                patients,
                dims: parse_dims(&dims)?,
                max_shift,
                seed,
                ..SynthOptions::default()
            };
            let created = synth::synthesize(&output, &options)?;
            info!("Wrote {} patients to {}", created.len(), output.display());
        }
        Commands::VerifyData { data_dir, dims } => {
            let dims = dims.as_deref().map(parse_dims).transpose()?;
            let report = verify_data(&data_dir, &SynthOptions::default(), dims)?;
            info!("{} patients verified", report.valid);
            ensure!(report.invalid.is_empty(), "{} patients failed verification", report.invalid.len());
        }
        Commands::Clean { output_dir, checkpoint } => {
            clean_outputs(&output_dir, &checkpoint)?;
        }
    }

    Ok(())
}

fn parse_dims(dims: &[usize]) -> Result<[usize; 3]> {
    match dims {
        &[d, h, w] if d > 0 && h > 0 && w > 0 => Ok([d, h, w]),
        other => anyhow::bail!("dims must be three positive sizes, got {:?}", other),
    }
}

#[derive(Debug, Default)]
struct VerifyReport {
    valid: usize,
    invalid: Vec<PathBuf>,
}

fn verify_data(data_dir: &Path, layout: &SynthOptions, dims: Option<[usize; 3]>) -> Result<VerifyReport> {
    info!("Verifying dataset in: {}", data_dir.display());
    ensure!(data_dir.is_dir(), "Data directory does not exist: {}", data_dir.display());

    let mut report = VerifyReport::default();
    let mut patients: Vec<_> = walkdir::WalkDir::new(data_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    patients.sort();

    // Decode patients in parallel, report in sorted order.
    let results: Vec<_> = patients
        .par_iter()
        .map(|patient| verify_patient(patient, layout, dims))
        .collect();

    for (patient, result) in patients.into_iter().zip(results) {
        match result {
            Ok(shape) => {
                report.valid += 1;
                info!("  {} ok {:?}", patient.display(), shape);
            }
            Err(e) => {
                warn!("  {}: {:#}", patient.display(), e);
                report.invalid.push(patient);
            }
        }
    }
    Ok(report)
}

fn verify_patient(patient: &Path, layout: &SynthOptions, dims: Option<[usize; 3]>) -> Result<[usize; 3]> {
    let dir = patient.join(&layout.subdir);
    let fixed = vxm_io::read_nifti(dir.join(&layout.fixed_file))?;
    let moving = vxm_io::read_nifti(dir.join(&layout.moving_file))?;
    ensure!(
        fixed.spatial_shape() == moving.spatial_shape(),
        "fixed {:?} and moving {:?} shapes differ",
        fixed.spatial_shape(),
        moving.spatial_shape()
    );
    if let Some(dims) = dims {
        ensure!(
            fixed.spatial_shape() == dims,
            "shape {:?} does not match required {:?}",
            fixed.spatial_shape(),
            dims
        );
    }
    Ok(fixed.spatial_shape())
}

fn clean_outputs(output_dir: &Path, checkpoint: &Path) -> Result<()> {
    if output_dir.exists() {
        info!("Removing output directory: {}", output_dir.display());
        std::fs::remove_dir_all(output_dir)?;
    } else {
        info!("No output directory to clean");
    }

    let checkpoint = checkpoint.with_extension("mpk");
    if checkpoint.exists() {
        info!("Removing checkpoint: {}", checkpoint.display());
        std::fs::remove_file(&checkpoint)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_flags_broken_patients() {
        let dir = tempfile::tempdir().unwrap();
        let options = SynthOptions {
            patients: 2,
            dims: [4, 4, 4],
            ..SynthOptions::default()
        };
        synth::synthesize(dir.path(), &options).unwrap();
        std::fs::create_dir_all(dir.path().join("003")).unwrap();

        let report = verify_data(dir.path(), &options, Some([4, 4, 4])).unwrap();
        assert_eq!(report.valid, 2);
        assert_eq!(report.invalid, vec![dir.path().join("003")]);

        let report = verify_data(dir.path(), &options, Some([4, 4, 5])).unwrap();
        assert_eq!(report.valid, 0);
    }

    #[test]
    fn test_parse_dims() {
        assert_eq!(parse_dims(&[1, 2, 3]).unwrap(), [1, 2, 3]);
        assert!(parse_dims(&[1, 2]).is_err());
        assert!(parse_dims(&[0, 2, 3]).is_err());
    }

    #[test]
    fn test_clean_removes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output_images");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("a.nii.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("model.mpk"), b"x").unwrap();

        clean_outputs(&out, &dir.path().join("model")).unwrap();
        assert!(!out.exists());
        assert!(!dir.path().join("model.mpk").exists());
        clean_outputs(&out, &dir.path().join("model")).unwrap();
    }
}
