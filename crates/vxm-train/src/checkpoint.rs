//! Network checkpoints in burn's named MessagePack format, full precision.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::error::{Result, TrainError};

/// File the recorder writes for `path`: the extension becomes `.mpk`.
pub fn checkpoint_file(path: &Path) -> PathBuf {
    path.with_extension("mpk")
}

/// Save `network` to `{path}.mpk`, creating parent directories.
pub fn save_network<B: Backend, M: Module<B>>(network: M, path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| TrainError::checkpoint(format!("mkdir {}: {e}", parent.display())))?;
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let full_path = checkpoint_file(path);
    network
        .save_file(path.to_path_buf(), &recorder)
        .map_err(|e| TrainError::checkpoint(format!("save {}: {e}", full_path.display())))?;

    tracing::info!(path = %full_path.display(), "saved checkpoint");
    Ok(full_path)
}

/// Load weights from `{path}.mpk` into `network`.
pub fn load_network<B: Backend, M: Module<B>>(network: M, path: &Path, device: &B::Device) -> Result<M> {
    let full_path = checkpoint_file(path);
    if !full_path.exists() {
        return Err(TrainError::checkpoint(format!("{} does not exist", full_path.display())));
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let loaded = network
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| TrainError::checkpoint(format!("load {}: {e}", full_path.display())))?;

    tracing::info!(path = %full_path.display(), "loaded checkpoint");
    Ok(loaded)
}
