//! Conversion between host [`Volume`]s and burn batch tensors.

use anyhow::{ensure, Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use vxm_core::{Geometry, Volume};

/// Stack volumes into a `[N, C, D, H, W]` tensor on `device`.
///
/// All volumes must share one shape.
pub fn volumes_to_batch<B: Backend>(volumes: &[Volume], device: &B::Device) -> Result<Tensor<B, 5>> {
    ensure!(!volumes.is_empty(), "Cannot batch an empty list of volumes");

    let shape = volumes[0].shape();
    for (i, volume) in volumes.iter().enumerate().skip(1) {
        ensure!(
            volume.shape() == shape,
            "Volume {} shape mismatch: {:?} vs {:?}",
            i,
            volume.shape(),
            shape
        );
    }

    let [c, d, h, w] = shape;
    let mut values = Vec::with_capacity(volumes.len() * c * d * h * w);
    for volume in volumes {
        values.extend(volume.data().iter().copied());
    }

    let data = TensorData::new(values, [volumes.len(), c, d, h, w]);
    Ok(Tensor::from_data(data, device))
}

/// Split a `[N, C, D, H, W]` tensor back into host volumes.
///
/// `geometries` holds one entry per sample, or a single entry shared by all.
pub fn batch_to_volumes<B: Backend>(batch: Tensor<B, 5>, geometries: &[Geometry]) -> Result<Vec<Volume>> {
    let [n, c, d, h, w] = batch.dims();
    ensure!(
        geometries.len() == n || geometries.len() == 1,
        "Expected 1 or {} geometries, got {}",
        n,
        geometries.len()
    );

    let values = batch
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read tensor data: {e:?}"))?;

    let per_sample = c * d * h * w;
    values
        .chunks_exact(per_sample)
        .enumerate()
        .map(|(i, chunk)| {
            let geometry = geometries.get(i).unwrap_or(&geometries[0]).clone();
            let data = ndarray::Array4::from_shape_vec((c, d, h, w), chunk.to_vec())
                .context("Tensor data does not match its shape")?;
            Volume::new(data, geometry).context("Invalid volume in batch")
        })
        .collect()
}
