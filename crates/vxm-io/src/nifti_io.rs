use anyhow::{bail, ensure, Context, Result};
use ndarray::{stack, Array3, ArrayView3, Axis, Ix3, IxDyn};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;
use vxm_core::{Geometry, Volume};

/// Read a 3-D NIfTI file (`.nii` or `.nii.gz`) into a single-channel [`Volume`].
///
/// Voxels are returned as `[1, Z, Y, X]`; geometry comes from the sform when
/// present, else the qform, else pixdim scaling alone. A trailing singleton
/// fourth dimension is accepted and dropped.
pub fn read_nifti<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read NIfTI file {}", path.display()))?;
    let geometry = Geometry::from_affine(header_affine(obj.header()));

    let array = obj
        .into_volume()
        .into_ndarray::<f32>()
        .context("Failed to convert volume to ndarray")?;
    let array = squeeze_trailing(array)?;

    // NIfTI is indexed [X, Y, Z]; volumes are stored [Z, Y, X].
    let zyx = array.permuted_axes([2, 1, 0]).as_standard_layout().into_owned();

    tracing::debug!(path = %path.display(), shape = ?zyx.shape(), "read NIfTI volume");
    Ok(Volume::from_spatial(zyx, geometry)?)
}

/// Write a single-channel volume as a 3-D NIfTI file.
///
/// The file is gzip-compressed when the path ends in `.gz`.
pub fn write_nifti<P: AsRef<Path>>(path: P, volume: &Volume) -> Result<()> {
    ensure!(
        volume.channels() == 1,
        "Expected a single-channel volume, found {} channels",
        volume.channels()
    );
    let path = path.as_ref();
    let zyx = volume.channel(0);
    let xyz = zyx.view().permuted_axes([2, 1, 0]);
    let header = reference_header(volume.geometry());

    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&xyz)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.display(), e))?;
    Ok(())
}

/// Write several same-shaped single-channel volumes as one 4-D NIfTI file
/// `[X, Y, Z, N]`. The first volume's geometry is used for the header.
pub fn write_nifti_stack<P: AsRef<Path>>(path: P, volumes: &[Volume]) -> Result<()> {
    let Some(first) = volumes.first() else {
        bail!("Cannot write an empty volume stack");
    };
    if volumes.len() == 1 {
        return write_nifti(path, first);
    }
    let shape = first.spatial_shape();
    for (i, v) in volumes.iter().enumerate() {
        ensure!(
            v.channels() == 1 && v.spatial_shape() == shape,
            "Volume {} shape mismatch: {:?} vs [1, {:?}]",
            i,
            v.shape(),
            shape
        );
    }

    let channels: Vec<Array3<f32>> = volumes.iter().map(|v| v.channel(0)).collect();
    let views: Vec<ArrayView3<f32>> = channels
        .iter()
        .map(|c| c.view().permuted_axes([2, 1, 0]))
        .collect();
    let stacked = stack(Axis(3), &views).context("Failed to stack volumes")?;

    let path = path.as_ref();
    let header = reference_header(first.geometry());
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&stacked)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.display(), e))?;
    Ok(())
}

fn squeeze_trailing(array: ndarray::Array<f32, IxDyn>) -> Result<ndarray::Array<f32, Ix3>> {
    let shape = array.shape().to_vec();
    let array = match shape.len() {
        3 => array,
        4 if shape[3] == 1 => array.index_axis_move(Axis(3), 0),
        n => bail!("Expected 3D NIfTI file, found {} dimensions {:?}", n, shape),
    };
    array
        .into_dimensionality::<Ix3>()
        .context("Failed to view volume as 3D")
}

/// Voxel-to-world affine (top three rows) following the NIfTI-1 precedence
/// sform > qform > pixdim.
fn header_affine(header: &NiftiHeader) -> [[f64; 4]; 3] {
    if header.sform_code > 0 {
        let row = |r: [f32; 4]| r.map(f64::from);
        return [row(header.srow_x), row(header.srow_y), row(header.srow_z)];
    }

    let dx = header.pixdim[1] as f64;
    let dy = header.pixdim[2] as f64;
    let dz = header.pixdim[3] as f64;

    if header.qform_code > 0 {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let dz = dz * qfac;

        return [
            [
                (a * a + b * b - c * c - d * d) * dx,
                (2.0 * b * c - 2.0 * a * d) * dy,
                (2.0 * b * d + 2.0 * a * c) * dz,
                header.quatern_x as f64,
            ],
            [
                (2.0 * b * c + 2.0 * a * d) * dx,
                (a * a + c * c - b * b - d * d) * dy,
                (2.0 * c * d - 2.0 * a * b) * dz,
                header.quatern_y as f64,
            ],
            [
                (2.0 * b * d - 2.0 * a * c) * dx,
                (2.0 * c * d + 2.0 * a * b) * dy,
                (a * a + d * d - c * c - b * b) * dz,
                header.quatern_z as f64,
            ],
        ];
    }

    [
        [dx, 0.0, 0.0, 0.0],
        [0.0, dy, 0.0, 0.0],
        [0.0, 0.0, dz, 0.0],
    ]
}

fn reference_header(geometry: &Geometry) -> NiftiHeader {
    let affine = geometry.affine();
    let row = |r: [f64; 4]| r.map(|v| v as f32);

    let mut header = NiftiHeader::default();
    header.pixdim[0] = 1.0;
    for axis in 0..3 {
        header.pixdim[axis + 1] = geometry.spacing[axis] as f32;
    }
    header.sform_code = 1;
    header.srow_x = row(affine[0]);
    header.srow_y = row(affine[1]);
    header.srow_z = row(affine[2]);
    header
}
