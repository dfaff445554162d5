use burn::tensor::{backend::Backend, Int, Tensor};

/// Trilinear interpolation for 3D tensors.
///
/// # Arguments
/// * `image` - Input image [B, C, D, H, W]
/// * `grid` - Sampling grid [B, 3, D, H, W] in voxel coordinates (z, y, x)
///
/// # Returns
/// * Interpolated image [B, C, D, H, W]
///
/// Samples outside the volume take the value of the nearest border voxel.
pub fn trilinear_interpolation<B: Backend>(image: Tensor<B, 5>, grid: Tensor<B, 5>) -> Tensor<B, 5> {
    let [b, c, d, h, w] = image.dims();
    let voxels = d * h * w;

    let coord = |axis: usize| grid.clone().slice([0..b, axis..axis + 1, 0..d, 0..h, 0..w]);
    let z = corners(coord(0), d);
    let y = corners(coord(1), h);
    let x = corners(coord(2), w);

    let flat_img = image.reshape([b, c, voxels]);
    let gather_val = |idx: Tensor<B, 5, Int>| -> Tensor<B, 5> {
        let idx = idx.reshape([b, 1, voxels]).repeat(&[1, c, 1]);
        flat_img.clone().gather(2, idx).reshape([b, c, d, h, w])
    };

    let stride_d = (h * w) as i32;
    let stride_h = w as i32;

    let mut out = Tensor::zeros([b, c, d, h, w], &grid.device());
    for (iz, wz) in [(&z.lo, &z.w_lo), (&z.hi, &z.w_hi)] {
        for (iy, wy) in [(&y.lo, &y.w_lo), (&y.hi, &y.w_hi)] {
            let zy_off = iz.clone().mul_scalar(stride_d) + iy.clone().mul_scalar(stride_h);
            let zy_weight = wz.clone() * wy.clone();
            for (ix, wx) in [(&x.lo, &x.w_lo), (&x.hi, &x.w_hi)] {
                out = out + gather_val(zy_off.clone() + ix.clone()) * (zy_weight.clone() * wx.clone());
            }
        }
    }
    out
}

/// Neighbouring indices and linear weights along one axis.
struct AxisCorners<B: Backend> {
    lo: Tensor<B, 5, Int>,
    hi: Tensor<B, 5, Int>,
    w_lo: Tensor<B, 5>,
    w_hi: Tensor<B, 5>,
}

/// NaN coordinates sample index 0 with NaN weights, so a non-finite field
/// yields a non-finite output instead of an invalid index.
fn corners<B: Backend>(coord: Tensor<B, 5>, size: usize) -> AxisCorners<B> {
    let max = (size - 1) as f32;
    let floor = coord.clone().floor();
    let index = floor.clone().mask_fill(floor.clone().is_nan(), 0.0);
    let w_hi = coord.sub(floor.clone());
    let w_lo = w_hi.clone().neg().add_scalar(1.0);
    AxisCorners {
        lo: index.clone().clamp(0.0, max).int(),
        hi: index.add_scalar(1.0).clamp(0.0, max).int(),
        w_lo,
        w_hi,
    }
}
