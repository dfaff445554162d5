use burn::tensor::{backend::Backend, Int, Tensor};

use crate::interpolation::trilinear_interpolation;

/// Warp `image` by a dense displacement field.
///
/// * `image` - [B, C, D, H, W]
/// * `flow` - [B, 3, D, H, W], displacement in voxels ordered (z, y, x)
///
/// Output voxel `p` takes the value of `image` at `p + flow(p)`.
pub fn warp<B: Backend>(image: Tensor<B, 5>, flow: Tensor<B, 5>) -> Tensor<B, 5> {
    let [b, _c, d, h, w] = image.dims();
    let device = image.device();

    let flow_d = flow.clone().slice([0..b, 0..1, 0..d, 0..h, 0..w]);
    let flow_h = flow.clone().slice([0..b, 1..2, 0..d, 0..h, 0..w]);
    let flow_w = flow.slice([0..b, 2..3, 0..d, 0..h, 0..w]);

    // Broadcastable coordinate ramps; no full identity grid is allocated.
    let d_range = Tensor::<B, 1, Int>::arange(0..d as i64, &device)
        .float()
        .reshape([1, 1, d, 1, 1]);
    let h_range = Tensor::<B, 1, Int>::arange(0..h as i64, &device)
        .float()
        .reshape([1, 1, 1, h, 1]);
    let w_range = Tensor::<B, 1, Int>::arange(0..w as i64, &device)
        .float()
        .reshape([1, 1, 1, 1, w]);

    let sampling_grid = Tensor::cat(vec![flow_d + d_range, flow_h + h_range, flow_w + w_range], 1);
    trilinear_interpolation(image, sampling_grid)
}

/// Integrate a stationary velocity field into a displacement field by
/// scaling and squaring: scale by `1 / 2^steps`, then compose the field with
/// itself `steps` times.
pub fn integrate_velocity<B: Backend>(velocity: Tensor<B, 5>, steps: usize) -> Tensor<B, 5> {
    let scale = 0.5_f64.powi(steps as i32);
    let mut flow = velocity.mul_scalar(scale);
    for _ in 0..steps {
        let warped = warp(flow.clone(), flow.clone());
        flow = flow + warped;
    }
    flow
}
