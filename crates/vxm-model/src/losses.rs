use burn::tensor::{
    backend::Backend,
    module::conv3d,
    ops::ConvOptions,
    Tensor,
};

use crate::capability::Scoreable;

/// Local normalized cross-correlation penalty.
///
/// Squared correlation is computed over a cubic sliding window (`window`
/// voxels per side, zero padded) and averaged over all voxels. A perfect
/// local match gives `cc = 1`; the penalty is `1 - mean(cc)`, clamped at 0 so
/// it stays non-negative under rounding.
pub fn ncc_penalty<B: Backend>(fixed: Tensor<B, 5>, registered: Tensor<B, 5>, window: usize) -> Tensor<B, 1> {
    const EPSILON: f32 = 1e-5;

    let [_, channels, _, _, _] = fixed.dims();
    let device = fixed.device();
    let padding = window / 2;
    let n = (window * window * window) as f32;

    // Depthwise box filter computing local means.
    let weight = Tensor::<B, 5>::ones([channels, 1, window, window, window], &device).div_scalar(n);
    let options = ConvOptions::new([1, 1, 1], [padding, padding, padding], [1, 1, 1], channels);
    let local_mean = |x: Tensor<B, 5>| conv3d(x, weight.clone(), None, options.clone());

    let i2 = fixed.clone() * fixed.clone();
    let j2 = registered.clone() * registered.clone();
    let ij = fixed.clone() * registered.clone();

    let i_mean = local_mean(fixed);
    let j_mean = local_mean(registered);
    let i2_mean = local_mean(i2);
    let j2_mean = local_mean(j2);
    let ij_mean = local_mean(ij);

    let cross = ij_mean - i_mean.clone() * j_mean.clone();
    let i_var = i2_mean - i_mean.powf_scalar(2.0);
    let j_var = j2_mean - j_mean.powf_scalar(2.0);

    let cc = cross.clone() * cross / (i_var * j_var + EPSILON);
    cc.mean().neg().add_scalar(1.0).clamp_min(0.0)
}

/// Smoothness penalty: mean squared forward difference of the displacement
/// field along each spatial axis, averaged over the axes that have at least
/// two voxels.
pub fn grad_penalty<B: Backend>(flow: Tensor<B, 5>) -> Tensor<B, 1> {
    let [b, c, d, h, w] = flow.dims();
    let mut terms = Vec::with_capacity(3);

    if d > 1 {
        let dz = flow.clone().slice([0..b, 0..c, 1..d, 0..h, 0..w])
            - flow.clone().slice([0..b, 0..c, 0..d - 1, 0..h, 0..w]);
        terms.push(dz.powf_scalar(2.0).mean());
    }
    if h > 1 {
        let dy = flow.clone().slice([0..b, 0..c, 0..d, 1..h, 0..w])
            - flow.clone().slice([0..b, 0..c, 0..d, 0..h - 1, 0..w]);
        terms.push(dy.powf_scalar(2.0).mean());
    }
    if w > 1 {
        let dx = flow.clone().slice([0..b, 0..c, 0..d, 0..h, 1..w])
            - flow.clone().slice([0..b, 0..c, 0..d, 0..h, 0..w - 1]);
        terms.push(dx.powf_scalar(2.0).mean());
    }

    let count = terms.len();
    if count == 0 {
        return Tensor::zeros([1], &flow.device());
    }
    Tensor::cat(terms, 0).sum().div_scalar(count as f32)
}

/// Scalar loss terms of one forward pass.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub total: Tensor<B, 1>,
    pub similarity: Tensor<B, 1>,
    pub smoothness: Tensor<B, 1>,
}

/// `ncc_penalty(fixed, registered) + lambda * grad_penalty(flow)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelMorphLoss {
    /// Side of the cubic NCC window (odd).
    pub window: usize,
    /// Weight of the smoothness term.
    pub lambda: f64,
}

impl Default for VoxelMorphLoss {
    fn default() -> Self {
        Self {
            window: 9,
            lambda: 0.01,
        }
    }
}

impl VoxelMorphLoss {
    pub fn new(window: usize, lambda: f64) -> Self {
        Self { window, lambda }
    }

    pub fn forward<B: Backend>(
        &self,
        registered: Tensor<B, 5>,
        fixed: Tensor<B, 5>,
        flow: Tensor<B, 5>,
    ) -> LossTerms<B> {
        let similarity = ncc_penalty(fixed, registered, self.window);
        let smoothness = grad_penalty(flow);
        let total = similarity.clone() + smoothness.clone().mul_scalar(self.lambda);
        LossTerms {
            total,
            similarity,
            smoothness,
        }
    }
}

/// Soft Dice overlap `2 sum(ab) / (sum(a^2) + sum(b^2))`, computed per sample
/// and averaged over the batch. In `[0, 1]` for non-negative intensities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiceScore {
    pub epsilon: f32,
}

impl Default for DiceScore {
    fn default() -> Self {
        Self { epsilon: 1e-5 }
    }
}

impl Scoreable for DiceScore {
    fn similarity<B: Backend>(&self, a: Tensor<B, 5>, b: Tensor<B, 5>) -> Tensor<B, 1> {
        let [n, c, d, h, w] = a.dims();
        let a = a.reshape([n, c * d * h * w]);
        let b = b.reshape([n, c * d * h * w]);

        let top = (a.clone() * b.clone()).sum_dim(1).mul_scalar(2.0);
        let bottom = a.powf_scalar(2.0).sum_dim(1) + b.powf_scalar(2.0).sum_dim(1);
        (top / bottom.add_scalar(self.epsilon)).mean()
    }
}
