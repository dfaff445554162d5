//! VoxelMorph-style U-Net predicting a dense displacement field.
//!
//! ```text
//! [moving, fixed] (2 ch)
//!     │  stride-2 conv blocks ─────────────┐ skip connections
//!     ▼                                    │
//! bottleneck ─► transpose-conv + concat ◄──┘ per level
//!     ▼
//! full-resolution conv blocks ─► flow head (3 ch)
//!     ▼
//! optional scaling-and-squaring integration ─► warp(moving, flow)
//! ```
//!
//! Inputs whose spatial size is not a multiple of `2^levels` are zero padded
//! before encoding and the predicted field is cropped back, so any volume
//! size (e.g. 182x218x182) can be registered.

use burn::{
    module::Ignored,
    nn::{
        conv::{Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig},
        Initializer, PaddingConfig3d,
    },
    prelude::*,
    tensor::activation::leaky_relu,
};

use crate::capability::{Registerable, RegistrationOutput};
use crate::spatial_transform::{integrate_velocity, warp};

const LEAKY_SLOPE: f64 = 0.2;

/// Configuration for [`VoxelMorph`].
#[derive(Config, Debug, PartialEq)]
pub struct VoxelMorphConfig {
    /// Input channels: moving and fixed concatenated.
    #[config(default = "2")]
    pub in_channels: usize,
    /// Output channels of each stride-2 encoder level.
    #[config(default = "vec![16, 32, 32, 32]")]
    pub enc_features: Vec<usize>,
    /// Output channels of each decoder level; one per encoder level.
    #[config(default = "vec![32, 32, 32, 32]")]
    pub dec_features: Vec<usize>,
    /// Extra full-resolution conv blocks before the flow head.
    #[config(default = "vec![32, 16, 16]")]
    pub final_features: Vec<usize>,
    /// Scaling-and-squaring steps; 0 predicts the displacement directly.
    #[config(default = "0")]
    pub integration_steps: usize,
}

impl VoxelMorphConfig {
    /// Check the feature lists describe a buildable network.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.in_channels > 0, "in_channels must be positive");
        anyhow::ensure!(!self.enc_features.is_empty(), "enc_features must not be empty");
        anyhow::ensure!(
            self.dec_features.len() == self.enc_features.len(),
            "dec_features has {} levels but enc_features has {}",
            self.dec_features.len(),
            self.enc_features.len()
        );
        let all = self
            .enc_features
            .iter()
            .chain(&self.dec_features)
            .chain(&self.final_features);
        anyhow::ensure!(all.clone().all(|&f| f > 0), "feature counts must be positive");
        Ok(())
    }

    /// Build the network. Feature lists must satisfy [`Self::validate`].
    pub fn init<B: Backend>(&self, device: &B::Device) -> VoxelMorph<B> {
        let levels = self.enc_features.len();

        let mut encoder = Vec::with_capacity(levels);
        let mut channels = self.in_channels;
        for &features in &self.enc_features {
            encoder.push(ConvBlock::new(channels, features, 2, device));
            channels = features;
        }

        // Skip inputs seen by decoder level j, deepest first.
        let skip_channels = |j: usize| match levels - 1 - j {
            0 => self.in_channels,
            idx => self.enc_features[idx - 1],
        };

        let mut upsample = Vec::with_capacity(levels);
        let mut decoder = Vec::with_capacity(levels);
        for (j, &features) in self.dec_features.iter().enumerate() {
            upsample.push(
                ConvTranspose3dConfig::new([channels, channels], [2, 2, 2])
                    .with_stride([2, 2, 2])
                    .init(device),
            );
            decoder.push(ConvBlock::new(channels + skip_channels(j), features, 1, device));
            channels = features;
        }

        let mut remaining = Vec::with_capacity(self.final_features.len());
        for &features in &self.final_features {
            remaining.push(ConvBlock::new(channels, features, 1, device));
            channels = features;
        }

        // Near-zero initial field: training starts from the identity warp.
        let flow = Conv3dConfig::new([channels, 3], [3, 3, 3])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .with_initializer(Initializer::Normal { mean: 0.0, std: 1e-5 })
            .init(device);

        tracing::debug!(
            levels,
            enc = ?self.enc_features,
            dec = ?self.dec_features,
            integration_steps = self.integration_steps,
            "initialized VoxelMorph"
        );

        VoxelMorph {
            encoder,
            upsample,
            decoder,
            remaining,
            flow,
            integration_steps: Ignored(self.integration_steps),
        }
    }
}

/// Conv3d (3x3x3, padding 1) followed by LeakyReLU(0.2).
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv3d<B>,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv = Conv3dConfig::new([in_channels, out_channels], [3, 3, 3])
            .with_stride([stride, stride, stride])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .init(device);
        Self { conv }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        leaky_relu(self.conv.forward(x), LEAKY_SLOPE)
    }
}

#[derive(Module, Debug)]
pub struct VoxelMorph<B: Backend> {
    encoder: Vec<ConvBlock<B>>,
    upsample: Vec<ConvTranspose3d<B>>,
    decoder: Vec<ConvBlock<B>>,
    remaining: Vec<ConvBlock<B>>,
    flow: Conv3d<B>,
    integration_steps: Ignored<usize>,
}

impl<B: Backend> VoxelMorph<B> {
    /// Predict the raw field (displacement, or velocity when integrating)
    /// from a concatenated `[N, 2, D, H, W]` input.
    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let [n, _, d, h, w] = input.dims();
        let x = pad_to_multiple(input, 1 << self.encoder.len());

        let mut skips = Vec::with_capacity(self.encoder.len());
        let mut x = x;
        for block in &self.encoder {
            skips.push(x.clone());
            x = block.forward(x);
        }

        for ((up, block), skip) in self
            .upsample
            .iter()
            .zip(&self.decoder)
            .zip(skips.into_iter().rev())
        {
            let x_up = up.forward(x);
            x = block.forward(Tensor::cat(vec![x_up, skip], 1));
        }

        for block in &self.remaining {
            x = block.forward(x);
        }

        self.flow.forward(x).slice([0..n, 0..3, 0..d, 0..h, 0..w])
    }

    /// Number of stride-2 levels; inputs are padded to a multiple of `2^levels`.
    pub fn levels(&self) -> usize {
        self.encoder.len()
    }

    pub fn integration_steps(&self) -> usize {
        self.integration_steps.0
    }
}

impl<B: Backend> Registerable<B> for VoxelMorph<B> {
    fn register(&self, moving: Tensor<B, 5>, fixed: Tensor<B, 5>) -> RegistrationOutput<B> {
        let input = Tensor::cat(vec![moving.clone(), fixed], 1);
        let mut flow = self.forward(input);
        if self.integration_steps.0 > 0 {
            flow = integrate_velocity(flow, self.integration_steps.0);
        }
        let registered = warp(moving, flow.clone());
        RegistrationOutput { registered, flow }
    }
}

/// Zero pad the spatial dims up to the next multiple of `factor`.
fn pad_to_multiple<B: Backend>(x: Tensor<B, 5>, factor: usize) -> Tensor<B, 5> {
    let [n, c, d, h, w] = x.dims();
    let round_up = |s: usize| s.div_ceil(factor) * factor;
    let (pd, ph, pw) = (round_up(d), round_up(h), round_up(w));
    if (pd, ph, pw) == (d, h, w) {
        return x;
    }
    let device = x.device();
    Tensor::zeros([n, c, pd, ph, pw], &device).slice_assign([0..n, 0..c, 0..d, 0..h, 0..w], x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> VoxelMorphConfig {
        VoxelMorphConfig::new()
            .with_enc_features(vec![4, 8])
            .with_dec_features(vec![8, 4])
            .with_final_features(vec![4])
    }

    #[test]
    fn test_validate_rejects_mismatched_levels() {
        let config = VoxelMorphConfig::new().with_dec_features(vec![8]);
        assert!(config.validate().is_err());
        assert!(small_config().validate().is_ok());
        assert!(VoxelMorphConfig::new().validate().is_ok());
    }

    #[test]
    fn test_forward_preserves_spatial_shape_for_odd_sizes() {
        let device = Default::default();
        let model: VoxelMorph<TestBackend> = small_config().init(&device);
        let input = Tensor::<TestBackend, 5>::random([2, 2, 5, 6, 7], Distribution::Normal(0.0, 1.0), &device);
        let flow = model.forward(input);
        assert_eq!(flow.dims(), [2, 3, 5, 6, 7]);
    }

    #[test]
    fn test_initial_flow_is_near_identity() {
        let device = Default::default();
        let model: VoxelMorph<TestBackend> = small_config().init(&device);
        let moving = Tensor::<TestBackend, 5>::random([1, 1, 8, 8, 8], Distribution::Uniform(0.0, 1.0), &device);
        let fixed = moving.clone();
        let out = model.register(moving.clone(), fixed);
        assert_eq!(out.registered.dims(), [1, 1, 8, 8, 8]);
        let max_flow = out.flow.abs().max().into_scalar();
        assert!(max_flow < 1e-2, "initial flow {max_flow}");
        let diff = (out.registered - moving).abs().max().into_scalar();
        assert!(diff < 1e-2);
    }

    #[test]
    fn test_pad_to_multiple() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 5>::ones([1, 1, 3, 4, 5], &device);
        let padded = pad_to_multiple(x.clone(), 4);
        assert_eq!(padded.dims(), [1, 1, 4, 4, 8]);
        assert_eq!(padded.sum().into_scalar(), 60.0);
        assert_eq!(pad_to_multiple(x, 1).dims(), [1, 1, 3, 4, 5]);
    }
}
