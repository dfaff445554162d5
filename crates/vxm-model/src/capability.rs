//! Capability traits the training loop is written against.
//!
//! The loop never names a concrete network: anything that can turn a
//! `(moving, fixed)` pair into a registered image and a deformation field is
//! [`Registerable`], and anything that can compare two images is
//! [`Scoreable`].

use burn::tensor::{backend::Backend, Tensor};

/// Result of one registration forward pass.
#[derive(Debug, Clone)]
pub struct RegistrationOutput<B: Backend> {
    /// Moving image warped into the fixed frame `[N, C, D, H, W]`.
    pub registered: Tensor<B, 5>,
    /// Per-voxel displacement in voxel units `[N, 3, D, H, W]`, ordered `(z, y, x)`.
    pub flow: Tensor<B, 5>,
}

/// A model that registers a moving image onto a fixed image.
pub trait Registerable<B: Backend> {
    /// Both inputs are `[N, 1, D, H, W]` on the same device.
    fn register(&self, moving: Tensor<B, 5>, fixed: Tensor<B, 5>) -> RegistrationOutput<B>;
}

/// A similarity score between two images; higher is better.
pub trait Scoreable {
    /// Returns a single-element tensor.
    fn similarity<B: Backend>(&self, a: Tensor<B, 5>, b: Tensor<B, 5>) -> Tensor<B, 1>;
}
