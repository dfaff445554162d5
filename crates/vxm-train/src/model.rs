//! The trainable registration model: network, optimizer, loss and score
//! bound together with the expected volume shape.
//!
//! [`RegistrationModel::train_step`] is the only place network parameters
//! and optimizer state change.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use vxm_model::{DiceScore, Registerable, Scoreable, VoxelMorph, VoxelMorphLoss};

use crate::checkpoint;
use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};

/// Scalars and output of one forward pass.
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// `similarity + lambda * smoothness`.
    pub loss: f64,
    pub similarity: f64,
    pub smoothness: f64,
    /// Dice between registered and fixed images.
    pub score: f64,
    /// Registered moving image, detached from the graph.
    pub registered: Tensor<B, 5>,
}

/// SGD with momentum over the VoxelMorph network.
pub type VoxelMorphOptimizer<B> = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, VoxelMorph<B>, B>;

/// The model a [`TrainingConfig`] describes.
pub type VoxelMorphModel<B> = RegistrationModel<B, VoxelMorph<B>, VoxelMorphOptimizer<B>>;

pub struct RegistrationModel<B, N, O, S = DiceScore>
where
    B: AutodiffBackend,
    N: AutodiffModule<B> + Registerable<B>,
    O: Optimizer<N, B>,
    S: Scoreable,
{
    network: N,
    optimizer: O,
    loss: VoxelMorphLoss,
    scorer: S,
    learning_rate: f64,
    dims: [usize; 3],
    device: B::Device,
    steps: usize,
}

impl<B, N, O, S> RegistrationModel<B, N, O, S>
where
    B: AutodiffBackend,
    N: AutodiffModule<B> + Registerable<B>,
    N::InnerModule: Registerable<B::InnerBackend>,
    O: Optimizer<N, B>,
    S: Scoreable,
{
    pub fn new(
        network: N,
        optimizer: O,
        loss: VoxelMorphLoss,
        scorer: S,
        learning_rate: f64,
        dims: [usize; 3],
        device: B::Device,
    ) -> Self {
        Self {
            network,
            optimizer,
            loss,
            scorer,
            learning_rate,
            dims,
            device,
            steps: 0,
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Optimizer steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Replace the network weights with a saved record.
    pub fn load_network(&mut self, path: &Path) -> Result<()> {
        self.network = checkpoint::load_network(self.network.clone(), path, &self.device)?;
        Ok(())
    }

    fn expected_shape(&self) -> [usize; 4] {
        let [d, h, w] = self.dims;
        [1, d, h, w]
    }

    /// Fail unless `batch` is `[N, 1, D, H, W]` with the configured dims.
    pub fn check_batch_dims<BB: Backend>(&self, batch: &Tensor<BB, 5>) -> Result<()> {
        let expected = self.expected_shape();
        let [_, c, d, h, w] = batch.dims();
        if [c, d, h, w] != expected {
            return Err(TrainError::dimension_mismatch(&expected, &[c, d, h, w]));
        }
        Ok(())
    }

    /// Forward, loss, backward and one optimizer step.
    ///
    /// Non-finite inputs, a non-finite predicted field or a non-finite loss
    /// return [`TrainError::NumericalInstability`] before back-propagation,
    /// leaving weights and optimizer state unchanged. The error's epoch and
    /// batch are zero; callers attach them with [`TrainError::at`].
    pub fn train_step(&mut self, moving: Tensor<B, 5>, fixed: Tensor<B, 5>) -> Result<StepOutput<B::InnerBackend>> {
        self.check_batch_dims(&moving)?;
        self.check_batch_dims(&fixed)?;
        ensure_finite("moving", moving.clone().inner())?;
        ensure_finite("fixed", fixed.clone().inner())?;

        let output = self.network.register(moving, fixed.clone());
        ensure_finite("flow", output.flow.clone().inner())?;
        let terms = self.loss.forward(output.registered.clone(), fixed.clone(), output.flow);

        let loss = scalar(terms.total.clone());
        if !loss.is_finite() {
            return Err(TrainError::non_finite("loss", loss));
        }

        let registered = output.registered.inner();
        let score = scalar(self.scorer.similarity(registered.clone(), fixed.inner()));
        let similarity = scalar(terms.similarity);
        let smoothness = scalar(terms.smoothness);

        let grads = terms.total.backward();
        let grads = GradientsParams::from_grads(grads, &self.network);
        self.network = self.optimizer.step(self.learning_rate, self.network.clone(), grads);
        self.steps += 1;

        Ok(StepOutput {
            loss,
            similarity,
            smoothness,
            score,
            registered,
        })
    }

    /// Forward pass without gradients. Never changes the model. Fails on the
    /// same non-finite values as [`Self::train_step`].
    pub fn eval_step(
        &self,
        moving: Tensor<B::InnerBackend, 5>,
        fixed: Tensor<B::InnerBackend, 5>,
    ) -> Result<StepOutput<B::InnerBackend>> {
        self.check_batch_dims(&moving)?;
        self.check_batch_dims(&fixed)?;
        ensure_finite("moving", moving.clone())?;
        ensure_finite("fixed", fixed.clone())?;

        let network = self.network.valid();
        let output = network.register(moving, fixed.clone());
        ensure_finite("flow", output.flow.clone())?;
        let terms = self.loss.forward(output.registered.clone(), fixed.clone(), output.flow);
        let loss = scalar(terms.total);
        if !loss.is_finite() {
            return Err(TrainError::non_finite("loss", loss));
        }
        let score = self.scorer.similarity(output.registered.clone(), fixed);

        Ok(StepOutput {
            loss,
            similarity: scalar(terms.similarity),
            smoothness: scalar(terms.smoothness),
            score: scalar(score),
            registered: output.registered,
        })
    }
}

impl<B: AutodiffBackend> VoxelMorphModel<B> {
    /// Build the network, optimizer and loss a config describes, loading
    /// `resume_from` when set.
    pub fn from_config(config: &TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;

        let network = config.model.init::<B>(&device);
        let optimizer = SgdConfig::new()
            .with_momentum(Some(MomentumConfig::new().with_momentum(config.momentum)))
            .init();
        let loss = VoxelMorphLoss::new(config.ncc_window, config.lambda);

        let mut model = Self::new(
            network,
            optimizer,
            loss,
            DiceScore::default(),
            config.learning_rate,
            config.dims,
            device,
        );
        if let Some(path) = &config.resume_from {
            model.load_network(path)?;
        }
        Ok(model)
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// A single NaN or infinite element makes the sum non-finite.
fn ensure_finite<B: Backend>(quantity: &'static str, tensor: Tensor<B, 5>) -> Result<()> {
    let total = scalar(tensor.sum());
    if total.is_finite() {
        Ok(())
    } else {
        Err(TrainError::non_finite(quantity, total))
    }
}
