//! Host-side online normalization layer.
//!
//! The layer owns the per-channel running state for its whole lifetime:
//! running mean and variance for the forward pass, and the two control
//! variables of the backward bias-correction scheme. Forward and backward
//! take `&mut self`, so two calls on one layer can never race on the same
//! channel state.

use std::marker::PhantomData;

use burn::tensor::{DType, Shape};
use burn_cubecl::{tensor::CubeTensor, CubeRuntime, FloatElement};
use cubecl::prelude::*;

use super::{
    error::{check_activation, check_shape, NormError},
    kernels::{launch, OnlineNormKernelConfig},
    ForwardOutput, OnlineNormConfig,
};

/// Online normalization over `[N, C, D]` activations with `C` channels.
///
/// State is zero-initialized (unit variance) at construction and advances
/// with every forward/backward call; it is never reset in between. The
/// element type `F` governs activation storage only; the state and all
/// accumulation stay f32.
#[derive(Debug)]
pub struct OnlineNorm<R: CubeRuntime, F: FloatElement> {
    config: OnlineNormConfig,
    num_channels: usize,
    /// [C] streaming channel mean.
    running_mean: CubeTensor<R>,
    /// [C] streaming channel variance.
    running_var: CubeTensor<R>,
    /// [C] output-correlated backward control variable.
    v_ctrl: CubeTensor<R>,
    /// [C] gradient-mean backward control variable.
    u_ctrl: CubeTensor<R>,
    _element: PhantomData<F>,
}

impl<R: CubeRuntime, F: FloatElement> OnlineNorm<R, F> {
    pub fn new(
        config: OnlineNormConfig,
        num_channels: usize,
        client: &ComputeClient<R::Server, R::Channel>,
        device: &R::Device,
    ) -> Self {
        Self {
            running_mean: state_tensor(client, device, num_channels, 0.0),
            running_var: state_tensor(client, device, num_channels, 1.0),
            v_ctrl: state_tensor(client, device, num_channels, 0.0),
            u_ctrl: state_tensor(client, device, num_channels, 0.0),
            config,
            num_channels,
            _element: PhantomData,
        }
    }

    /// Normalizes `input` ([N, C, D]) against the running state, advancing
    /// the state sample by sample.
    ///
    /// Returns the normalized activations and the per-sample scale; backward
    /// must receive exactly these tensors for the same batch.
    pub fn forward(&mut self, input: CubeTensor<R>) -> Result<ForwardOutput<R>, NormError> {
        check_activation("forward", &input.shape.dims, self.num_channels)?;

        Ok(launch::forward::<R, F>(
            input,
            &self.running_mean,
            &self.running_var,
            self.forward_config(),
        ))
    }

    /// Computes the input gradient for `grad_out` ([N, C, D]), advancing the
    /// control variables sample by sample.
    ///
    /// `out` and `scale` must be the outputs of the paired forward call.
    pub fn backward(
        &mut self,
        grad_out: CubeTensor<R>,
        out: CubeTensor<R>,
        scale: CubeTensor<R>,
    ) -> Result<CubeTensor<R>, NormError> {
        let (num_samples, num_channels, _) =
            check_activation("backward", &grad_out.shape.dims, self.num_channels)?;
        check_shape("backward", "out", &out.shape.dims, &grad_out.shape.dims)?;
        check_shape(
            "backward",
            "scale",
            &scale.shape.dims,
            &[num_samples, num_channels],
        )?;

        Ok(launch::backward::<R, F>(
            grad_out,
            out,
            scale,
            &self.v_ctrl,
            &self.u_ctrl,
            self.backward_config(),
        ))
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn config(&self) -> &OnlineNormConfig {
        &self.config
    }

    pub fn running_mean(&self) -> &CubeTensor<R> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &CubeTensor<R> {
        &self.running_var
    }

    pub fn v_ctrl(&self) -> &CubeTensor<R> {
        &self.v_ctrl
    }

    pub fn u_ctrl(&self) -> &CubeTensor<R> {
        &self.u_ctrl
    }

    fn forward_config(&self) -> OnlineNormKernelConfig {
        OnlineNormKernelConfig::new(
            self.config.threads,
            self.config.epsilon,
            self.config.forward_decay,
        )
    }

    fn backward_config(&self) -> OnlineNormKernelConfig {
        OnlineNormKernelConfig::new(
            self.config.threads,
            self.config.epsilon,
            self.config.backward_decay,
        )
    }
}

/// [C] f32 state tensor filled with `value`.
fn state_tensor<R: CubeRuntime>(
    client: &ComputeClient<R::Server, R::Channel>,
    device: &R::Device,
    num_channels: usize,
    value: f32,
) -> CubeTensor<R> {
    let data = vec![value; num_channels];
    let handle = client.create(f32::as_bytes(&data));

    CubeTensor::new(
        client.clone(),
        handle,
        Shape::from([num_channels]),
        device.clone(),
        vec![1],
        DType::F32,
    )
}
