//! CubeTensor-level entry points for the online normalization kernels.
//!
//! These functions make inputs contiguous, allocate outputs, and hand raw
//! tensor handles to the launch wrappers. Shape preconditions are the
//! responsibility of the calling layer; only debug assertions live here.

use burn::tensor::Shape;
use burn_cubecl::{
    kernel::into_contiguous, ops::numeric::empty_device, tensor::CubeTensor, CubeRuntime,
    FloatElement,
};
use tracing::trace;

use super::{launch_online_norm_bwd, launch_online_norm_fwd, OnlineNormKernelConfig};

/// Create an empty tensor with the same client/device as the template.
pub fn empty_like<R: CubeRuntime, F: FloatElement>(
    template: &CubeTensor<R>,
    shape: impl Into<Shape>,
) -> CubeTensor<R> {
    empty_device::<R, F>(
        template.client.clone(),
        template.device.clone(),
        shape.into(),
    )
}

/// Tensors produced by a forward call; `backward` consumes both read-only.
#[derive(Debug)]
pub struct ForwardOutput<R: CubeRuntime> {
    /// Normalized activations, [N, C, D].
    pub out: CubeTensor<R>,
    /// Per-sample scale as read before each state update, [N, C].
    pub scale: CubeTensor<R>,
}

/// Normalizes `input` against the running state and advances the state in
/// place.
pub fn forward<R: CubeRuntime, F: FloatElement>(
    input: CubeTensor<R>,
    running_mean: &CubeTensor<R>,
    running_var: &CubeTensor<R>,
    config: OnlineNormKernelConfig,
) -> ForwardOutput<R> {
    let input = into_contiguous(input);

    let [num_samples, num_channels, channel_size] = input.shape.dims();
    debug_assert_eq!(running_mean.shape.dims(), [num_channels]);
    debug_assert_eq!(running_var.shape.dims(), [num_channels]);

    trace!(
        "online norm forward: samples={num_samples} channels={num_channels} \
         features={channel_size} threads={}",
        config.threads
    );

    let out = empty_like::<R, F>(&input, input.shape.clone());
    let scale = empty_like::<R, F>(&input, [num_samples, num_channels]);

    launch_online_norm_fwd::<R, F>(
        &input.client,
        input.as_handle_ref(),
        out.as_handle_ref(),
        scale.as_handle_ref(),
        running_mean.as_handle_ref(),
        running_var.as_handle_ref(),
        config,
    );

    ForwardOutput { out, scale }
}

/// Computes the input gradient from the upstream gradient and the paired
/// forward outputs, advancing both control variables in place.
pub fn backward<R: CubeRuntime, F: FloatElement>(
    grad_out: CubeTensor<R>,
    out: CubeTensor<R>,
    scale: CubeTensor<R>,
    v_ctrl: &CubeTensor<R>,
    u_ctrl: &CubeTensor<R>,
    config: OnlineNormKernelConfig,
) -> CubeTensor<R> {
    let grad_out = into_contiguous(grad_out);
    let out = into_contiguous(out);
    let scale = into_contiguous(scale);

    let [num_samples, num_channels, channel_size] = grad_out.shape.dims();
    debug_assert_eq!(out.shape.dims(), [num_samples, num_channels, channel_size]);
    debug_assert_eq!(scale.shape.dims(), [num_samples, num_channels]);
    debug_assert_eq!(v_ctrl.shape.dims(), [num_channels]);
    debug_assert_eq!(u_ctrl.shape.dims(), [num_channels]);

    trace!(
        "online norm backward: samples={num_samples} channels={num_channels} \
         features={channel_size} threads={}",
        config.threads
    );

    let grad_in = empty_like::<R, F>(&grad_out, grad_out.shape.clone());

    launch_online_norm_bwd::<R, F>(
        &grad_out.client,
        grad_out.as_handle_ref(),
        out.as_handle_ref(),
        scale.as_handle_ref(),
        grad_in.as_handle_ref(),
        v_ctrl.as_handle_ref(),
        u_ctrl.as_handle_ref(),
        config,
    );

    grad_in
}
