//! Online normalization backward kernel.
//!
//! Mirrors the forward walk: one cube per channel, samples in order. Each
//! sample applies two chained control-variate corrections. The v correction
//! removes output-correlated bias from the upstream gradient before it is
//! rescaled by the forward scale; the u correction then removes the residual
//! mean bias of the rescaled gradient. Each correction needs its own
//! reduction, and the second depends on the first, so the two reductions
//! cannot be fused.

use cubecl::prelude::*;

use super::{reduce::block_tree_sum, OnlineNormKernelConfig};

/// Online normalization backward pass.
///
/// Thread layout: one cube per channel (`CUBE_POS_X`), `config.threads` lanes
/// strided over the D elements of a sample.
///
/// Shapes:
/// - `grad_out`: [N, C, D], upstream gradient
/// - `out`, `scale`: the exact outputs of the paired forward call
/// - `grad_in`: [N, C, D], computed input gradient; also stages the
///   intermediate gradient between the v and u passes (each lane rereads
///   only the elements it wrote)
/// - `v_ctrl`, `u_ctrl`: [C], mutated in place, always f32
///
/// Both control variables are applied at their value from the end of the
/// previous sample; the update for sample n lands after the corresponding
/// reduction and becomes visible at the end-of-sample barrier.
#[cube(launch)]
pub fn online_norm_bwd_kernel<F: Float>(
    grad_out: &Tensor<F>,
    out: &Tensor<F>,
    scale: &Tensor<F>,
    grad_in: &mut Tensor<F>,
    v_ctrl: &mut Tensor<f32>,
    u_ctrl: &mut Tensor<f32>,
    #[comptime] config: OnlineNormKernelConfig,
) {
    let channel_idx = CUBE_POS_X;
    let tid = UNIT_POS;

    let num_samples = grad_out.shape(0);
    let num_channels = grad_out.shape(1);
    let channel_size = grad_out.shape(2);

    let num_threads = comptime!(config.threads as u32);
    let decay = config.decay();

    let mut v_scratch = SharedMemory::<f32>::new(num_threads);
    let mut u_scratch = SharedMemory::<f32>::new(num_threads);

    if channel_idx < num_channels {
        let keep = f32::new(1.0) - decay;
        let d_f = f32::cast_from(channel_size);

        for n in 0..num_samples {
            let base = (n * num_channels + channel_idx) * channel_size;

            // v as of the end of the previous sample.
            let v = v_ctrl[channel_idx];
            let mut part_v = f32::new(0.0);

            for d in range_stepped(tid, channel_size, num_threads) {
                let o = f32::cast_from(out[base + d]);
                let g = f32::cast_from(grad_out[base + d]) - keep * v * o;
                grad_in[base + d] = F::cast_from(g);
                part_v += g * o;
            }

            v_scratch[tid] = part_v;
            sync_units();

            block_tree_sum(&mut v_scratch, tid, num_threads);
            sync_units();

            if tid == 0 {
                v_ctrl[channel_idx] = v_ctrl[channel_idx] + v_scratch[0] / d_f;
            }

            // u as of the end of the previous sample; the update above only
            // has to land before the next sample's v pass.
            let u = u_ctrl[channel_idx];
            let s = f32::cast_from(scale[n * num_channels + channel_idx]);
            let mut part_u = f32::new(0.0);

            for d in range_stepped(tid, channel_size, num_threads) {
                let g = f32::cast_from(grad_in[base + d]) / s - keep * u;
                grad_in[base + d] = F::cast_from(g);
                part_u += g;
            }

            u_scratch[tid] = part_u;
            sync_units();

            block_tree_sum(&mut u_scratch, tid, num_threads);
            sync_units();

            if tid == 0 {
                u_ctrl[channel_idx] = u_ctrl[channel_idx] + u_scratch[0] / d_f;
            }

            // Both control variables must be visible before the next sample.
            sync_units();
        }
    }
}

/// Launch configuration for the online normalization backward kernel.
pub fn launch_online_norm_bwd<R: Runtime, F: Float + CubeElement>(
    client: &ComputeClient<R::Server, R::Channel>,
    grad_out: TensorHandleRef<R>,
    out: TensorHandleRef<R>,
    scale: TensorHandleRef<R>,
    grad_in: TensorHandleRef<R>,
    v_ctrl: TensorHandleRef<R>,
    u_ctrl: TensorHandleRef<R>,
    config: OnlineNormKernelConfig,
) {
    let num_channels = grad_out.shape[1] as u32;
    let cube_dim = CubeDim::new_1d(config.threads as u32);

    unsafe {
        online_norm_bwd_kernel::launch::<F, R>(
            client,
            CubeCount::Static(num_channels, 1, 1),
            cube_dim,
            TensorArg::from_raw_parts::<F>(grad_out.handle, grad_out.strides, grad_out.shape, 1),
            TensorArg::from_raw_parts::<F>(out.handle, out.strides, out.shape, 1),
            TensorArg::from_raw_parts::<F>(scale.handle, scale.strides, scale.shape, 1),
            TensorArg::from_raw_parts::<F>(grad_in.handle, grad_in.strides, grad_in.shape, 1),
            TensorArg::from_raw_parts::<f32>(v_ctrl.handle, v_ctrl.strides, v_ctrl.shape, 1),
            TensorArg::from_raw_parts::<f32>(u_ctrl.handle, u_ctrl.strides, u_ctrl.shape, 1),
            config,
        )
        ;
    }
}
