//! Online normalization forward kernel.
//!
//! Each cube owns one channel and walks its N samples in order: normalize the
//! D elements of the sample against the current running mean/variance, reduce
//! the sample's raw first and second moments, then fold them into the running
//! state with the decay recurrence. The next sample only starts once the
//! updated state is visible to every lane.

use cubecl::prelude::*;

use super::{reduce::block_tree_sum, OnlineNormKernelConfig};

/// Online normalization forward pass.
///
/// Thread layout: one cube per channel (`CUBE_POS_X`), `config.threads` lanes
/// strided over the D elements of a sample.
///
/// Shapes:
/// - `input`: [N, C, D]
/// - `out`: [N, C, D], normalized activations
/// - `scale`: [N, C], sqrt(running_var + epsilon) as read for each sample
/// - `running_mean`, `running_var`: [C], mutated in place, always f32
///   regardless of the element type `F`
///
/// All accumulation runs in f32; elements are widened on load and narrowed
/// on store.
#[cube(launch)]
pub fn online_norm_fwd_kernel<F: Float>(
    input: &Tensor<F>,
    out: &mut Tensor<F>,
    scale: &mut Tensor<F>,
    running_mean: &mut Tensor<f32>,
    running_var: &mut Tensor<f32>,
    #[comptime] config: OnlineNormKernelConfig,
) {
    let channel_idx = CUBE_POS_X;
    let tid = UNIT_POS;

    let num_samples = input.shape(0);
    let num_channels = input.shape(1);
    let channel_size = input.shape(2);

    let num_threads = comptime!(config.threads as u32);
    let decay = config.decay();
    let epsilon = config.epsilon();

    let mut sum_scratch = SharedMemory::<f32>::new(num_threads);
    let mut sum_sq_scratch = SharedMemory::<f32>::new(num_threads);

    if channel_idx < num_channels {
        let keep = f32::new(1.0) - decay;
        let d_f = f32::cast_from(channel_size);

        for n in 0..num_samples {
            // Pre-update state: sample n is always normalized with the state
            // left behind by sample n - 1.
            let mean = running_mean[channel_idx];
            let s = f32::sqrt(running_var[channel_idx] + epsilon);

            if tid == 0 {
                scale[n * num_channels + channel_idx] = F::cast_from(s);
            }

            let base = (n * num_channels + channel_idx) * channel_size;
            let mut part_sum = f32::new(0.0);
            let mut part_sum_sq = f32::new(0.0);

            for d in range_stepped(tid, channel_size, num_threads) {
                let x = f32::cast_from(input[base + d]);
                out[base + d] = F::cast_from((x - mean) / s);
                part_sum += x;
                part_sum_sq += x * x;
            }

            // Idle lanes contribute 0.0, which also clears last sample's
            // partials from both scratch buffers.
            sum_scratch[tid] = part_sum;
            sum_sq_scratch[tid] = part_sum_sq;
            sync_units();

            block_tree_sum(&mut sum_scratch, tid, num_threads);
            block_tree_sum(&mut sum_sq_scratch, tid, num_threads);
            sync_units();

            if tid == 0 {
                let sample_mean = sum_scratch[0] / d_f;
                // Population variance, no Bessel correction.
                let sample_var = sum_sq_scratch[0] / d_f - sample_mean * sample_mean;

                let diff = sample_mean - running_mean[channel_idx];
                // The decay * keep * diff^2 cross term accounts for the mean
                // moving between decay applications.
                running_var[channel_idx] = decay * running_var[channel_idx]
                    + keep * sample_var
                    + decay * keep * diff * diff;
                running_mean[channel_idx] = running_mean[channel_idx] + keep * diff;
            }

            // State writes for sample n must be visible before sample n + 1
            // reads them.
            sync_units();
        }
    }
}

/// Launch configuration for the online normalization forward kernel.
pub fn launch_online_norm_fwd<R: Runtime, F: Float + CubeElement>(
    client: &ComputeClient<R::Server, R::Channel>,
    input: TensorHandleRef<R>,
    out: TensorHandleRef<R>,
    scale: TensorHandleRef<R>,
    running_mean: TensorHandleRef<R>,
    running_var: TensorHandleRef<R>,
    config: OnlineNormKernelConfig,
) {
    let num_channels = input.shape[1] as u32;
    let cube_dim = CubeDim::new_1d(config.threads as u32);

    unsafe {
        online_norm_fwd_kernel::launch::<F, R>(
            client,
            CubeCount::Static(num_channels, 1, 1),
            cube_dim,
            TensorArg::from_raw_parts::<F>(input.handle, input.strides, input.shape, 1),
            TensorArg::from_raw_parts::<F>(out.handle, out.strides, out.shape, 1),
            TensorArg::from_raw_parts::<F>(scale.handle, scale.strides, scale.shape, 1),
            TensorArg::from_raw_parts::<f32>(
                running_mean.handle,
                running_mean.strides,
                running_mean.shape,
                1,
            ),
            TensorArg::from_raw_parts::<f32>(
                running_var.handle,
                running_var.strides,
                running_var.shape,
                1,
            ),
            config,
        )
        ;
    }
}
