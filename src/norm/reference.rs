//! Scalar reference implementation of online normalization.
//!
//! Mirrors the kernels exactly: per-channel state advanced by pure step
//! functions, with per-sample accumulation partitioned over `lanes` strided
//! partial sums that are merged by the same pairwise tree as the
//! shared-memory reduction. Accumulation is always f32 regardless of the
//! element storage type, so a run with any lane count reproduces the kernel
//! up to floating-point summation order, and bit-for-bit when the element
//! sums are exact.
//!
//! The GPU validation tests compare both kernels against this module.

use burn::tensor::{Element, ElementConversion};

/// Per-channel running state.
///
/// `mean`/`var` drive the forward pass, `v_ctrl`/`u_ctrl` the backward
/// control-variate corrections. All four persist across calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelState {
    pub mean: f32,
    pub var: f32,
    pub v_ctrl: f32,
    pub u_ctrl: f32,
}

impl ChannelState {
    pub fn new() -> Self {
        Self {
            mean: 0.0,
            var: 1.0,
            v_ctrl: 0.0,
            u_ctrl: 0.0,
        }
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh state for `num_channels` channels.
pub fn init_states(num_channels: usize) -> Vec<ChannelState> {
    vec![ChannelState::new(); num_channels]
}

/// Pairwise tree merge of lane partials, depositing the total at index 0.
///
/// Reproduces the reduction order of the shared-memory kernel primitive:
/// halving strides from the next power of two down to 1, with `lo + stride`
/// bounds-checked against the lane count.
pub fn tree_sum(partials: &mut [f32]) -> f32 {
    let lanes = partials.len();
    let mut stride = lanes.next_power_of_two() / 2;

    while stride > 0 {
        for lo in 0..stride {
            if lo + stride < lanes {
                partials[lo] += partials[lo + stride];
            }
        }
        stride /= 2;
    }

    partials[0]
}

/// Strided per-lane partials of `f` over the elements, widened to f32.
fn lane_partials<E: Element>(elements: &[E], lanes: usize, f: impl Fn(f32) -> f32) -> Vec<f32> {
    let mut partials = vec![0.0f32; lanes];
    for (lane, partial) in partials.iter_mut().enumerate() {
        let mut idx = lane;
        while idx < elements.len() {
            *partial += f(elements[idx].elem::<f32>());
            idx += lanes;
        }
    }
    partials
}

/// Forward step for one sample of one channel.
///
/// Normalizes `input` into `out` using the pre-update state, then folds the
/// sample's raw moments into the running mean/variance. Returns the scale
/// (sqrt of the pre-update variance plus epsilon) used for this sample.
pub fn forward_step<E: Element>(
    state: &mut ChannelState,
    input: &[E],
    out: &mut [E],
    decay: f32,
    epsilon: f32,
    lanes: usize,
) -> f32 {
    debug_assert_eq!(input.len(), out.len());
    debug_assert!(!input.is_empty());
    debug_assert!(lanes > 0);

    let mean = state.mean;
    let scale = (state.var + epsilon).sqrt();

    for (x, o) in input.iter().zip(out.iter_mut()) {
        *o = ((x.elem::<f32>() - mean) / scale).elem();
    }

    let sum = tree_sum(&mut lane_partials(input, lanes, |x| x));
    let sum_sq = tree_sum(&mut lane_partials(input, lanes, |x| x * x));

    let d_f = input.len() as f32;
    let sample_mean = sum / d_f;
    // Population variance, no Bessel correction.
    let sample_var = sum_sq / d_f - sample_mean * sample_mean;

    let keep = 1.0 - decay;
    let diff = sample_mean - state.mean;
    state.var = decay * state.var + keep * sample_var + decay * keep * diff * diff;
    state.mean += keep * diff;

    scale
}

/// Backward step for one sample of one channel.
///
/// Applies the v correction against `out`, rescales by `scale`, applies the
/// u correction, and writes the result to `grad_in`. Both control variables
/// are used at their pre-update value and advanced at the end of their pass,
/// exactly as in the kernel. The intermediate gradient is staged through
/// `grad_in` at storage precision, matching the kernel's global-memory
/// round-trip.
pub fn backward_step<E: Element>(
    state: &mut ChannelState,
    grad_out: &[E],
    out: &[E],
    scale: f32,
    grad_in: &mut [E],
    decay: f32,
    lanes: usize,
) {
    debug_assert_eq!(grad_out.len(), out.len());
    debug_assert_eq!(grad_out.len(), grad_in.len());
    debug_assert!(!grad_out.is_empty());

    let d_f = grad_out.len() as f32;
    let keep = 1.0 - decay;

    // v pass: the correlation accumulates the unrounded f32 gradient, while
    // grad_in stages it at storage precision, exactly as the kernel does.
    let v = state.v_ctrl;
    let mut corr_v = vec![0.0f32; lanes];
    for (lane, partial) in corr_v.iter_mut().enumerate() {
        let mut idx = lane;
        while idx < grad_out.len() {
            let o = out[idx].elem::<f32>();
            let g = grad_out[idx].elem::<f32>() - keep * v * o;
            grad_in[idx] = g.elem();
            *partial += g * o;
            idx += lanes;
        }
    }
    state.v_ctrl += tree_sum(&mut corr_v) / d_f;

    // u pass: reads back the staged (rounded) gradient, like the kernel's
    // global-memory round-trip.
    let u = state.u_ctrl;
    let mut corr_u = vec![0.0f32; lanes];
    for (lane, partial) in corr_u.iter_mut().enumerate() {
        let mut idx = lane;
        while idx < grad_out.len() {
            let g = grad_in[idx].elem::<f32>() / scale - keep * u;
            grad_in[idx] = g.elem();
            *partial += g;
            idx += lanes;
        }
    }
    state.u_ctrl += tree_sum(&mut corr_u) / d_f;
}

/// Forward pass over a full `[N, C, D]` batch; returns `(out, scale)` with
/// `scale` laid out `[N, C]`.
pub fn forward<E: Element>(
    states: &mut [ChannelState],
    input: &[E],
    num_samples: usize,
    channel_size: usize,
    decay: f32,
    epsilon: f32,
    lanes: usize,
) -> (Vec<E>, Vec<E>) {
    let num_channels = states.len();
    debug_assert_eq!(input.len(), num_samples * num_channels * channel_size);

    let zero: E = 0.0f32.elem();
    let mut out = vec![zero; input.len()];
    let mut scale = vec![zero; num_samples * num_channels];

    for (c, state) in states.iter_mut().enumerate() {
        for n in 0..num_samples {
            let base = (n * num_channels + c) * channel_size;
            let s = forward_step(
                state,
                &input[base..base + channel_size],
                &mut out[base..base + channel_size],
                decay,
                epsilon,
                lanes,
            );
            scale[n * num_channels + c] = s.elem();
        }
    }

    (out, scale)
}

/// Backward pass over a full `[N, C, D]` batch; `out` and `scale` must come
/// from the paired forward call.
pub fn backward<E: Element>(
    states: &mut [ChannelState],
    grad_out: &[E],
    out: &[E],
    scale: &[E],
    num_samples: usize,
    channel_size: usize,
    decay: f32,
    lanes: usize,
) -> Vec<E> {
    let num_channels = states.len();
    debug_assert_eq!(grad_out.len(), num_samples * num_channels * channel_size);
    debug_assert_eq!(grad_out.len(), out.len());
    debug_assert_eq!(scale.len(), num_samples * num_channels);

    let zero: E = 0.0f32.elem();
    let mut grad_in = vec![zero; grad_out.len()];

    for (c, state) in states.iter_mut().enumerate() {
        for n in 0..num_samples {
            let base = (n * num_channels + c) * channel_size;
            backward_step(
                state,
                &grad_out[base..base + channel_size],
                &out[base..base + channel_size],
                scale[n * num_channels + c].elem::<f32>(),
                &mut grad_in[base..base + channel_size],
                decay,
                lanes,
            );
        }
    }

    grad_in
}

#[cfg(test)]
mod tests {
    use half::f16;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use test_case::test_matrix;

    use super::*;

    const EPSILON: f32 = 1e-5;

    /// Random floats, f16-representable so narrow/wide runs see identical
    /// inputs.
    fn random_input(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len)
            .map(|_| f16::from_f32(rng.random_range(-2.0..2.0)).to_f32())
            .collect()
    }

    /// Random integer-valued floats; sums over these are exact in f32, so
    /// results must be identical for every lane partition.
    fn integer_input(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len)
            .map(|_| rng.random_range(-8i32..=8) as f32)
            .collect()
    }

    fn assert_close(actual: &[f32], expected: &[f32], rtol: f32, atol: f32, ctx: &str) {
        assert_eq!(actual.len(), expected.len(), "{ctx}: length mismatch");
        for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
            let tol = atol + rtol * e.abs();
            assert!(
                (a - e).abs() <= tol,
                "{ctx}[{i}]: {a} vs {e} (tol {tol})"
            );
        }
    }

    #[test]
    fn tree_sum_matches_naive_sum_on_integers() {
        let mut rng = StdRng::seed_from_u64(7);
        let values = integer_input(&mut rng, 100);
        let naive: f32 = values.iter().sum();

        for lanes in [1, 2, 7, 32, 128] {
            let mut partials = lane_partials(&values, lanes, |x| x);
            assert_eq!(tree_sum(&mut partials), naive, "lanes={lanes}");
        }
    }

    #[test]
    fn normalization_uses_pre_update_state() {
        let mut rng = StdRng::seed_from_u64(1);
        let d = 64;
        let input = random_input(&mut rng, 2 * d);

        let mut state = ChannelState::new();
        let mut out = vec![0.0f32; d];

        // Sample 0 sees the initial state.
        let scale0 = forward_step(&mut state, &input[..d], &mut out, 0.9, EPSILON, 32);
        assert_eq!(scale0, (1.0f32 + EPSILON).sqrt());
        for (o, x) in out.iter().zip(&input[..d]) {
            assert_eq!(*o, x / scale0);
        }

        // Sample 1 sees exactly the state sample 0 left behind, not its own
        // statistics.
        let mean1 = state.mean;
        let scale1 = forward_step(&mut state, &input[d..], &mut out, 0.9, EPSILON, 32);
        for (o, x) in out.iter().zip(&input[d..]) {
            assert_eq!(*o, (x - mean1) / scale1);
        }
    }

    #[test]
    fn full_decay_freezes_state() {
        let mut rng = StdRng::seed_from_u64(2);
        let input = random_input(&mut rng, 4 * 64);

        let mut states = init_states(1);
        let (out, _) = forward(&mut states, &input, 4, 64, 1.0, EPSILON, 32);

        assert_eq!(states[0].mean, 0.0);
        assert_eq!(states[0].var, 1.0);

        // Pure pass-through normalization with the initial state.
        let scale = (1.0f32 + EPSILON).sqrt();
        for (o, x) in out.iter().zip(&input) {
            assert_eq!(*o, x / scale);
        }
    }

    #[test]
    fn zero_decay_adopts_sample_statistics() {
        let mut rng = StdRng::seed_from_u64(3);
        let d = 64;
        let input = random_input(&mut rng, d);

        let mut state = ChannelState::new();
        let mut out = vec![0.0f32; d];
        forward_step(&mut state, &input, &mut out, 0.0, EPSILON, 32);

        let sum = tree_sum(&mut lane_partials(&input, 32, |x| x));
        let sum_sq = tree_sum(&mut lane_partials(&input, 32, |x| x * x));
        let sample_mean = sum / d as f32;
        let sample_var = sum_sq / d as f32 - sample_mean * sample_mean;

        assert_eq!(state.mean, sample_mean);
        assert_eq!(state.var, sample_var);
    }

    #[test]
    fn batched_call_equals_sequential_single_sample_calls() {
        let mut rng = StdRng::seed_from_u64(4);
        let (c, d) = (3, 80);
        let input = random_input(&mut rng, 2 * c * d);

        let mut batched = init_states(c);
        let (out_batched, scale_batched) =
            forward(&mut batched, &input, 2, d, 0.999, EPSILON, 64);

        let mut split = init_states(c);
        let (out0, scale0) = forward(&mut split, &input[..c * d], 1, d, 0.999, EPSILON, 64);
        let (out1, scale1) = forward(&mut split, &input[c * d..], 1, d, 0.999, EPSILON, 64);

        assert_eq!(out_batched[..c * d], out0[..]);
        assert_eq!(out_batched[c * d..], out1[..]);
        assert_eq!(scale_batched[..c], scale0[..]);
        assert_eq!(scale_batched[c..], scale1[..]);
        assert_eq!(batched, split);
    }

    #[test_matrix([1, 2, 7, 32, 128])]
    fn lane_partition_does_not_change_results(lanes: usize) {
        let mut rng = StdRng::seed_from_u64(5);
        let (n, c, d) = (3, 2, 100);
        let input = integer_input(&mut rng, n * c * d);

        let mut states = init_states(c);
        let (out, scale) = forward(&mut states, &input, n, d, 0.99, EPSILON, lanes);

        let mut baseline_states = init_states(c);
        let (baseline_out, baseline_scale) =
            forward(&mut baseline_states, &input, n, d, 0.99, EPSILON, 1);

        assert_eq!(out, baseline_out);
        assert_eq!(scale, baseline_scale);
        assert_eq!(states, baseline_states);
    }

    #[test]
    fn forward_tracks_sequential_recurrence() {
        let mut rng = StdRng::seed_from_u64(6);
        let (n, d) = (5, 48);
        let input = random_input(&mut rng, n * d);

        let mut states = init_states(1);
        forward(&mut states, &input, n, d, 0.99, EPSILON, 32);

        // Wide-precision replay of the documented recurrence.
        let (mut mean, mut var) = (0.0f64, 1.0f64);
        for sample in input.chunks(d) {
            let sum: f64 = sample.iter().map(|&x| x as f64).sum();
            let sum_sq: f64 = sample.iter().map(|&x| (x as f64) * (x as f64)).sum();
            let sample_mean = sum / d as f64;
            let sample_var = sum_sq / d as f64 - sample_mean * sample_mean;
            let diff = sample_mean - mean;
            var = 0.99 * var + 0.01 * sample_var + 0.99 * 0.01 * diff * diff;
            mean += 0.01 * diff;
        }

        assert_close(&[states[0].mean], &[mean as f32], 1e-4, 1e-6, "mean");
        assert_close(&[states[0].var], &[var as f32], 1e-4, 1e-6, "var");
    }

    #[test]
    fn single_sample_backward_with_full_decay_is_pure_rescale() {
        let mut rng = StdRng::seed_from_u64(8);
        let d = 64;
        let input = random_input(&mut rng, d);
        let grad_out = random_input(&mut rng, d);

        let mut states = init_states(1);
        let (out, scale) = forward(&mut states, &input, 1, d, 0.999, EPSILON, 32);

        // abwd = 1 with zero controls: both corrections vanish.
        let grad_in = backward(&mut states, &grad_out, &out, &scale, 1, d, 1.0, 32);

        for (g_in, g_out) in grad_in.iter().zip(&grad_out) {
            assert_eq!(*g_in, g_out / scale[0]);
        }
    }

    #[test]
    fn backward_tracks_control_variate_recurrence() {
        let mut rng = StdRng::seed_from_u64(9);
        let (n, d) = (4, 32);
        let abwd = 0.9f32;
        let input = random_input(&mut rng, n * d);
        let grad_out = random_input(&mut rng, n * d);

        let mut states = init_states(1);
        let (out, scale) = forward(&mut states, &input, n, d, 0.99, EPSILON, 32);
        let grad_in = backward(&mut states, &grad_out, &out, &scale, n, d, abwd, 32);

        // Wide-precision replay: v before rescale, u after, both deferred to
        // end of sample.
        let keep = 1.0 - abwd as f64;
        let (mut v, mut u) = (0.0f64, 0.0f64);
        let mut expected = vec![0.0f64; n * d];
        for s in 0..n {
            let base = s * d;
            let mut corr_v = 0.0f64;
            for i in 0..d {
                let g = grad_out[base + i] as f64 - keep * v * out[base + i] as f64;
                expected[base + i] = g;
                corr_v += g * out[base + i] as f64;
            }
            v += corr_v / d as f64;

            let mut corr_u = 0.0f64;
            for i in 0..d {
                let g = expected[base + i] / scale[s] as f64 - keep * u;
                expected[base + i] = g;
                corr_u += g;
            }
            u += corr_u / d as f64;
        }

        let expected: Vec<f32> = expected.iter().map(|&g| g as f32).collect();
        assert_close(&grad_in, &expected, 1e-4, 1e-5, "grad_in");
        assert_close(&[states[0].v_ctrl], &[v as f32], 1e-4, 1e-6, "v_ctrl");
        assert_close(&[states[0].u_ctrl], &[u as f32], 1e-4, 1e-6, "u_ctrl");
    }

    #[test]
    fn narrow_storage_accumulates_in_wide_precision() {
        // 4096 ones overflow an f16 accumulator's 2048 integer ceiling; the
        // f32 accumulation policy keeps the sample statistics exact.
        let d = 4096;
        let input = vec![f16::from_f32(1.0); d];

        let mut state = ChannelState::new();
        let mut out = vec![f16::from_f32(0.0); d];
        forward_step(&mut state, &input, &mut out, 0.0, EPSILON, 128);

        assert_eq!(state.mean, 1.0);
        assert_eq!(state.var, 0.0);
    }

    #[test]
    fn narrow_storage_matches_wide_storage() {
        let mut rng = StdRng::seed_from_u64(10);
        let (n, d) = (3, 64);
        let wide = random_input(&mut rng, n * d);
        let narrow: Vec<f16> = wide.iter().map(|&x| f16::from_f32(x)).collect();

        let mut wide_states = init_states(1);
        let (wide_out, _) = forward(&mut wide_states, &wide, n, d, 0.99, EPSILON, 32);

        let mut narrow_states = init_states(1);
        let (narrow_out, _) = forward(&mut narrow_states, &narrow, n, d, 0.99, EPSILON, 32);

        let narrow_out: Vec<f32> = narrow_out.iter().map(|x| x.to_f32()).collect();
        assert_close(&narrow_out, &wide_out, 2e-3, 2e-3, "out");
        assert_close(
            &[narrow_states[0].mean, narrow_states[0].var],
            &[wide_states[0].mean, wide_states[0].var],
            2e-3,
            2e-3,
            "state",
        );
    }
}
