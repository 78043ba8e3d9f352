//! Block-wide tree reduction over a shared-memory scratch buffer.
//!
//! Shared by the forward and backward kernels, which both reduce two
//! accumulated quantities per sample on two independent scratch buffers.

use cubecl::prelude::*;

/// Sums `lanes` partial values resident in `buf`, depositing the total at
/// `buf[0]`.
///
/// Binary-tree halving from the next power of two >= `lanes` down to the
/// plane width (32), with a full barrier after each halving since the
/// reducing lanes may span several planes. Below the plane width the
/// remaining lanes belong to a single plane and execute in lockstep, so the
/// halving continues without barriers.
///
/// Starting the stride at `next_power_of_two(lanes) / 2` skips every stride
/// that is at least `lanes`; the `tid + stride < lanes` bound handles the
/// non-power-of-two remainder.
///
/// Callers must barrier between writing their partials and invoking this,
/// and again before any lane reads `buf[0]`.
#[cube]
pub fn block_tree_sum(buf: &mut SharedMemory<f32>, tid: u32, #[comptime] lanes: u32) {
    let mut stride = comptime!(lanes.next_power_of_two()) / 2;

    while stride > 32 {
        if tid < stride && tid + stride < lanes {
            buf[tid] += buf[tid + stride];
        }
        sync_units();
        stride /= 2;
    }

    // Lanes 16..32 accumulate stale pairs once the stride drops below their
    // id, but those slots are never read at a smaller stride, and within one
    // lockstep step every read precedes every write.
    if tid < 32 {
        while stride > 0 {
            if tid + stride < lanes {
                buf[tid] += buf[tid + stride];
            }
            stride /= 2;
        }
    }
}
