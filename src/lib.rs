//! Online normalization kernels.
//!
//! A streaming alternative to batch normalization: activations are normalized
//! against exponentially-decayed running statistics that are updated sample by
//! sample, instead of batch statistics computed in one pass. The kernels are
//! data-parallel across channels and across the elements of one sample, but
//! strictly sequential across the samples of a channel, since every sample is
//! normalized with the state left behind by the previous one.
//!
//! The crate exposes a narrow two-operation contract through
//! [`norm::OnlineNorm`]: `forward` normalizes a `[N, C, D]` activation tensor
//! and advances the running mean/variance, `backward` turns an upstream
//! gradient into an input gradient while advancing the two control variables
//! of the bias-correction scheme. Everything else (autograd wiring, module
//! composition, dtype dispatch beyond the float element) belongs to the host
//! framework.

pub mod norm;

pub use norm::{NormError, OnlineNorm, OnlineNormConfig};
