use burn::config::Config;

pub mod error;
pub mod kernels;
pub mod layer;
pub mod reference;

pub use error::NormError;
pub use kernels::launch::ForwardOutput;
pub use kernels::OnlineNormKernelConfig;
pub use layer::OnlineNorm;

/// Configuration for an online normalization layer.
#[derive(Config, Debug)]
pub struct OnlineNormConfig {
    /// Decay factor for the forward running mean/variance.
    #[config(default = 0.999)]
    pub forward_decay: f32,
    /// Decay factor for the backward control variables.
    #[config(default = 0.99)]
    pub backward_decay: f32,
    /// Small constant added to the running variance before the square root.
    #[config(default = 1e-5)]
    pub epsilon: f32,
    /// Number of lanes in each channel's worker-group.
    #[config(default = 128)]
    pub threads: usize,
}
