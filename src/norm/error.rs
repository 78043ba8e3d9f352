//! Precondition checking for the host layer.
//!
//! The kernels themselves have no error paths: every shape or rank violation
//! is rejected here, before anything is launched.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormError {
    #[error("{operation}: expected a rank-3 [samples, channels, features] tensor, got {shape:?}")]
    BadRank {
        operation: &'static str,
        shape: Vec<usize>,
    },

    #[error("{operation}: {name} has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        operation: &'static str,
        name: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("{operation}: input has {got} channels but the layer was built for {expected}")]
    ChannelMismatch {
        operation: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("{operation}: {name} must be non-zero")]
    EmptyDimension {
        operation: &'static str,
        name: &'static str,
    },
}

/// Validates a [N, C, D] activation tensor against the layer width and
/// returns its dimensions.
pub(crate) fn check_activation(
    operation: &'static str,
    shape: &[usize],
    num_channels: usize,
) -> Result<(usize, usize, usize), NormError> {
    let [num_samples, channels, channel_size] = *shape else {
        return Err(NormError::BadRank {
            operation,
            shape: shape.to_vec(),
        });
    };

    if channels != num_channels {
        return Err(NormError::ChannelMismatch {
            operation,
            got: channels,
            expected: num_channels,
        });
    }
    if num_samples == 0 {
        return Err(NormError::EmptyDimension {
            operation,
            name: "samples",
        });
    }
    // D = 0 would divide by zero in the sample mean.
    if channel_size == 0 {
        return Err(NormError::EmptyDimension {
            operation,
            name: "features",
        });
    }

    Ok((num_samples, channels, channel_size))
}

/// Validates that a companion tensor matches an expected shape exactly.
pub(crate) fn check_shape(
    operation: &'static str,
    name: &'static str,
    got: &[usize],
    expected: &[usize],
) -> Result<(), NormError> {
    if got != expected {
        return Err(NormError::ShapeMismatch {
            operation,
            name,
            got: got.to_vec(),
            expected: expected.to_vec(),
        });
    }
    Ok(())
}
