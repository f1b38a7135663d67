//! Error types for topology validation and sharding.

use thiserror::Error;

/// Errors that can occur while partitioning weights across ranks.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A tensor-parallel group must contain at least one rank.
    #[error("tensor parallel size must be > 0")]
    EmptyGroup,

    /// The requested split axis does not exist on the tensor.
    #[error("axis {axis} out of range for tensor of shape {shape:?}")]
    AxisOutOfRange { axis: usize, shape: Vec<usize> },

    /// Split dimension cannot be divided evenly across the group.
    #[error("dimension {axis} of shape {shape:?} is not divisible by tp_size {tp_size}")]
    NotDivisible {
        axis: usize,
        shape: Vec<usize>,
        tp_size: usize,
    },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
