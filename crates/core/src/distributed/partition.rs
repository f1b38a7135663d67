//! Weight partitioning for tensor parallelism.
//!
//! A LoRA update `delta = out @ in` for a column-parallel projection (QKV,
//! gate/up) keeps `in` whole on every rank and slices the output rows of
//! `out`. For a row-parallel projection (dense, down) it slices the input
//! columns of `in` and keeps `out` whole. The two matrices of one module
//! are never split along the same axis, so each rank's partial product
//! lines up with the base layer's own shard.

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::process_group::TensorParallelTopology;

/// Slice `tensor` along `axis` and return the shard owned by `rank`.
///
/// The dimension must divide evenly by `size`; the returned slice covers
/// `[rank * dim / size, (rank + 1) * dim / size)` and is contiguous.
pub fn shard(tensor: &Tensor, axis: usize, rank: usize, size: usize) -> Result<Tensor> {
    if size == 0 {
        return Err(DistributedError::EmptyGroup);
    }
    if rank >= size {
        return Err(DistributedError::InvalidRank {
            rank,
            world_size: size,
        });
    }
    let dims = tensor.dims();
    if axis >= dims.len() {
        return Err(DistributedError::AxisOutOfRange {
            axis,
            shape: dims.to_vec(),
        });
    }
    if dims[axis] % size != 0 {
        return Err(DistributedError::NotDivisible {
            axis,
            shape: dims.to_vec(),
            tp_size: size,
        });
    }

    let chunk = dims[axis] / size;
    Ok(tensor.narrow(axis, rank * chunk, chunk)?.contiguous()?)
}

/// How the base projection is split across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelStyle {
    /// Output features split (QKV, gate/up).
    Column,
    /// Input features split (dense, down).
    Row,
}

/// Which axis of the LoRA `in` (`[r, d_in]`) and `out` (`[d_out, r]`)
/// matrices is sliced, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRule {
    pub input_axis: Option<usize>,
    pub output_axis: Option<usize>,
}

impl PartitionRule {
    /// `in` replicated, `out` split by row.
    pub const COLUMN_PARALLEL: Self = Self {
        input_axis: None,
        output_axis: Some(0),
    };

    /// `in` split by column, `out` replicated.
    pub const ROW_PARALLEL: Self = Self {
        input_axis: Some(1),
        output_axis: None,
    };

    pub fn for_style(style: ParallelStyle) -> Self {
        match style {
            ParallelStyle::Column => Self::COLUMN_PARALLEL,
            ParallelStyle::Row => Self::ROW_PARALLEL,
        }
    }

    /// Apply the rule to a pair for the given topology.
    ///
    /// With a single rank both tensors are returned as-is.
    pub fn apply(
        &self,
        input: &Tensor,
        output: &Tensor,
        topology: &TensorParallelTopology,
    ) -> Result<(Tensor, Tensor)> {
        if topology.is_single() {
            return Ok((input.clone(), output.clone()));
        }
        let (rank, size) = (topology.tp_rank(), topology.tp_size());
        let input = match self.input_axis {
            Some(axis) => shard(input, axis, rank, size)?,
            None => input.clone(),
        };
        let output = match self.output_axis {
            Some(axis) => shard(output, axis, rank, size)?,
            None => output.clone(),
        };
        Ok((input, output))
    }
}
