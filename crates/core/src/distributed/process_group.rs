//! Process group abstractions for tensor-parallel loading.
//!
//! The hosting runtime owns the real process group; adapter loading only
//! needs this process's position in it, which must match the topology the
//! execution graph was compiled for.

use super::error::{DistributedError, Result};

/// Trait for process group membership.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process in the tensor-parallel group (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the tensor-parallel group.
    fn world_size(&self) -> usize;

    /// Validated topology snapshot for weight partitioning.
    fn topology(&self) -> Result<TensorParallelTopology> {
        TensorParallelTopology::new(self.rank(), self.world_size())
    }
}

/// Single-process group (world_size = 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProcessGroup;

impl LocalProcessGroup {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }
}

/// This process's position in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorParallelTopology {
    tp_rank: usize,
    tp_size: usize,
}

impl TensorParallelTopology {
    /// Create a topology, checking `tp_size > 0` and `tp_rank < tp_size`.
    pub fn new(tp_rank: usize, tp_size: usize) -> Result<Self> {
        if tp_size == 0 {
            return Err(DistributedError::EmptyGroup);
        }
        if tp_rank >= tp_size {
            return Err(DistributedError::InvalidRank {
                rank: tp_rank,
                world_size: tp_size,
            });
        }
        Ok(Self { tp_rank, tp_size })
    }

    /// No tensor parallelism.
    pub fn single() -> Self {
        Self {
            tp_rank: 0,
            tp_size: 1,
        }
    }

    /// Validate the topology reported by a process group.
    pub fn from_process_group(pg: &dyn ProcessGroup) -> Result<Self> {
        pg.topology()
    }

    pub fn tp_rank(&self) -> usize {
        self.tp_rank
    }

    pub fn tp_size(&self) -> usize {
        self.tp_size
    }

    pub fn is_single(&self) -> bool {
        self.tp_size == 1
    }
}

impl Default for TensorParallelTopology {
    fn default() -> Self {
        Self::single()
    }
}

impl ProcessGroup for TensorParallelTopology {
    fn rank(&self) -> usize {
        self.tp_rank
    }

    fn world_size(&self) -> usize {
        self.tp_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_validates_rank() {
        assert!(TensorParallelTopology::new(0, 1).is_ok());
        assert!(TensorParallelTopology::new(3, 4).is_ok());
        match TensorParallelTopology::new(4, 4) {
            Err(DistributedError::InvalidRank { rank, world_size }) => {
                assert_eq!(rank, 4);
                assert_eq!(world_size, 4);
            }
            other => panic!("expected InvalidRank, got {other:?}"),
        }
    }

    #[test]
    fn topology_rejects_empty_group() {
        assert!(matches!(
            TensorParallelTopology::new(0, 0),
            Err(DistributedError::EmptyGroup)
        ));
    }

    #[test]
    fn single_is_default() {
        let topo = TensorParallelTopology::default();
        assert_eq!(topo.tp_rank(), 0);
        assert_eq!(topo.tp_size(), 1);
        assert!(topo.is_single());
    }
}
