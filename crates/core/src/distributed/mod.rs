//! Tensor-parallel topology and weight partitioning.
//!
//! - [`ProcessGroup`] - rank/world size as supplied by the hosting runtime
//! - [`shard`] - the single slicing primitive every loader routes splits through
//! - [`PartitionRule`] - per-module choice of which LoRA matrix is split, and along which axis
//!
//! # Usage
//!
//! ```ignore
//! use lora_manager_core::distributed::{shard, TensorParallelTopology};
//!
//! let topo = TensorParallelTopology::new(1, 2)?;
//! let half = shard(&weight, 0, topo.tp_rank(), topo.tp_size())?;
//! ```

mod error;
mod partition;
mod process_group;

pub use error::{DistributedError, Result};
pub use partition::{shard, ParallelStyle, PartitionRule};
pub use process_group::{LocalProcessGroup, ProcessGroup, TensorParallelTopology};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_process_group_defaults() {
        let pg = LocalProcessGroup::new();
        assert_eq!(pg.rank(), 0);
        assert_eq!(pg.world_size(), 1);
        assert!(pg.topology().unwrap().is_single());
    }

    #[test]
    fn topology_from_process_group() {
        let topo = TensorParallelTopology::new(3, 4).unwrap();
        let from_pg = TensorParallelTopology::from_process_group(&topo).unwrap();
        assert_eq!(from_pg, topo);
    }
}
