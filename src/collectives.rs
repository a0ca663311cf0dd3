//! The collective backend boundary: barriers, reductions, and the
//! reduce-scatter / all-gather pair that drive a sharded optimizer step.
//!
//! These are modeled as traits rather than a concrete NCCL/Gloo binding --
//! the same split psyche-modeling uses between `Communicator` (the backend
//! handle) and the tensor-level ops it exposes -- so the orchestrator and
//! partitioner can be exercised against an in-process fake in tests.

use tch::Tensor;

use crate::error::CollectiveError;
use crate::interfaces::GradBuffer;
use crate::partition::GbufShard;
use crate::shard::Shard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceType {
    Sum,
    Mean,
    Max,
}

/// A handle to a process subgroup capable of barriers and collectives.
///
/// Implementations wrap a real backend (NCCL, etc); construction of that
/// backend handle is out of scope here, same as in psyche-modeling where
/// `Communicator::NCCL(..)` wraps an opaque `CNCCL` the rest of the crate
/// never inspects.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Reduce `tensor` in place across every rank in the group.
    fn all_reduce(&self, tensor: &mut Tensor, op: ReduceType) -> Result<(), CollectiveError>;

    /// Sum `views[r]` across ranks into `views[self.rank()]`, leaving every
    /// other range on this rank's buffer undefined.
    fn reduce_scatter(&self, views: &mut [Tensor]) -> Result<(), CollectiveError>;

    /// Broadcast `views[self.rank()]` (assumed authoritative on this rank)
    /// so every rank ends up with every view filled in.
    fn all_gather(&self, views: &mut [Tensor]) -> Result<(), CollectiveError>;

    /// The host-side synchronization point required before reading a
    /// device scalar (e.g. the non-finite flag) back on the CPU.
    fn synchronize(&self);
}

/// A barrier-capable subgroup used for tied-weight synchronization
/// (embedding / position-embedding groups). Kept distinct from
/// [`Communicator`] because membership is conditional on pipeline
/// topology, not data-parallel rank.
pub trait Subgroup: Send + Sync {
    fn contains_local_rank(&self) -> bool;
    fn all_reduce(&self, tensor: &mut Tensor, op: ReduceType) -> Result<(), CollectiveError>;
}

/// Builds the `W` disjoint shards of `[0, n)`, ceiling-dividing so every
/// shard but the last is exactly `ceil(n / world_size)` wide.
///
/// Mirrors `Float16DistributedOptimizer.get_model_gbuf_shard`'s shard
/// construction: the tail shard may be shorter, or empty if `n` divides
/// evenly and `world_size` overshoots it -- both are legal.
pub fn world_shards(n: usize, world_size: usize) -> Vec<Shard> {
    assert!(world_size > 0);
    let chunk = n.div_ceil(world_size);
    (0..world_size)
        .map(|r| {
            let start = (r * chunk).min(n);
            let end = ((r + 1) * chunk).min(n);
            Shard::new(start, end)
        })
        .collect()
}

/// Divide a flat buffer in place by `world_size`, converting a
/// reduce-scatter's implicit sum into a mean. Must run before the
/// reduce-scatter call itself -- doing it after would average garbage
/// shard ranges instead of the full buffer.
pub fn scale_for_mean(buffer: &mut Tensor, world_size: usize) {
    let _ = buffer.f_div_scalar_(world_size as f64).unwrap();
}

/// 4.H reduce-scatter: divide the buffer by world size to turn the
/// collective's implicit sum into a mean, then sum each rank's shard range
/// into that rank's view. Must run after the tied-weight all-reduce and
/// before grad copy-in; after it returns, only `shard.world` holds valid
/// data on this rank.
pub fn reduce_scatter_grad_buffer(
    buffer: &mut GradBuffer,
    shard: &GbufShard,
    comm: &dyn Communicator,
) -> Result<(), CollectiveError> {
    scale_for_mean(&mut buffer.tensor, comm.world_size());
    let mut views: Vec<Tensor> = shard
        .world_all
        .iter()
        .map(|s| buffer.tensor.slice(0, s.start as i64, s.end as i64, 1))
        .collect();
    comm.reduce_scatter(&mut views)
}

/// 4.H' all-gather: after 4.E has staged updated parameters into this
/// rank's shard of the buffer, broadcast every rank's shard to fill in the
/// rest. Must run after param copy-out and before the per-parameter resync
/// to canonical parameter tensors.
pub fn all_gather_param_buffer(
    buffer: &mut GradBuffer,
    shard: &GbufShard,
    comm: &dyn Communicator,
) -> Result<(), CollectiveError> {
    let mut views: Vec<Tensor> = shard
        .world_all
        .iter()
        .map(|s| buffer.tensor.slice(0, s.start as i64, s.end as i64, 1))
        .collect();
    comm.all_gather(&mut views)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_split() {
        let shards = world_shards(64, 4);
        assert_eq!(
            shards,
            vec![
                Shard::new(0, 16),
                Shard::new(16, 32),
                Shard::new(32, 48),
                Shard::new(48, 64),
            ]
        );
    }

    #[test]
    fn unequal_tail() {
        let shards = world_shards(70, 4);
        assert_eq!(shards[0].size(), 18);
        assert_eq!(shards[1].size(), 18);
        assert_eq!(shards[2].size(), 18);
        assert_eq!(shards[3].size(), 16);
    }

    #[test]
    fn partition_covers_whole_buffer_without_overlap() {
        let n = 70;
        let shards = world_shards(n, 4);
        let mut cursor = 0;
        for s in &shards {
            assert_eq!(s.start, cursor);
            cursor = s.end;
        }
        assert_eq!(cursor, n);
    }

    #[test]
    fn empty_tail_shard_is_admissible() {
        // n divides evenly by a smaller world size than requested.
        let shards = world_shards(8, 16);
        assert!(shards[8..].iter().all(|s| s.is_empty()));
    }

    struct LocalCommunicator;

    // Single-rank fake: reduce-scatter and all-gather are both identity,
    // since there's only one view to begin with.
    impl Communicator for LocalCommunicator {
        fn rank(&self) -> usize {
            0
        }
        fn world_size(&self) -> usize {
            1
        }
        fn all_reduce(&self, _tensor: &mut Tensor, _op: ReduceType) -> Result<(), CollectiveError> {
            Ok(())
        }
        fn reduce_scatter(&self, _views: &mut [Tensor]) -> Result<(), CollectiveError> {
            Ok(())
        }
        fn all_gather(&self, _views: &mut [Tensor]) -> Result<(), CollectiveError> {
            Ok(())
        }
        fn synchronize(&self) {}
    }

    #[test]
    fn reduce_scatter_divides_by_world_size_before_scattering() {
        use crate::dtype::GradDtype;
        use crate::interfaces::ParamId;
        use crate::partition::gbuf_shard;

        let mut buffer = GradBuffer {
            dtype: GradDtype::F32,
            tensor: Tensor::from_slice(&[2.0f32, 4.0]),
            param_index_map: vec![(ParamId("p".into()), Shard::new(0, 2))],
        };
        let shard = gbuf_shard(&buffer, 1, 0).unwrap();
        let comm = LocalCommunicator;
        reduce_scatter_grad_buffer(&mut buffer, &shard, &comm).unwrap();
        let v: Vec<f32> = Vec::<f32>::try_from(&buffer.tensor).unwrap();
        assert_eq!(v, vec![2.0, 4.0]); // world_size=1, division is a no-op
    }
}
