//! Partitions a model's per-dtype grad buffers into per-rank world shards,
//! and derives each parameter's placement within its owning rank's shard.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;

use crate::collectives::world_shards;
use crate::dtype::GradDtype;
use crate::error::InvariantError;
use crate::interfaces::{GradBuffer, ModelReplica, ParamId};
use crate::shard::Shard;

/// The three equal-size ranges a parameter owns on one rank, expressed in
/// different coordinate systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamShardDescriptor {
    /// Range within the grad buffer, in the buffer's own (world) coordinates.
    pub gbuf_world: Shard,
    /// `gbuf_world` re-based so it starts at 0 within the local shard.
    pub gbuf_local: Shard,
    /// Range within the *parameter itself* that this rank owns.
    pub param: Shard,
}

impl ParamShardDescriptor {
    fn size_consistent(&self) -> bool {
        self.gbuf_world.size() == self.gbuf_local.size() && self.gbuf_local.size() == self.param.size()
    }
}

/// A single (model, dtype) grad buffer's partitioning across the data
/// parallel world, plus the per-parameter placement within it.
pub struct GbufShard {
    pub local: Shard,
    pub world: Shard,
    pub world_all: Vec<Shard>,
    /// Ordered the same as `grad_buffer.param_index_map`: this order is
    /// what later defines master-group layout, so it must stay stable and
    /// identical across every rank.
    pub param_map: IndexMap<ParamId, ParamShardDescriptor>,
}

/// Build the per-parameter shard map for one grad buffer's world shard.
///
/// Iteration over `grad_buffer.param_index_map` must be, and is, stable:
/// it's the order that later defines master-group layout, and every rank
/// must agree on it without communicating.
pub fn param_shard_map(grad_buffer: &GradBuffer, gbuf_world: &Shard) -> IndexMap<ParamId, ParamShardDescriptor> {
    let mut map = IndexMap::new();
    for (param, world_range) in &grad_buffer.param_index_map {
        // Clamp the parameter's world range into the shard's zero-based
        // local coordinates.
        let local_start = world_range.start.max(gbuf_world.start) - gbuf_world.start;
        let local_end = world_range.end.min(gbuf_world.end).saturating_sub(gbuf_world.start);

        if local_end <= local_start {
            continue;
        }

        let gbuf_local = Shard::new(local_start, local_end);
        let gbuf_world_shard = gbuf_local.normalize(local_start + gbuf_world.start);
        let sub_param_start = gbuf_world.start.saturating_sub(world_range.start);
        let param_shard = gbuf_local.normalize(sub_param_start);

        let descriptor = ParamShardDescriptor {
            gbuf_world: gbuf_world_shard,
            gbuf_local,
            param: param_shard,
        };
        debug_assert!(descriptor.size_consistent());
        map.insert(param.clone(), descriptor);
    }
    map
}

/// Partition one grad buffer across the data-parallel world and compute
/// this rank's param shard map.
pub fn gbuf_shard(grad_buffer: &GradBuffer, world_size: usize, rank: usize) -> Result<GbufShard, InvariantError> {
    let n = grad_buffer.len();
    let world_all = world_shards(n, world_size);

    let total: usize = world_all.iter().map(Shard::size).sum();
    if total != n {
        return Err(InvariantError::PartitionMismatch {
            buffer_label: format!("{:?}", grad_buffer.dtype),
            n,
        });
    }

    let world = world_all[rank];
    let local = world.normalize(0);
    let param_map = param_shard_map(grad_buffer, &world);

    Ok(GbufShard {
        local,
        world,
        world_all,
        param_map,
    })
}

/// Partition every (dtype) grad buffer of one model replica.
pub fn model_gbuf_shard_map(
    model: &dyn ModelReplica,
    world_size: usize,
    rank: usize,
) -> Result<BTreeMap<GradDtype, GbufShard>, InvariantError> {
    model
        .grad_buffers()
        .iter()
        .map(|(dtype, buf)| gbuf_shard(buf, world_size, rank).map(|shard| (*dtype, shard)))
        .collect()
}

/// Inverse index from parameter to the `(model_index, dtype)` pair whose
/// grad buffer it lives in, used by copy-in/copy-out to find the right
/// buffer for a given master-side parameter.
pub fn param_gbuf_map(
    model_gbuf_shards: &[BTreeMap<GradDtype, GbufShard>],
) -> HashMap<ParamId, (usize, GradDtype)> {
    let mut map = HashMap::new();
    for (model_index, shard_map) in model_gbuf_shards.iter().enumerate() {
        for (dtype, gbuf_shard) in shard_map {
            for param in gbuf_shard.param_map.keys() {
                map.insert(param.clone(), (model_index, *dtype));
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Kind, Tensor};

    fn buffer(n: i64, params: &[(&str, i64, i64)]) -> GradBuffer {
        GradBuffer {
            dtype: GradDtype::F32,
            tensor: Tensor::zeros([n], (Kind::Float, tch::Device::Cpu)),
            param_index_map: params
                .iter()
                .map(|(name, s, e)| (ParamId(name.to_string()), Shard::new(*s as usize, *e as usize)))
                .collect(),
        }
    }

    #[test]
    fn s1_equal_split_single_param() {
        let buf = buffer(64, &[("p", 0, 64)]);
        for rank in 0..4 {
            let shard = gbuf_shard(&buf, 4, rank).unwrap();
            assert_eq!(shard.world, Shard::new(rank * 16, (rank + 1) * 16));
            let d = shard.param_map.get(&ParamId("p".into())).unwrap();
            assert_eq!(d.param, shard.world);
        }
    }

    #[test]
    fn s3_cross_boundary_parameter() {
        // W=2, N=10, params of shape [7] and [3] -> ranges [0,7) and [7,10).
        let buf = buffer(10, &[("p0", 0, 7), ("p1", 7, 10)]);

        let rank0 = gbuf_shard(&buf, 2, 0).unwrap();
        assert_eq!(rank0.world, Shard::new(0, 5));
        assert_eq!(rank0.param_map.len(), 1);
        let p0 = rank0.param_map.get(&ParamId("p0".into())).unwrap();
        assert_eq!(p0.param, Shard::new(0, 5));
        assert!(!rank0.param_map.contains_key(&ParamId("p1".into())));

        let rank1 = gbuf_shard(&buf, 2, 1).unwrap();
        assert_eq!(rank1.world, Shard::new(5, 10));
        assert_eq!(rank1.param_map.len(), 2);
        let p0 = rank1.param_map.get(&ParamId("p0".into())).unwrap();
        assert_eq!(p0.param, Shard::new(5, 7));
        let p1 = rank1.param_map.get(&ParamId("p1".into())).unwrap();
        assert_eq!(p1.param, Shard::new(0, 3));
    }

    #[test]
    fn partition_soundness_all_ranges_equal_size() {
        let buf = buffer(70, &[("p0", 0, 30), ("p1", 30, 70)]);
        for rank in 0..4 {
            let shard = gbuf_shard(&buf, 4, rank).unwrap();
            for d in shard.param_map.values() {
                assert_eq!(d.gbuf_world.size(), d.gbuf_local.size());
                assert_eq!(d.gbuf_local.size(), d.param.size());
            }
        }
    }

    #[test]
    fn world_all_is_a_disjoint_cover() {
        let buf = buffer(70, &[("p0", 0, 70)]);
        let shard = gbuf_shard(&buf, 4, 0).unwrap();
        let mut cursor = 0;
        for s in &shard.world_all {
            assert_eq!(s.start, cursor);
            cursor = s.end;
        }
        assert_eq!(cursor, 70);
    }
}
