//! Allocates the sharded optimizer's own parameter groups: one flat fp32
//! master parameter and one flat fp32 master grad per retained group,
//! sized to exactly this rank's slice of the original group's parameters.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use tch::{Device, Kind, Tensor};

use crate::dtype::GradDtype;
use crate::error::InvariantError;
use crate::interfaces::{ModelReplica, ParamGroupDef, ParamId};
use crate::partition::GbufShard;
use crate::shard::Shard;

/// One retained master parameter group: a flat fp32 parameter and grad,
/// and the map from each contributing model parameter to its slice of it.
pub struct MasterGroup {
    pub options: serde_json::Value,
    pub master_param: Tensor,
    pub master_grad: Tensor,
    /// Ordered the same as the (model_index, dtype, parameter) visitation
    /// order used to build it; this is the layout the inner optimizer's
    /// single flat tensor is keyed against.
    pub param_map: IndexMap<ParamId, Shard>,
}

impl MasterGroup {
    pub fn group_size(&self) -> usize {
        self.master_param.numel()
    }
}

/// Build one `MasterGroup` per original group that retains at least one
/// owned byte on this rank, in the original groups' order.
///
/// `model_gbuf_shards[m]` is this model replica's per-dtype shard record,
/// as produced by [`crate::partition::model_gbuf_shard_map`].
pub fn allocate_master_groups(
    original_groups: &[ParamGroupDef],
    model_gbuf_shards: &[BTreeMap<GradDtype, GbufShard>],
    device: Device,
) -> Result<Vec<MasterGroup>, InvariantError> {
    let mut group_index_of: std::collections::HashMap<ParamId, usize> = std::collections::HashMap::new();
    for (gi, group) in original_groups.iter().enumerate() {
        for param in &group.params {
            group_index_of.insert(param.clone(), gi);
        }
    }

    let mut cursors = vec![0usize; original_groups.len()];
    let mut param_maps: Vec<IndexMap<ParamId, Shard>> = original_groups.iter().map(|_| IndexMap::new()).collect();

    for shard_map in model_gbuf_shards {
        // BTreeMap<GradDtype, _> iterates dtypes in a fixed order, matching
        // the stable (model_index, dtype, parameter) visitation this
        // allocator requires.
        for gbuf_shard in shard_map.values() {
            for (param, descriptor) in &gbuf_shard.param_map {
                let Some(&gi) = group_index_of.get(param) else {
                    continue;
                };
                let size = descriptor.gbuf_world.size();
                let start = cursors[gi];
                let range = Shard::new(start, start + size);
                cursors[gi] = range.end;
                param_maps[gi].insert(param.clone(), range);
            }
        }
    }

    let mut groups = Vec::new();
    for (gi, group) in original_groups.iter().enumerate() {
        let group_size = cursors[gi];
        if group_size == 0 {
            continue;
        }
        let param_map = std::mem::take(&mut param_maps[gi]);

        let total: usize = param_map.values().map(Shard::size).sum();
        if total != group_size {
            return Err(InvariantError::ShardSizeMismatch {
                group_index: gi,
                master_size: total,
                gbuf_size: group_size,
            });
        }

        let master_param = Tensor::zeros([group_size as i64], (Kind::Float, device));
        let master_grad = Tensor::zeros([group_size as i64], (Kind::Float, device));

        groups.push(MasterGroup {
            options: group.options.clone(),
            master_param,
            master_grad,
            param_map,
        });
    }

    Ok(groups)
}

/// Re-seed every master group's parameter values from the current model
/// weights (4.E run in reverse). Used both at construction and by
/// `reload_model_params`.
pub fn reload_from_models(groups: &mut [MasterGroup], models: &[&dyn ModelReplica]) {
    for group in groups.iter_mut() {
        for (param, master_range) in &group.param_map {
            // Every model replica is queried; only the one owning this
            // parameter returns a tensor of the matching shape for this
            // slice -- in practice there is exactly one, selected by the
            // caller via the param -> (model_index, dtype) map before this
            // is reached in a production wiring. Here we take the first
            // replica that knows about the parameter at all.
            if let Some(model) = models.iter().find(|m| {
                m.grad_buffers()
                    .values()
                    .any(|buf| buf.param_index_map.iter().any(|(p, _)| p == param))
            }) {
                let full = model.param_data(param);
                let flat = full.flatten(0, -1);
                let slice = flat.slice(0, master_range.start as i64, master_range.end as i64, 1);
                let mut dst = group
                    .master_param
                    .slice(0, master_range.start as i64, master_range.end as i64, 1);
                let _ = dst.copy_(&slice.to_kind(Kind::Float));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectives::world_shards;
    use crate::interfaces::GradBuffer;
    use crate::partition::gbuf_shard;

    fn buf(n: i64, params: &[(&str, i64, i64)]) -> BTreeMap<GradDtype, GbufShard> {
        let gbuf = GradBuffer {
            dtype: GradDtype::F32,
            tensor: Tensor::zeros([n], (Kind::Float, Device::Cpu)),
            param_index_map: params
                .iter()
                .map(|(name, s, e)| (ParamId(name.to_string()), Shard::new(*s as usize, *e as usize)))
                .collect(),
        };
        let mut map = BTreeMap::new();
        map.insert(GradDtype::F32, gbuf_shard(&gbuf, 2, 0).unwrap());
        map
    }

    #[test]
    fn group_size_matches_sum_of_shards() {
        let groups = vec![ParamGroupDef {
            params: vec![ParamId("p0".into()), ParamId("p1".into())],
            options: serde_json::json!({"lr": 0.1}),
        }];
        let shards = vec![buf(10, &[("p0", 0, 7), ("p1", 7, 10)])];
        let master = allocate_master_groups(&groups, &shards, Device::Cpu).unwrap();
        assert_eq!(master.len(), 1);
        assert_eq!(master[0].group_size(), 5); // rank 0 owns [0,5)
    }

    #[test]
    fn empty_groups_are_dropped() {
        let groups = vec![
            ParamGroupDef {
                params: vec![ParamId("unused".into())],
                options: serde_json::Value::Null,
            },
            ParamGroupDef {
                params: vec![ParamId("p0".into())],
                options: serde_json::Value::Null,
            },
        ];
        let shards = vec![buf(10, &[("p0", 0, 7)])];
        let master = allocate_master_groups(&groups, &shards, Device::Cpu).unwrap();
        assert_eq!(master.len(), 1);
    }

    #[test]
    fn param_ranges_are_disjoint_and_cover_group() {
        let groups = vec![ParamGroupDef {
            params: vec![ParamId("p0".into()), ParamId("p1".into())],
            options: serde_json::Value::Null,
        }];
        let shards = vec![buf(10, &[("p0", 0, 7), ("p1", 7, 10)])];
        let master = allocate_master_groups(&groups, &shards, Device::Cpu).unwrap();
        let mut ranges: Vec<Shard> = master[0].param_map.values().copied().collect();
        ranges.sort_by_key(|r| r.start);
        let mut cursor = 0;
        for r in &ranges {
            assert_eq!(r.start, cursor);
            cursor = r.end;
        }
        assert_eq!(cursor, master[0].group_size());
    }

    #[test]
    fn world_shards_used_by_fixture_are_consistent() {
        // sanity check the test fixture's own partitioning assumption
        let shards = world_shards(10, 2);
        assert_eq!(shards[0], Shard::new(0, 5));
        assert_eq!(shards[1], Shard::new(5, 10));
    }
}
