//! Grad copy-in (4.D) and param copy-out (4.E): the slice copies that move
//! data between a model replica's per-dtype grad buffers and the sharded
//! optimizer's flat master tensors.

use std::collections::{BTreeMap, HashMap};

use tch::Kind;

use crate::dtype::GradDtype;
use crate::error::InvariantError;
use crate::interfaces::{GradBuffer, ParamId};
use crate::master_state::MasterGroup;
use crate::partition::GbufShard;

/// Copy each retained group's owned slice of its contributing grad buffers
/// into the group's flat master grad.
///
/// `param_gbuf_map` resolves a parameter to the `(model_index, dtype)` of
/// the buffer it lives in; `model_gbuf_shards[m][d]` gives the `gbuf_world`
/// range to slice out of that buffer.
pub fn copy_grads_in_with(
    groups: &mut [MasterGroup],
    grad_buffers: &[BTreeMap<GradDtype, GradBuffer>],
    param_gbuf_map: &HashMap<ParamId, (usize, GradDtype)>,
    model_gbuf_shards: &[BTreeMap<GradDtype, GbufShard>],
) -> Result<(), InvariantError> {
    for (gi, group) in groups.iter_mut().enumerate() {
        for (param, master_range) in &group.param_map {
            let (model_index, dtype) = *param_gbuf_map
                .get(param)
                .expect("every master-group parameter must resolve to a buffer");
            let descriptor = model_gbuf_shards[model_index]
                .get(&dtype)
                .and_then(|s| s.param_map.get(param))
                .expect("shard map and master group built from the same replicas must agree");

            if master_range.size() != descriptor.gbuf_world.size() {
                return Err(InvariantError::ShardSizeMismatch {
                    group_index: gi,
                    master_size: master_range.size(),
                    gbuf_size: descriptor.gbuf_world.size(),
                });
            }

            let buf = &grad_buffers[model_index][&dtype].tensor;
            let src = buf.slice(
                0,
                descriptor.gbuf_world.start as i64,
                descriptor.gbuf_world.end as i64,
                1,
            );
            let mut dst = group
                .master_grad
                .slice(0, master_range.start as i64, master_range.end as i64, 1);
            let _ = dst.copy_(&src.to_kind(Kind::Float));
        }
    }
    Ok(())
}

/// Inverse of [`copy_grads_in_with`]: write each group's updated master
/// parameters back into the local shard range of the per-dtype buffer they
/// came from, reusing it as parameter-staging storage ahead of all-gather.
pub fn copy_params_out(
    groups: &[MasterGroup],
    grad_buffers: &mut [BTreeMap<GradDtype, GradBuffer>],
    param_gbuf_map: &HashMap<ParamId, (usize, GradDtype)>,
    model_gbuf_shards: &[BTreeMap<GradDtype, GbufShard>],
) {
    for group in groups {
        for (param, master_range) in &group.param_map {
            let (model_index, dtype) = *param_gbuf_map
                .get(param)
                .expect("every master-group parameter must resolve to a buffer");
            let descriptor = model_gbuf_shards[model_index]
                .get(&dtype)
                .and_then(|s| s.param_map.get(param))
                .expect("shard map and master group built from the same replicas must agree");

            let src = group
                .master_param
                .slice(0, master_range.start as i64, master_range.end as i64, 1);
            let buf = &grad_buffers[model_index].get_mut(&dtype).unwrap().tensor;
            let buf_kind = buf.kind();
            let mut dst = buf.slice(
                0,
                descriptor.gbuf_world.start as i64,
                descriptor.gbuf_world.end as i64,
                1,
            );
            let _ = dst.copy_(&src.to_kind(buf_kind));
        }
    }
}
