//! Step orchestrator (4.I): sequences tied-weight reduction, reduce-scatter,
//! grad copy-in, unscale/overflow-check, clip, the inner optimizer step,
//! param copy-out, and all-gather.
//!
//! A non-finite grad is a control signal, not an error: `run_step` returns
//! `success=false` rather than propagating anything. Collective failures,
//! by contrast, are fatal -- they bubble out as `CollectiveError`.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::collectives::{all_gather_param_buffer, reduce_scatter_grad_buffer, Communicator};
use crate::copy::{copy_grads_in_with, copy_params_out};
use crate::dtype::GradDtype;
use crate::error::CollectiveError;
use crate::interfaces::{GradBuffer, InnerOptimizer, ModelReplica, ParamId};
use crate::loss_scale::LossScaleController;
use crate::master_state::MasterGroup;
use crate::partition::GbufShard;

/// Outcome of one outer optimizer step, mirroring the external `step()`
/// contract: `grad_norm` and `num_zeros` are only meaningful when
/// `success` is true.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub success: bool,
    pub grad_norm: Option<f64>,
    pub num_zeros: Option<i64>,
}

/// Per-step knobs read by the orchestrator; constant across steps.
#[derive(Debug, Clone, Copy)]
pub struct StepConfig {
    pub max_grad_norm: Option<f64>,
    pub count_zeros: bool,
}

/// Everything one call to [`run_step`] needs, borrowed for the duration of
/// the call. Kept as a bag of `&mut` rather than a struct with internal
/// mutability so the orchestrator has no hidden state of its own between
/// steps besides the loss-scale controller.
pub struct StepInputs<'a> {
    pub groups: &'a mut [MasterGroup],
    pub grad_buffers: &'a mut [BTreeMap<GradDtype, GradBuffer>],
    pub model_gbuf_shards: &'a [BTreeMap<GradDtype, GbufShard>],
    pub param_gbuf_map: &'a HashMap<ParamId, (usize, GradDtype)>,
    pub comm: &'a dyn Communicator,
    pub inner: &'a mut dyn InnerOptimizer,
    pub loss_scale: &'a mut LossScaleController,
}

/// Run the tied-weight reduction and reduce-scatter (4.G, 4.H) over every
/// model replica's grad buffers. Split out from [`run_step`] because it
/// also backs `reduce_grads()` on its own, ahead of any subsequent step.
pub fn reduce_grads(
    grad_buffers: &mut [BTreeMap<GradDtype, GradBuffer>],
    model_gbuf_shards: &[BTreeMap<GradDtype, GbufShard>],
    comm: &dyn Communicator,
) -> Result<(), CollectiveError> {
    for (model_index, buffers) in grad_buffers.iter_mut().enumerate() {
        for (dtype, buffer) in buffers.iter_mut() {
            let shard = model_gbuf_shards[model_index]
                .get(dtype)
                .expect("every grad buffer must have a corresponding shard record");
            reduce_scatter_grad_buffer(buffer, shard, comm)?;
        }
    }
    Ok(())
}

/// 4.H' all-gather, performed on its own by `gather_params()` after a
/// successful step has staged new parameters into the local shards; then
/// the final per-parameter resync (4.E's closing step) writes each
/// parameter's slice of the now fully-gathered buffer back into the
/// model's canonical tensor, matching the original's
/// `param.detach().copy_(param.main_grad)` immediately after its own
/// all-gather.
pub fn gather_params(
    grad_buffers: &mut [BTreeMap<GradDtype, GradBuffer>],
    model_gbuf_shards: &[BTreeMap<GradDtype, GbufShard>],
    comm: &dyn Communicator,
    models: &[&dyn ModelReplica],
) -> Result<(), CollectiveError> {
    for (model_index, buffers) in grad_buffers.iter_mut().enumerate() {
        for (dtype, buffer) in buffers.iter_mut() {
            let shard = model_gbuf_shards[model_index]
                .get(dtype)
                .expect("every grad buffer must have a corresponding shard record");
            all_gather_param_buffer(buffer, shard, comm)?;
        }
    }
    resync_model_params(grad_buffers, models);
    Ok(())
}

/// Write each parameter's slice of its (now fully up to date) buffer back
/// into the model's canonical parameter tensor.
fn resync_model_params(grad_buffers: &[BTreeMap<GradDtype, GradBuffer>], models: &[&dyn ModelReplica]) {
    for (model_index, buffers) in grad_buffers.iter().enumerate() {
        let model = models[model_index];
        for buffer in buffers.values() {
            for (param, range) in &buffer.param_index_map {
                let staged = buffer.tensor.slice(0, range.start as i64, range.end as i64, 1);
                let existing_kind = model.param_data(param).kind();
                model.set_param_data(param, &staged.to_kind(existing_kind));
            }
        }
    }
}

/// Global grad norm across master grads, with tensor-parallel duplicate
/// suppression: a parameter marked `tensor_model_parallel` is assumed
/// unique per tensor-parallel rank and is reduced across `tp_comm`; a
/// replicated parameter is counted locally only, since every tensor-
/// parallel rank already holds an identical copy of its gradient.
///
/// Mirrors the sharded-vs-replicated split in the forward/backward
/// engine's own grad-norm computation. On top of that, every master grad
/// here is itself split across the data-parallel world (each rank owns
/// only its own shard), so the combined squared norm is all-reduced over
/// `comm` before the final `sqrt` -- without this every rank would clip
/// against its own local shard's norm instead of the global one.
fn grad_norm(
    groups: &[MasterGroup],
    models: &[&dyn ModelReplica],
    comm: &dyn Communicator,
    tp_comm: Option<&dyn Communicator>,
) -> f64 {
    let mut sharded_sq = 0f64;
    let mut replicated_sq = 0f64;

    for group in groups {
        for (param, range) in &group.param_map {
            let slice = group
                .master_grad
                .slice(0, range.start as i64, range.end as i64, 1);
            let local_norm = slice.norm();
            let norm_sq = f64::try_from(&local_norm * &local_norm).unwrap_or(0.0);

            let tensor_parallel = models
                .first()
                .map(|m| m.param_attrs(param).tensor_model_parallel)
                .unwrap_or(false);

            if tensor_parallel {
                sharded_sq += norm_sq;
            } else {
                replicated_sq += norm_sq;
            }
        }
    }

    if let Some(tp_comm) = tp_comm {
        let mut t = tch::Tensor::from_slice(&[sharded_sq]);
        tp_comm
            .all_reduce(&mut t, crate::collectives::ReduceType::Sum)
            .expect("grad-norm all-reduce is fatal on failure");
        sharded_sq = f64::try_from(t).unwrap_or(sharded_sq);
    }

    let mut total = tch::Tensor::from_slice(&[sharded_sq + replicated_sq]);
    comm.all_reduce(&mut total, crate::collectives::ReduceType::Sum)
        .expect("grad-norm all-reduce is fatal on failure");
    let total_sq = f64::try_from(total).unwrap_or(sharded_sq + replicated_sq);

    total_sq.sqrt()
}

fn clip_grad_norm_(groups: &mut [MasterGroup], total_norm: f64, max_norm: f64) {
    if total_norm <= max_norm {
        return;
    }
    let scale = max_norm / (total_norm + 1e-6);
    for group in groups.iter_mut() {
        let _ = group.master_grad.f_mul_scalar_(scale).unwrap();
    }
}

fn count_zeros(groups: &[MasterGroup]) -> i64 {
    groups
        .iter()
        .map(|g| {
            let nonzero = g.master_grad.count_nonzero(0).int64_value(&[]);
            g.group_size() as i64 - nonzero
        })
        .sum()
}

/// Run one full outer step: `READY -> TIED_REDUCED -> SCATTERED ->
/// GRADS_COPIED -> {OVERFLOW -> READY | SCALED -> CLIPPED -> STEPPED ->
/// PARAMS_COPIED -> GATHERED -> READY}`.
///
/// Tied-weight reduction and reduce-scatter are assumed already performed
/// by a prior call to [`reduce_grads`] (the external `reduce_grads()`
/// operation); this function starts from `GRADS_COPIED` onward, matching
/// the external interface's separate `reduce_grads`/`step` operations.
pub fn run_step(inputs: StepInputs<'_>, models: &[&dyn ModelReplica], config: StepConfig) -> StepOutcome {
    let StepInputs {
        groups,
        grad_buffers,
        model_gbuf_shards,
        param_gbuf_map,
        comm,
        inner,
        loss_scale,
    } = inputs;

    copy_grads_in_with(groups, grad_buffers, param_gbuf_map, model_gbuf_shards)
        .expect("grad copy-in invariant violated");

    let local_overflow = loss_scale.unscale_and_check(groups);
    let overflow = loss_scale.reduce_found_inf(local_overflow, comm);
    loss_scale.update(overflow);

    if overflow {
        warn!(scale = loss_scale.scale_factor(), "loss scale overflow, skipping step");
        return StepOutcome {
            success: false,
            grad_norm: None,
            num_zeros: None,
        };
    }

    let norm = config.max_grad_norm.map(|max_norm| {
        let total = grad_norm(groups, models, comm, None);
        clip_grad_norm_(groups, total, max_norm);
        total
    });

    let zeros = config.count_zeros.then(|| count_zeros(groups));

    inner.step();
    debug!("inner optimizer step applied");

    copy_params_out(groups, grad_buffers, param_gbuf_map, model_gbuf_shards);

    gather_params(grad_buffers, model_gbuf_shards, comm, models).expect("all-gather is fatal on failure");

    info!(grad_norm = norm, "optimizer step succeeded");
    StepOutcome {
        success: true,
        grad_norm: norm,
        num_zeros: zeros,
    }
}
