//! Top-level distributed sharded optimizer: wires the partitioner, master
//! allocator, loss-scale controller, tied-weight sync, collective driver,
//! step orchestrator, and checkpoint adapter into the external operations
//! in §6.

use std::collections::{BTreeMap, HashMap};

use tch::{Device, Tensor};
use tracing::info;

use crate::checkpoint::{from_state_dict, to_state_dict, CheckpointState};
use crate::collectives::{Communicator, Subgroup};
use crate::dtype::GradDtype;
use crate::error::InvariantError;
use crate::interfaces::{GradBuffer, InnerOptimizer, ModelReplica, ParamGroupDef, ParamId};
use crate::loss_scale::{DynamicScalePolicy, LossScaleController};
use crate::master_state::{allocate_master_groups, reload_from_models, MasterGroup};
use crate::partition::{model_gbuf_shard_map, param_gbuf_map as build_param_gbuf_map, GbufShard};
use crate::step::{gather_params as run_gather_params, reduce_grads as run_reduce_grads, run_step, StepConfig, StepInputs, StepOutcome};
use crate::tied_weights::sync_tied_weight_grads;

/// Construction-time configuration, orthogonal to any particular step.
pub struct OptimizerConfig {
    pub world_size: usize,
    pub rank: usize,
    pub dtype: GradDtype,
    pub max_grad_norm: Option<f64>,
    pub count_zeros: bool,
    pub device: Device,
}

/// A distributed mixed-precision optimizer sharding its full-precision
/// state across the data-parallel world.
pub struct DistributedOptimizer {
    grad_buffers: Vec<BTreeMap<GradDtype, GradBuffer>>,
    model_gbuf_shards: Vec<BTreeMap<GradDtype, GbufShard>>,
    param_gbuf_map: HashMap<ParamId, (usize, GradDtype)>,
    groups: Vec<MasterGroup>,
    inner: Box<dyn InnerOptimizer>,
    loss_scale: LossScaleController,
    comm: Box<dyn Communicator>,
    tied_subgroup: Option<Box<dyn Subgroup>>,
    config: OptimizerConfig,
}

impl DistributedOptimizer {
    /// Partition every model's grad buffers, allocate master groups sized
    /// to this rank's shard, round-trip the inner optimizer's state onto
    /// the new flat groups, and seed master parameters from current model
    /// weights (4.B, 4.C, construction-time half of 4.E).
    pub fn new(
        models: &[&dyn ModelReplica],
        original_groups: &[ParamGroupDef],
        mut inner: Box<dyn InnerOptimizer>,
        comm: Box<dyn Communicator>,
        tied_subgroup: Option<Box<dyn Subgroup>>,
        config: OptimizerConfig,
    ) -> Result<Self, crate::error::OptimizerError> {
        let model_gbuf_shards: Vec<_> = models
            .iter()
            .map(|m| model_gbuf_shard_map(*m, config.world_size, config.rank))
            .collect::<Result<_, InvariantError>>()?;

        let grad_buffers: Vec<BTreeMap<GradDtype, GradBuffer>> = models
            .iter()
            .map(|m| m.grad_buffers().iter().map(|(d, b)| (*d, b.alias())).collect())
            .collect();

        let param_gbuf_map = build_param_gbuf_map(&model_gbuf_shards);

        let mut groups = allocate_master_groups(original_groups, &model_gbuf_shards, config.device)?;

        reload_from_models(&mut groups, models);

        // `group.options`/`group.param_map` were already carried over from
        // the original definition by the allocator; re-derive each
        // retained group's `ParamGroupDef` from them rather than zipping
        // against `original_groups`, since dropped (zero-size) groups
        // would otherwise desync the two sequences.
        let group_tensors: Vec<(ParamGroupDef, Tensor, Tensor)> = groups
            .iter()
            .map(|mg| {
                let def = ParamGroupDef {
                    params: mg.param_map.keys().cloned().collect(),
                    options: mg.options.clone(),
                };
                (def, mg.master_param.shallow_clone(), mg.master_grad.shallow_clone())
            })
            .collect();
        inner.set_param_groups(group_tensors);

        let loss_scale = if config.dtype.needs_dynamic_scaling() {
            LossScaleController::dynamic(2f64.powi(16), DynamicScalePolicy::default())
        } else {
            LossScaleController::fixed(1.0, config.dtype)?
        };

        Ok(Self {
            grad_buffers,
            model_gbuf_shards,
            param_gbuf_map,
            groups,
            inner,
            loss_scale,
            comm,
            tied_subgroup,
            config,
        })
    }

    /// Zero every grad buffer's slots, matching the `set_to_none=false`
    /// contract for contiguous buffers.
    pub fn zero_grad(&mut self) {
        for buffers in self.grad_buffers.iter_mut() {
            for buffer in buffers.values_mut() {
                let _ = buffer.tensor.zero_();
            }
        }
    }

    /// 4.G then 4.H: tied-weight all-reduce followed by reduce-scatter.
    pub fn reduce_grads(&mut self, models: &[&dyn ModelReplica]) -> Result<(), crate::error::CollectiveError> {
        if let Some(sub) = &self.tied_subgroup {
            for (model_index, model) in models.iter().enumerate() {
                for buffer in self.grad_buffers[model_index].values_mut() {
                    let ids: Vec<ParamId> = buffer.param_index_map.iter().map(|(p, _)| p.clone()).collect();
                    let mut grads: Vec<Tensor> = buffer
                        .param_index_map
                        .iter()
                        .map(|(_, r)| buffer.tensor.slice(0, r.start as i64, r.end as i64, 1))
                        .collect();
                    sync_tied_weight_grads(*model, &ids, &mut grads, sub.as_ref())?;
                }
            }
        }
        run_reduce_grads(&mut self.grad_buffers, &self.model_gbuf_shards, self.comm.as_ref())
    }

    /// 4.H': all-gather updated parameters after a successful step, then
    /// resync the model's canonical parameter tensors from the gathered
    /// buffers.
    pub fn gather_params(&mut self, models: &[&dyn ModelReplica]) -> Result<(), crate::error::CollectiveError> {
        run_gather_params(&mut self.grad_buffers, &self.model_gbuf_shards, self.comm.as_ref(), models)
    }

    /// Full outer step (4.I): grad copy-in, unscale/overflow check, and on
    /// success, clip, inner step, param copy-out, and all-gather.
    pub fn step(&mut self, models: &[&dyn ModelReplica]) -> StepOutcome {
        let outcome = run_step(
            StepInputs {
                groups: &mut self.groups,
                grad_buffers: &mut self.grad_buffers,
                model_gbuf_shards: &self.model_gbuf_shards,
                param_gbuf_map: &self.param_gbuf_map,
                comm: self.comm.as_ref(),
                inner: self.inner.as_mut(),
                loss_scale: &mut self.loss_scale,
            },
            models,
            StepConfig {
                max_grad_norm: self.config.max_grad_norm,
                count_zeros: self.config.count_zeros,
            },
        );
        if outcome.success {
            info!(rank = self.config.rank, "step applied");
        }
        outcome
    }

    pub fn get_loss_scale(&self) -> Tensor {
        self.loss_scale.get_loss_scale(self.config.device)
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Tensor {
        self.loss_scale.scale_loss(loss)
    }

    /// Re-copy the flat per-dtype grad buffers (without going through a
    /// backward pass) is not part of this operation; this only re-seeds
    /// master parameters from the model's current weights, for recovery
    /// after an external reload of model state.
    pub fn reload_model_params(&mut self, models: &[&dyn ModelReplica]) {
        reload_from_models(&mut self.groups, models);
    }

    pub fn state_dict(&self) -> serde_json::Value {
        let fp32_from_fp16_params = self
            .groups
            .iter()
            .map(|g| Vec::<f32>::try_from(&g.master_param).unwrap_or_default())
            .collect();
        let grad_scaler = if self.config.dtype.needs_dynamic_scaling() {
            Some(serde_json::json!({ "scale": self.loss_scale.scale_factor() }))
        } else {
            None
        };
        to_state_dict(&CheckpointState {
            optimizer: self.inner.state_dict(),
            grad_scaler,
            fp32_from_fp16_params,
        })
    }

    pub fn load_state_dict(&mut self, dict: &serde_json::Value) {
        let loaded = from_state_dict(dict, self.config.dtype.needs_dynamic_scaling());
        self.inner.load_state_dict(loaded.optimizer);
        for (group, values) in self.groups.iter_mut().zip(loaded.fp32_from_fp16_params.iter()) {
            if values.len() == group.group_size() {
                let _ = group.master_param.copy_(&Tensor::from_slice(values));
            }
        }
    }
}
