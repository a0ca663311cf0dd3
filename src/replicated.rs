//! The replicated variant of the optimizer (§6, §8 property 4): every rank
//! holds the *entire* master state rather than a shard of it. `reduce_grads`
//! dense all-reduces instead of reduce-scattering, and `gather_params` has
//! nothing left to redistribute across ranks -- but it still resyncs the
//! model's canonical parameter tensors from the buffer, same as the
//! distributed variant.
//!
//! Built on the same master-state/step machinery as [`crate::optimizer`];
//! the only behavioral difference is the collective shape, achieved here
//! by constructing every model's partition with `world_size = 1` so each
//! rank's single "shard" already covers the whole buffer.

use std::collections::{BTreeMap, HashMap};

use tch::{Device, Tensor};

use crate::collectives::{Communicator, ReduceType};
use crate::dtype::GradDtype;
use crate::error::OptimizerError;
use crate::interfaces::{GradBuffer, InnerOptimizer, ModelReplica, ParamGroupDef, ParamId};
use crate::loss_scale::{DynamicScalePolicy, LossScaleController};
use crate::master_state::{allocate_master_groups, reload_from_models, MasterGroup};
use crate::partition::{model_gbuf_shard_map, param_gbuf_map as build_param_gbuf_map, GbufShard};
use crate::step::{run_step, StepConfig, StepInputs, StepOutcome};

pub struct ReplicatedOptimizerConfig {
    pub dtype: GradDtype,
    pub max_grad_norm: Option<f64>,
    pub count_zeros: bool,
    pub device: Device,
}

pub struct ReplicatedOptimizer {
    grad_buffers: Vec<BTreeMap<GradDtype, GradBuffer>>,
    model_gbuf_shards: Vec<BTreeMap<GradDtype, GbufShard>>,
    param_gbuf_map: HashMap<ParamId, (usize, GradDtype)>,
    groups: Vec<MasterGroup>,
    inner: Box<dyn InnerOptimizer>,
    loss_scale: LossScaleController,
    comm: Box<dyn Communicator>,
    config: ReplicatedOptimizerConfig,
}

impl ReplicatedOptimizer {
    pub fn new(
        models: &[&dyn ModelReplica],
        original_groups: &[ParamGroupDef],
        mut inner: Box<dyn InnerOptimizer>,
        comm: Box<dyn Communicator>,
        config: ReplicatedOptimizerConfig,
    ) -> Result<Self, OptimizerError> {
        let model_gbuf_shards: Vec<_> = models
            .iter()
            .map(|m| model_gbuf_shard_map(*m, 1, 0))
            .collect::<Result<_, _>>()?;

        let grad_buffers: Vec<BTreeMap<GradDtype, GradBuffer>> = models
            .iter()
            .map(|m| m.grad_buffers().iter().map(|(d, b)| (*d, b.alias())).collect())
            .collect();

        let param_gbuf_map = build_param_gbuf_map(&model_gbuf_shards);
        let mut groups = allocate_master_groups(original_groups, &model_gbuf_shards, config.device)?;
        reload_from_models(&mut groups, models);

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
            config,
        })
    }

    pub fn zero_grad(&mut self) {
        for buffers in self.grad_buffers.iter_mut() {
            for buffer in buffers.values_mut() {
                let _ = buffer.tensor.zero_();
            }
        }
    }

    /// Dense all-reduce in place of reduce-scatter: every rank ends up
    /// with the full summed buffer rather than only its shard.
    pub fn reduce_grads(&mut self) -> Result<(), crate::error::CollectiveError> {
        for buffers in self.grad_buffers.iter_mut() {
            for buffer in buffers.values_mut() {
                self.comm.all_reduce(&mut buffer.tensor, ReduceType::Mean)?;
            }
        }
        Ok(())
    }

    /// Nothing to redistribute -- every rank already holds the full
    /// buffer -- but the model's canonical parameter tensors still need
    /// resyncing from it, the same final step the distributed variant
    /// performs after its all-gather.
    pub fn gather_params(&mut self, models: &[&dyn ModelReplica]) -> Result<(), crate::error::CollectiveError> {
        crate::step::gather_params(&mut self.grad_buffers, &self.model_gbuf_shards, self.comm.as_ref(), models)
    }

    pub fn step(&mut self, models: &[&dyn ModelReplica]) -> StepOutcome {
        run_step(
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
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectives::ReduceType as RT;
    use crate::error::CollectiveError;
    use crate::shard::Shard;
    use std::cell::RefCell;
    use tch::Kind;

    struct SingleRankComm;
    impl Communicator for SingleRankComm {
        fn rank(&self) -> usize {
            0
        }
        fn world_size(&self) -> usize {
            1
        }
        fn all_reduce(&self, _tensor: &mut Tensor, _op: RT) -> Result<(), CollectiveError> {
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

    struct OneParamModel {
        grads: BTreeMap<GradDtype, GradBuffer>,
        param: RefCell<Tensor>,
    }

    impl ModelReplica for OneParamModel {
        fn grad_buffers(&self) -> &BTreeMap<GradDtype, GradBuffer> {
            &self.grads
        }
        fn grad_buffers_mut(&mut self) -> &mut BTreeMap<GradDtype, GradBuffer> {
            &mut self.grads
        }
        fn param_attrs(&self, _id: &ParamId) -> crate::interfaces::ParamAttrs {
            Default::default()
        }
        fn main_grad(&self, _id: &ParamId) -> Option<Tensor> {
            None
        }
        fn param_data(&self, _id: &ParamId) -> Tensor {
            self.param.borrow().shallow_clone()
        }
        fn set_param_data(&self, _id: &ParamId, data: &Tensor) {
            let _ = self.param.borrow_mut().copy_(data);
        }
    }

    fn fixture() -> OneParamModel {
        let mut grads = BTreeMap::new();
        grads.insert(
            GradDtype::F32,
            GradBuffer {
                dtype: GradDtype::F32,
                tensor: Tensor::zeros([4], (Kind::Float, Device::Cpu)),
                param_index_map: vec![(ParamId("p".into()), Shard::new(0, 4))],
            },
        );
        OneParamModel {
            grads,
            param: RefCell::new(Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0])),
        }
    }

    #[test]
    fn replicated_optimizer_reduce_grads_is_dense() {
        let model = fixture();
        let models: Vec<&dyn ModelReplica> = vec![&model];
        let groups = vec![ParamGroupDef {
            params: vec![ParamId("p".into())],
            options: serde_json::Value::Null,
        }];
        let inner = Box::new(NullInner);
        let comm = Box::new(SingleRankComm);
        let mut opt = ReplicatedOptimizer::new(
            &models,
            &groups,
            inner,
            comm,
            ReplicatedOptimizerConfig {
                dtype: GradDtype::F32,
                max_grad_norm: None,
                count_zeros: false,
                device: Device::Cpu,
            },
        )
        .unwrap();
        // a single-rank world: reduce_grads must not error and leaves the
        // buffer's full range valid (unlike a real reduce-scatter, which
        // would leave everything outside the local shard undefined).
        opt.reduce_grads().unwrap();
        opt.gather_params(&models).unwrap();
    }

    struct NullInner;
    impl InnerOptimizer for NullInner {
        fn set_param_groups(&mut self, _groups: Vec<(ParamGroupDef, Tensor, Tensor)>) {}
        fn step(&mut self) {}
        fn state_dict(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn load_state_dict(&mut self, _state: serde_json::Value) {}
    }
}
