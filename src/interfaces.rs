//! Capabilities consumed from outside this crate: the data-parallel
//! wrapper's contiguous grad buffers, and the inner (unsharded) numerical
//! optimizer. Both are named interfaces rather than concrete types -- the
//! buffer construction and the Adam/SGD math are out of scope here.

use std::collections::BTreeMap;

use tch::Tensor;

use crate::dtype::GradDtype;
use crate::shard::Shard;

/// Stable identity for a model parameter, independent of any particular
/// tensor handle. psyche's `nn::VarStore` keys parameters by their dotted
/// name (`model.layers.0.mlp.up_proj.weight`); we do the same rather than
/// hashing on `Tensor`, which has no stable identity of its own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId(pub String);

impl std::fmt::Display for ParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-parameter flags the model attaches alongside its tensors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamAttrs {
    /// True for tensor-parallel-sharded parameters; used to avoid
    /// double-counting a replicated duplicate in global grad-norm.
    pub tensor_model_parallel: bool,
    /// Marks a weight tied across pipeline stages (word/position
    /// embeddings) that needs all-reducing before reduce-scatter.
    pub shared: bool,
}

/// A flat, contiguous per-dtype gradient buffer and the ordered map of
/// where each parameter's gradient lives within it.
///
/// Invariant: the parameter ranges are a partition of `[0, len)` or a
/// prefix thereof, in stable iteration order, never overlapping.
pub struct GradBuffer {
    pub dtype: GradDtype,
    pub tensor: Tensor,
    pub param_index_map: Vec<(ParamId, Shard)>,
}

impl GradBuffer {
    pub fn len(&self) -> usize {
        self.tensor.numel()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A handle the optimizer can own and mutate that aliases the same
    /// underlying storage as the model's buffer, the way `nn::VarStore`
    /// handles are shared rather than copied. Collective and copy ops run
    /// against this alias still land on the model's real memory.
    pub fn alias(&self) -> GradBuffer {
        GradBuffer {
            dtype: self.dtype,
            tensor: self.tensor.shallow_clone(),
            param_index_map: self.param_index_map.clone(),
        }
    }
}

/// One model replica as seen by the sharded optimizer: the data-parallel
/// wrapper's per-dtype grad buffers, plus whatever per-parameter state the
/// model exposes alongside them.
///
/// The forward/backward engine that populates these buffers, and the
/// buffer construction itself, are external collaborators -- this trait
/// only names the surface the optimizer reads and writes.
pub trait ModelReplica {
    /// Per-dtype grad buffers, in stable iteration order.
    fn grad_buffers(&self) -> &BTreeMap<GradDtype, GradBuffer>;
    fn grad_buffers_mut(&mut self) -> &mut BTreeMap<GradDtype, GradBuffer>;

    fn param_attrs(&self, id: &ParamId) -> ParamAttrs;

    /// Accumulation-precision grad tensor, when `params_have_main_grad` is
    /// set; `None` means the model stores grads the ordinary way.
    fn main_grad(&self, id: &ParamId) -> Option<Tensor>;

    /// Current half-precision (or fp32) value of a parameter, read during
    /// master-state (re)initialization.
    fn param_data(&self, id: &ParamId) -> Tensor;

    /// Overwrite a parameter's canonical tensor, used for the final
    /// resync after an all-gather has staged updated values into the
    /// grad buffer.
    fn set_param_data(&self, id: &ParamId, data: &Tensor);
}

/// Definition of one of the *original* (unsharded) optimizer's parameter
/// groups, as handed to the allocator at construction time.
#[derive(Debug, Clone)]
pub struct ParamGroupDef {
    pub params: Vec<ParamId>,
    /// Opaque per-group hyperparameters (lr, weight_decay, betas, ...),
    /// round-tripped verbatim -- the inner optimizer is the only thing
    /// that interprets them.
    pub options: serde_json::Value,
}

/// The numerical optimizer this crate wraps (Adam, SGD, ...), consumed
/// only through `step()` over a single parameter group of flat tensors.
pub trait InnerOptimizer {
    /// Replace this optimizer's parameter groups. Called exactly once, at
    /// construction, with one group per retained master group.
    fn set_param_groups(&mut self, groups: Vec<(ParamGroupDef, Tensor, Tensor)>);

    /// Advance optimizer state using the current master grads. Called
    /// exactly once per successful outer step.
    fn step(&mut self);

    fn state_dict(&self) -> serde_json::Value;
    fn load_state_dict(&mut self, state: serde_json::Value);
}
