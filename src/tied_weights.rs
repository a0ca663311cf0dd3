//! Tied-weight synchronizer (4.G): all-reduces the gradient of parameters
//! shared across pipeline stages -- word and position embeddings -- before
//! reduce-scatter sees them.

use tch::Tensor;

use crate::collectives::{ReduceType, Subgroup};
use crate::error::CollectiveError;
use crate::interfaces::{ModelReplica, ParamId};

/// All-reduce the gradients of every parameter marked `shared` within the
/// given subgroup, if this rank belongs to it and the subgroup is non-trivial.
///
/// A one-stage pipeline has no tied-weight duplicates to reconcile, so this
/// is a no-op whenever `subgroup.contains_local_rank()` is false -- matching
/// the contract's "only executed when pipeline world size > 1 and the local
/// rank belongs to the embedding subgroup".
pub fn sync_tied_weight_grads(
    model: &dyn ModelReplica,
    param_ids: &[ParamId],
    grads: &mut [Tensor],
    subgroup: &dyn Subgroup,
) -> Result<(), CollectiveError> {
    if !subgroup.contains_local_rank() {
        return Ok(());
    }
    for (id, grad) in param_ids.iter().zip(grads.iter_mut()) {
        if !model.param_attrs(id).shared {
            continue;
        }
        subgroup.all_reduce(grad, ReduceType::Sum)?;
    }
    Ok(())
}
