//! A distributed mixed-precision optimizer for synchronous data-parallel
//! training: each rank holds a full half-precision model replica but owns
//! only a disjoint shard of the full-precision optimizer state. Gradients
//! are summed by reduce-scatter, the inner optimizer steps locally over
//! the owned shard, and updated parameters are redistributed by
//! all-gather.
//!
//! See [`optimizer::DistributedOptimizer`] for the sharded variant and
//! [`replicated::ReplicatedOptimizer`] for the dense reference variant
//! used to check equivalence against it.

pub mod checkpoint;
pub mod collectives;
pub mod copy;
pub mod dtype;
pub mod error;
pub mod interfaces;
pub mod loss_scale;
pub mod master_state;
pub mod optimizer;
pub mod partition;
pub mod replicated;
pub mod shard;
pub mod step;
pub mod tied_weights;

pub use dtype::GradDtype;
pub use error::{CollectiveError, ConfigError, InvariantError, OptimizerError};
pub use interfaces::{GradBuffer, InnerOptimizer, ModelReplica, ParamAttrs, ParamGroupDef, ParamId};
pub use optimizer::{DistributedOptimizer, OptimizerConfig};
pub use replicated::{ReplicatedOptimizer, ReplicatedOptimizerConfig};
pub use shard::Shard;
pub use step::StepOutcome;
