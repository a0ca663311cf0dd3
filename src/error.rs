//! Error taxonomy for the sharded optimizer.
//!
//! Numerical non-finite gradients are deliberately *not* modeled as an
//! error anywhere in this crate -- see [`crate::step::StepOutcome`]. The
//! kinds below only cover things that are fail-fast (construction) or
//! fatal (collectives, once in flight).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported gradient dtype: {0}")]
    UnsupportedDtype(String),

    #[error("half-precision (fp16) optimizer requires a grad scaler")]
    MissingGradScaler,

    #[error("scale-one mode requires bfloat16 parameters, found {0:?}")]
    ScaleOneRequiresBf16(crate::dtype::GradDtype),
}

#[derive(Error, Debug)]
pub enum InvariantError {
    #[error(
        "master_range size {master_size} does not match gbuf_world size {gbuf_size} for group {group_index}"
    )]
    ShardSizeMismatch {
        group_index: usize,
        master_size: usize,
        gbuf_size: usize,
    },

    #[error("attempted to allocate a zero-size parameter group")]
    ZeroSizeGroup,

    #[error("param ranges in group {group_index} are not disjoint or escape [0, group_size)")]
    GroupRangeOverlap { group_index: usize },

    #[error("world shards for buffer {buffer_label} do not partition [0, {n})")]
    PartitionMismatch { buffer_label: String, n: usize },
}

#[derive(Error, Debug)]
pub enum CollectiveError {
    #[error("world size mismatch: expected {expected}, got {got}")]
    WorldSizeMismatch { expected: usize, got: usize },

    #[error("nonconforming shapes in collective: {0}")]
    ShapeMismatch(String),

    #[error("rank {rank} does not belong to the required process group")]
    NotInGroup { rank: usize },

    #[error("backend error: {0}")]
    Backend(String),
}

/// Umbrella error returned by fail-fast construction paths. Collective
/// errors surface separately -- they are fatal once a step is underway and
/// implementations may choose to abort the process rather than propagate
/// them further, per the orchestrator's failure semantics.
#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Invariant(#[from] InvariantError),

    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error("attempted to step() after a collective failure left the optimizer in an undefined state")]
    Poisoned,
}
