//! The closed set of element dtypes a grad buffer may hold.
//!
//! Construction rejects any `torch` dtype outside this set rather than
//! dispatching on it at runtime.

use tch::Kind;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GradDtype {
    F16,
    BF16,
    F32,
}

impl GradDtype {
    pub fn from_kind(kind: Kind) -> Result<Self, ConfigError> {
        match kind {
            Kind::Half => Ok(GradDtype::F16),
            Kind::BFloat16 => Ok(GradDtype::BF16),
            Kind::Float => Ok(GradDtype::F32),
            other => Err(ConfigError::UnsupportedDtype(format!("{other:?}"))),
        }
    }

    pub fn to_kind(self) -> Kind {
        match self {
            GradDtype::F16 => Kind::Half,
            GradDtype::BF16 => Kind::BFloat16,
            GradDtype::F32 => Kind::Float,
        }
    }

    /// Whether this half-precision dtype requires dynamic loss scaling
    /// (5-bit exponent, i.e. fp16 -- not bf16, which has the same exponent
    /// range as fp32).
    pub fn needs_dynamic_scaling(self) -> bool {
        matches!(self, GradDtype::F16)
    }
}
