//! Loss-scale controller: dynamic scaling for fp16, a static/no-op mode for
//! bf16 and externally-fixed scales.

use tch::{Device, Kind, Tensor};

use crate::collectives::{Communicator, ReduceType};
use crate::dtype::GradDtype;
use crate::error::ConfigError;
use crate::master_state::MasterGroup;

/// Growth/backoff policy for dynamic loss scaling.
#[derive(Debug, Clone, Copy)]
pub struct DynamicScalePolicy {
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: u32,
}

impl Default for DynamicScalePolicy {
    fn default() -> Self {
        Self {
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

enum Mode {
    /// fp16: scale multiplies the loss pre-backward, and is adjusted after
    /// every step based on whether an overflow was observed.
    Dynamic {
        policy: DynamicScalePolicy,
        good_steps: u32,
    },
    /// bf16 (or an externally fixed constant): unscale is a no-op.
    Static,
}

/// Owns the current scale factor and the overflow/backoff bookkeeping.
pub struct LossScaleController {
    scale: f64,
    mode: Mode,
}

impl LossScaleController {
    /// Dynamic scaling, starting from `init_scale`. Used for fp16.
    pub fn dynamic(init_scale: f64, policy: DynamicScalePolicy) -> Self {
        Self {
            scale: init_scale,
            mode: Mode::Dynamic { policy, good_steps: 0 },
        }
    }

    /// Fixed scale with no dynamic adjustment. Construction requires bf16,
    /// matching `scale_one` mode's precondition in the design.
    pub fn fixed(scale: f64, dtype: GradDtype) -> Result<Self, ConfigError> {
        if scale == 1.0 && dtype != GradDtype::BF16 {
            return Err(ConfigError::ScaleOneRequiresBf16(dtype));
        }
        Ok(Self {
            scale,
            mode: Mode::Static,
        })
    }

    pub fn get_loss_scale(&self, device: Device) -> Tensor {
        Tensor::from_slice(&[self.scale as f32]).to_device(device)
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Tensor {
        loss * self.scale
    }

    fn is_dynamic(&self) -> bool {
        matches!(self.mode, Mode::Dynamic { .. })
    }

    /// Unscale every group's master grad in place, and report whether any
    /// element anywhere was non-finite. In static mode this only checks
    /// finiteness; the grads are left untouched.
    pub fn unscale_and_check(&self, groups: &mut [MasterGroup]) -> bool {
        let mut found_inf = false;
        let inv_scale = 1.0 / self.scale;
        for group in groups.iter_mut() {
            let finite = group.master_grad.isfinite().all().int64_value(&[]) != 0;
            if !finite {
                found_inf = true;
            }
            if self.is_dynamic() {
                let _ = group.master_grad.f_mul_scalar_(inv_scale).unwrap();
            }
        }
        found_inf
    }

    /// Max-reduce the local overflow flag across the data-parallel world so
    /// every rank agrees: any overflowing rank causes all ranks to skip.
    pub fn reduce_found_inf(&self, local_found_inf: bool, comm: &dyn Communicator) -> bool {
        let mut flag = Tensor::from_slice(&[local_found_inf as i32]);
        comm.all_reduce(&mut flag, ReduceType::Max)
            .expect("found_inf reduction is a fatal collective error on failure");
        comm.synchronize();
        flag.int64_value(&[]) != 0
    }

    /// Apply the post-step backoff/growth policy. Call with the *global*
    /// (already cross-rank-reduced) overflow flag.
    pub fn update(&mut self, overflowed: bool) {
        let Mode::Dynamic { policy, good_steps } = &mut self.mode else {
            return;
        };
        if overflowed {
            self.scale *= policy.backoff_factor;
            *good_steps = 0;
        } else {
            *good_steps += 1;
            if *good_steps >= policy.growth_interval {
                self.scale *= policy.growth_factor;
                *good_steps = 0;
            }
        }
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale
    }
}
