//! Robust loss kernels.
//!
//! One kernel is configured per run and applied to reprojection and
//! terrain-disparity blocks only; GCP and camera-prior blocks always use the
//! trivial kernel so outliers are never discounted against anchor data.
//!
//! The kernel exists in two forms: compiled into the solver backend's loss
//! objects for optimization, and as a plain `rho` used when the analyzer
//! re-evaluates residual vectors with the loss applied.

use anyhow::{bail, ensure, Result};
use ba_core::Real;
use serde::{Deserialize, Serialize};
use tiny_solver::loss_functions::{ArctanLoss, CauchyLoss, HuberLoss, Loss};

/// Robust kernel selection with its threshold baked in.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum RobustKernel {
    /// Pure L2, no robustness.
    #[default]
    None,
    Huber {
        scale: Real,
    },
    Cauchy {
        scale: Real,
    },
    Arctan {
        scale: Real,
    },
}

impl RobustKernel {
    /// Parse the `cost-function` option. `threshold` is the configured
    /// robust threshold, ignored for `l2`.
    pub fn from_config(name: &str, threshold: Real) -> Result<Self> {
        let kernel = match name.to_lowercase().as_str() {
            "l2" => RobustKernel::None,
            "huber" => RobustKernel::Huber { scale: threshold },
            "cauchy" => RobustKernel::Cauchy { scale: threshold },
            "arctan" => RobustKernel::Arctan { scale: threshold },
            other => bail!(
                "unknown cost function: {} (options: l2, huber, cauchy, arctan)",
                other
            ),
        };
        if !matches!(kernel, RobustKernel::None) {
            ensure!(threshold > 0.0, "robust threshold must be positive");
        }
        Ok(kernel)
    }

    /// Loss `rho(s)` for a squared residual norm `s`.
    pub fn rho(self, s: Real) -> Real {
        match self {
            RobustKernel::None => s,
            RobustKernel::Huber { scale } => {
                let r = s.sqrt();
                if r <= scale {
                    s
                } else {
                    2.0 * scale * r - scale * scale
                }
            }
            RobustKernel::Cauchy { scale } => {
                let c2 = scale * scale;
                c2 * (1.0 + s / c2).ln()
            }
            RobustKernel::Arctan { scale } => scale * (s / scale).atan(),
        }
    }

    /// Compile to the solver backend's loss object; `None` means trivial.
    pub fn to_loss(self) -> Option<Box<dyn Loss + Send>> {
        match self {
            RobustKernel::None => None,
            RobustKernel::Huber { scale } => Some(Box::new(HuberLoss::new(scale))),
            RobustKernel::Cauchy { scale } => Some(Box::new(CauchyLoss::new(scale))),
            RobustKernel::Arctan { scale } => Some(Box::new(ArctanLoss::new(scale))),
        }
    }

    /// Scale a residual block in place so its squared norm becomes
    /// `rho(||r||^2)`.
    pub fn correct_residuals(self, block: &mut [Real]) {
        if matches!(self, RobustKernel::None) {
            return;
        }
        let s: Real = block.iter().map(|v| v * v).sum();
        if s <= 0.0 {
            return;
        }
        let factor = (self.rho(s) / s).sqrt();
        for v in block.iter_mut() {
            *v *= factor;
        }
    }
}
