//! Residual factors for the bundle adjustment problem.
//!
//! Every factor implements the solver backend's `Factor` trait generically
//! over [`nalgebra::RealField`], so the same residual code is driven with
//! dual numbers during optimization and with plain `f64` when the analyzer
//! regenerates residual vectors.

mod disparity;
mod priors;
mod reprojection;

pub use disparity::DisparityFactor;
pub use priors::{CameraPriorFactor, GcpLlhFactor, GcpXyzFactor, PosePriorFactor};
pub use reprojection::ReprojectionFactor;
