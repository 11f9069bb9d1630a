//! The intrinsics scaling layer.
//!
//! Rather than optimizing intrinsic values directly, the problem optimizes
//! per-parameter multipliers initialized to 1.0; projection uses
//! `intrinsic_i * s_i`. After a solve the multipliers are absorbed into the
//! base values and reset, so a run always ends with a unit multiplier
//! vector. The three groups (focal length, optical center, distortion) can
//! be frozen individually.

use std::collections::BTreeSet;

use ba_core::{Intrinsics, Real};
use nalgebra::DVector;

pub const GROUP_FOCAL: &str = "focal_length";
pub const GROUP_CENTER: &str = "optical_center";
pub const GROUP_DISTORTION: &str = "distortion_params";

/// Parameter block keys for the shared intrinsic multipliers.
pub const KEY_FOCAL: &str = "intr/focal";
pub const KEY_CENTER: &str = "intr/center";
pub const KEY_DISTORTION: &str = "intr/dist";

/// Shared intrinsics plus their multiplier state.
#[derive(Debug, Clone)]
pub struct IntrinsicsState {
    pub base: Intrinsics,
    pub focal_multiplier: DVector<Real>,
    pub center_multiplier: DVector<Real>,
    pub dist_multiplier: DVector<Real>,
}

impl IntrinsicsState {
    pub fn new(base: Intrinsics) -> Self {
        let ndist = base.distortion.len();
        Self {
            base,
            focal_multiplier: DVector::from_element(1, 1.0),
            center_multiplier: DVector::from_element(2, 1.0),
            dist_multiplier: DVector::from_element(ndist, 1.0),
        }
    }

    pub fn multipliers_are_unit(&self) -> bool {
        let unit = |v: &DVector<Real>| v.iter().all(|s| *s == 1.0);
        unit(&self.focal_multiplier) && unit(&self.center_multiplier) && unit(&self.dist_multiplier)
    }

    /// Multiply the optimized multipliers into the base intrinsics and reset
    /// the multiplier vector to all ones.
    pub fn absorb(
        &mut self,
        focal: &DVector<Real>,
        center: &DVector<Real>,
        dist: Option<&DVector<Real>>,
    ) {
        self.base.focal *= focal[0];
        self.base.center.x *= center[0];
        self.base.center.y *= center[1];
        if let Some(dist) = dist {
            for (k, s) in self.base.distortion.iter_mut().zip(dist.iter()) {
                *k *= s;
            }
        }
        self.focal_multiplier.fill(1.0);
        self.center_multiplier.fill(1.0);
        self.dist_multiplier.fill(1.0);
    }

    /// Restore the multipliers to the unit state without absorbing.
    pub fn reset_multipliers(&mut self) {
        self.focal_multiplier.fill(1.0);
        self.center_multiplier.fill(1.0);
        self.dist_multiplier.fill(1.0);
    }
}

/// Groups to hold constant given the `intrinsics-to-float` selection.
///
/// An empty selection floats every group; names outside the three known
/// groups are ignored.
pub fn frozen_groups(to_float: &BTreeSet<String>) -> Vec<&'static str> {
    if to_float.is_empty() {
        return Vec::new();
    }
    [GROUP_FOCAL, GROUP_CENTER, GROUP_DISTORTION]
        .into_iter()
        .filter(|g| !to_float.contains(*g))
        .collect()
}
