//! Reference-terrain disparity residuals.

use ba_core::{Intrinsics, Vec2, Vec3};
use nalgebra::{DVector, RealField, Vector3};
use tiny_solver::factors::Factor;

use super::reprojection::ReprojectionFactor;
use ba_core::camera::project_generic;

/// Ties a stereo pair to a trusted terrain point through a precomputed
/// left-to-right disparity.
///
/// The residual is `right_proj(xyz) - left_proj(xyz) - disparity`, where the
/// disparity was sampled at the left projection when the problem was
/// assembled (a raster lookup cannot be evaluated on dual numbers, so it is
/// frozen at the linearization point).
///
/// Parameter blocks: `[left_camera(6), right_camera(6)]`, extended by the
/// intrinsic multiplier blocks exactly like [`ReprojectionFactor`].
#[derive(Debug, Clone)]
pub struct DisparityFactor {
    pub xyz: Vec3,
    pub disparity: Vec2,
    pub intrinsics: Intrinsics,
    pub solve_intrinsics: bool,
}

impl DisparityFactor {
    pub fn num_param_blocks(&self) -> usize {
        if !self.solve_intrinsics {
            2
        } else if self.intrinsics.distortion.is_empty() {
            4
        } else {
            5
        }
    }
}

impl<T: RealField> Factor<T> for DisparityFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), self.num_param_blocks());
        let left = &params[0];
        let right = &params[1];
        let pw = Vector3::new(
            T::from_f64(self.xyz.x).unwrap(),
            T::from_f64(self.xyz.y).unwrap(),
            T::from_f64(self.xyz.z).unwrap(),
        );

        // The intrinsic multiplier blocks sit at the same offsets as in the
        // reprojection factor (indices 2..).
        let (focal, cu, cv, dist) =
            ReprojectionFactor::scaled_intrinsics(&self.intrinsics, self.solve_intrinsics, params);

        let left_pred = project_generic(
            left,
            focal.clone(),
            cu.clone(),
            cv.clone(),
            &dist,
            &pw,
        );
        let right_pred = project_generic(right, focal, cu, cv, &dist, &pw);

        let dx = T::from_f64(self.disparity.x).unwrap();
        let dy = T::from_f64(self.disparity.y).unwrap();
        nalgebra::dvector![
            right_pred.x.clone() - left_pred.x.clone() - dx,
            right_pred.y.clone() - left_pred.y.clone() - dy
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ba_core::{Extrinsics, PinholeCamera, Pt3};

    #[test]
    fn zero_residual_for_consistent_disparity() {
        let intr = Intrinsics::new(1000.0, Vec2::new(500.0, 500.0), vec![]);
        let left = PinholeCamera::new(
            Extrinsics {
                center: Vec3::zeros(),
                axis_angle: Vec3::zeros(),
            },
            intr.clone(),
        );
        let right = PinholeCamera::new(
            Extrinsics {
                center: Vec3::new(1.0, 0.0, 0.0),
                axis_angle: Vec3::zeros(),
            },
            intr.clone(),
        );

        let xyz = Vec3::new(0.2, 0.4, 25.0);
        let lp = left.project(&Pt3::from(xyz)).unwrap();
        let rp = right.project(&Pt3::from(xyz)).unwrap();

        let factor = DisparityFactor {
            xyz,
            disparity: rp - lp,
            intrinsics: intr,
            solve_intrinsics: false,
        };
        let r = factor.residual_func(&[
            left.extrinsics.to_dvec(),
            right.extrinsics.to_dvec(),
        ]);
        assert!(r.norm() < 1e-9, "residual {:?}", r);
    }
}
