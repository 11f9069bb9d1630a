//! Pixel reprojection residuals.

use ba_core::camera::project_generic;
use ba_core::{Intrinsics, Vec2};
use nalgebra::{DVector, RealField, Vector3};
use tiny_solver::factors::Factor;

/// Reprojection residual `(P(camera, point) - observation) / sigma`.
///
/// Parameter blocks: `[camera(6), point(3)]`, extended by the intrinsic
/// multiplier blocks `[focal(1), center(2), distortion(D)]` when intrinsics
/// are being solved (the distortion block is omitted when `D == 0`). The
/// factor holds the absorbed intrinsic base values; the multiplier blocks
/// scale them.
#[derive(Debug, Clone)]
pub struct ReprojectionFactor {
    pub observation: Vec2,
    pub sigma: Vec2,
    pub intrinsics: Intrinsics,
    pub solve_intrinsics: bool,
}

impl ReprojectionFactor {
    /// Number of parameter blocks this factor binds.
    pub fn num_param_blocks(&self) -> usize {
        if !self.solve_intrinsics {
            2
        } else if self.intrinsics.distortion.is_empty() {
            4
        } else {
            5
        }
    }

    pub(crate) fn scaled_intrinsics<T: RealField>(
        intrinsics: &Intrinsics,
        solve_intrinsics: bool,
        params: &[DVector<T>],
    ) -> (T, T, T, Vec<T>) {
        if solve_intrinsics {
            let focal = T::from_f64(intrinsics.focal).unwrap() * params[2][0].clone();
            let cu = T::from_f64(intrinsics.center.x).unwrap() * params[3][0].clone();
            let cv = T::from_f64(intrinsics.center.y).unwrap() * params[3][1].clone();
            let dist = intrinsics
                .distortion
                .iter()
                .enumerate()
                .map(|(i, k)| T::from_f64(*k).unwrap() * params[4][i].clone())
                .collect();
            (focal, cu, cv, dist)
        } else {
            let focal = T::from_f64(intrinsics.focal).unwrap();
            let cu = T::from_f64(intrinsics.center.x).unwrap();
            let cv = T::from_f64(intrinsics.center.y).unwrap();
            let dist = intrinsics
                .distortion
                .iter()
                .map(|k| T::from_f64(*k).unwrap())
                .collect();
            (focal, cu, cv, dist)
        }
    }
}

impl<T: RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), self.num_param_blocks());
        let cam = &params[0];
        let pt = &params[1];
        let pw = Vector3::new(pt[0].clone(), pt[1].clone(), pt[2].clone());

        let (focal, cu, cv, dist) =
            Self::scaled_intrinsics(&self.intrinsics, self.solve_intrinsics, params);
        let pred = project_generic(cam, focal, cu, cv, &dist, &pw);

        let su = T::from_f64(self.sigma.x).unwrap();
        let sv = T::from_f64(self.sigma.y).unwrap();
        let u = T::from_f64(self.observation.x).unwrap();
        let v = T::from_f64(self.observation.y).unwrap();
        nalgebra::dvector![(pred.x.clone() - u) / su, (pred.y.clone() - v) / sv]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ba_core::{Extrinsics, PinholeCamera, Pt3, Vec3};

    fn camera() -> PinholeCamera {
        PinholeCamera::new(
            Extrinsics {
                center: Vec3::new(0.0, 0.0, 0.0),
                axis_angle: Vec3::new(0.01, -0.02, 0.03),
            },
            Intrinsics::new(1200.0, Vec2::new(640.0, 480.0), vec![1e-5]),
        )
    }

    #[test]
    fn zero_residual_at_true_projection() {
        let cam = camera();
        let pw = Pt3::new(0.4, -0.2, 20.0);
        let obs = cam.project(&pw).unwrap();

        let factor = ReprojectionFactor {
            observation: obs,
            sigma: Vec2::new(1.0, 1.0),
            intrinsics: cam.intrinsics.clone(),
            solve_intrinsics: false,
        };
        let r = factor.residual_func(&[cam.extrinsics.to_dvec(), DVector::from_vec(vec![
            pw.x, pw.y, pw.z,
        ])]);
        assert!(r.norm() < 1e-9, "residual {:?}", r);
    }

    #[test]
    fn sigma_scales_residual() {
        let cam = camera();
        let pw = Pt3::new(0.4, -0.2, 20.0);
        let obs = cam.project(&pw).unwrap() + Vec2::new(2.0, 0.0);

        let factor = ReprojectionFactor {
            observation: obs,
            sigma: Vec2::new(2.0, 2.0),
            intrinsics: cam.intrinsics.clone(),
            solve_intrinsics: false,
        };
        let r = factor.residual_func(&[cam.extrinsics.to_dvec(), DVector::from_vec(vec![
            pw.x, pw.y, pw.z,
        ])]);
        assert!((r[0] - (-1.0)).abs() < 1e-9, "residual {:?}", r);
    }

    #[test]
    fn unit_multipliers_match_plain_projection() {
        let cam = camera();
        let pw = Pt3::new(0.4, -0.2, 20.0);
        let obs = cam.project(&pw).unwrap();

        let factor = ReprojectionFactor {
            observation: obs,
            sigma: Vec2::new(1.0, 1.0),
            intrinsics: cam.intrinsics.clone(),
            solve_intrinsics: true,
        };
        let r = factor.residual_func(&[
            cam.extrinsics.to_dvec(),
            DVector::from_vec(vec![pw.x, pw.y, pw.z]),
            DVector::from_vec(vec![1.0]),
            DVector::from_vec(vec![1.0, 1.0]),
            DVector::from_vec(vec![1.0]),
        ]);
        assert!(r.norm() < 1e-9, "residual {:?}", r);
    }

    #[test]
    fn focal_multiplier_changes_prediction() {
        let cam = camera();
        let pw = Pt3::new(0.4, -0.2, 20.0);
        let obs = cam.project(&pw).unwrap();

        let factor = ReprojectionFactor {
            observation: obs,
            sigma: Vec2::new(1.0, 1.0),
            intrinsics: cam.intrinsics.clone(),
            solve_intrinsics: true,
        };
        let r = factor.residual_func(&[
            cam.extrinsics.to_dvec(),
            DVector::from_vec(vec![pw.x, pw.y, pw.z]),
            DVector::from_vec(vec![1.1]),
            DVector::from_vec(vec![1.0, 1.0]),
            DVector::from_vec(vec![1.0]),
        ]);
        assert!(r.norm() > 0.1, "residual {:?}", r);
    }
}
