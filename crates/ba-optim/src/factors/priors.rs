//! Anchor residuals: GCP positions and camera priors.

use ba_core::datum::cartesian_to_geodetic_generic;
use ba_core::{Real, Vec3};
use nalgebra::{DVector, RealField, Vector3};
use tiny_solver::factors::Factor;

/// GCP position residual `(point - surveyed) / sigma`, per ECEF axis.
///
/// Parameter blocks: `[point(3)]`.
#[derive(Debug, Clone)]
pub struct GcpXyzFactor {
    pub observation: Vec3,
    pub sigma: Vec3,
}

impl<T: RealField> Factor<T> for GcpXyzFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 1);
        let pt = &params[0];
        let mut r = DVector::zeros(3);
        for i in 0..3 {
            let obs = T::from_f64(self.observation[i]).unwrap();
            let sigma = T::from_f64(self.sigma[i]).unwrap();
            r[i] = (pt[i].clone() - obs) / sigma;
        }
        r
    }
}

/// GCP residual in geodetic coordinates: the point is converted to
/// `(lon, lat, height)` and compared against the surveyed geodetic position,
/// with the file's `(sigma_lat, sigma_lon, sigma_h)` reinterpreted in
/// lon/lat/height order.
///
/// Parameter blocks: `[point(3)]`.
#[derive(Debug, Clone)]
pub struct GcpLlhFactor {
    /// Surveyed position as `(lon_deg, lat_deg, height)`.
    pub observation_llh: Vec3,
    /// Sigmas in lon/lat/height order.
    pub sigma: Vec3,
    pub semi_major: Real,
    pub semi_minor: Real,
}

impl<T: RealField> Factor<T> for GcpLlhFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 1);
        let pt = &params[0];
        let llh = cartesian_to_geodetic_generic(
            self.semi_major,
            self.semi_minor,
            pt[0].clone(),
            pt[1].clone(),
            pt[2].clone(),
        );
        let mut r = DVector::zeros(3);
        for i in 0..3 {
            let obs = T::from_f64(self.observation_llh[i]).unwrap();
            let sigma = T::from_f64(self.sigma[i]).unwrap();
            r[i] = (llh[i].clone() - obs) / sigma;
        }
        r
    }
}

/// Uniform camera prior `(camera - original) * weight` over all six
/// extrinsic parameters.
///
/// Parameter blocks: `[camera(6)]`.
#[derive(Debug, Clone)]
pub struct CameraPriorFactor {
    pub original: DVector<Real>,
    pub weight: Real,
}

impl<T: RealField> Factor<T> for CameraPriorFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 1);
        let cam = &params[0];
        let w = T::from_f64(self.weight).unwrap();
        let mut r = DVector::zeros(6);
        for i in 0..6 {
            let orig = T::from_f64(self.original[i]).unwrap();
            r[i] = (cam[i].clone() - orig) * w.clone();
        }
        r
    }
}

/// Split camera prior: the translation half weighted by
/// `translation_weight`, the rotation half by `rotation_weight`.
///
/// Parameter blocks: `[camera(6)]`.
#[derive(Debug, Clone)]
pub struct PosePriorFactor {
    pub original: DVector<Real>,
    pub rotation_weight: Real,
    pub translation_weight: Real,
}

impl<T: RealField> Factor<T> for PosePriorFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 1);
        let cam = &params[0];
        let tw = T::from_f64(self.translation_weight).unwrap();
        let rw = T::from_f64(self.rotation_weight).unwrap();
        let mut r = DVector::zeros(6);
        for i in 0..3 {
            let orig = T::from_f64(self.original[i]).unwrap();
            r[i] = (cam[i].clone() - orig) * tw.clone();
        }
        for i in 3..6 {
            let orig = T::from_f64(self.original[i]).unwrap();
            r[i] = (cam[i].clone() - orig) * rw.clone();
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ba_core::Datum;

    #[test]
    fn gcp_xyz_residual_is_sigma_scaled() {
        let factor = GcpXyzFactor {
            observation: Vec3::new(10.0, 20.0, 30.0),
            sigma: Vec3::new(2.0, 2.0, 2.0),
        };
        let r = factor.residual_func(&[DVector::<f64>::from_vec(vec![12.0, 20.0, 30.0])]);
        assert!((r[0] - 1.0).abs() < 1e-12);
        assert!(r[1].abs() < 1e-12);
    }

    #[test]
    fn gcp_llh_zero_at_surveyed_position() {
        let datum = Datum::from_name("WGS_1984").unwrap();
        let llh = Vec3::new(30.0, 45.0, 100.0);
        let xyz = datum.geodetic_to_cartesian(&llh);
        let factor = GcpLlhFactor {
            observation_llh: llh,
            sigma: Vec3::new(1.0, 1.0, 1.0),
            semi_major: datum.semi_major,
            semi_minor: datum.semi_minor,
        };
        let r = factor.residual_func(&[DVector::from_vec(vec![xyz.x, xyz.y, xyz.z])]);
        assert!(r.norm() < 1e-6, "residual {:?}", r);
    }

    #[test]
    fn camera_prior_scales_all_params() {
        let orig = DVector::<f64>::from_vec(vec![0.0; 6]);
        let factor = CameraPriorFactor {
            original: orig,
            weight: 3.0,
        };
        let cam: DVector<f64> = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 2.0]);
        let r = factor.residual_func(&[cam]);
        assert!((r[0] - 3.0).abs() < 1e-12);
        assert!((r[5] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn pose_prior_splits_halves() {
        let factor = PosePriorFactor {
            original: DVector::from_vec(vec![0.0; 6]),
            rotation_weight: 10.0,
            translation_weight: 0.5,
        };
        let cam: DVector<f64> = DVector::from_vec(vec![2.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let r = factor.residual_func(&[cam]);
        assert!((r[0] - 1.0).abs() < 1e-12);
        assert!((r[5] - 10.0).abs() < 1e-12);
    }
}
