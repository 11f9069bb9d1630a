//! The pinhole camera model used by the adjustment engine.
//!
//! Extrinsics are stored as an ECEF optical center plus an axis-angle
//! camera-to-world rotation, which is also the flat 6-parameter layout the
//! optimizer sees. Intrinsics are a focal length, an optical center and a
//! variable-length vector of radial distortion coefficients; projection is
//! available generically over [`nalgebra::RealField`] so factors can be
//! driven with dual numbers.

use anyhow::{ensure, Result};
use nalgebra::{DVector, Matrix3, RealField, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::math::{Mat3, Pt3, Real, Vec2, Vec3};

/// Depth guard added before the perspective divide.
pub const PROJECTION_EPS: Real = 1.0e-12;

/// Camera pose: ECEF optical center and axis-angle camera-to-world rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extrinsics {
    pub center: Vec3,
    pub axis_angle: Vec3,
}

impl Extrinsics {
    /// Flat parameter layout `[cx, cy, cz, rx, ry, rz]`.
    pub fn to_dvec(&self) -> DVector<Real> {
        nalgebra::dvector![
            self.center.x,
            self.center.y,
            self.center.z,
            self.axis_angle.x,
            self.axis_angle.y,
            self.axis_angle.z
        ]
    }

    pub fn from_slice(v: &[Real]) -> Result<Self> {
        ensure!(v.len() == 6, "expected 6 extrinsic params, got {}", v.len());
        Ok(Self {
            center: Vec3::new(v[0], v[1], v[2]),
            axis_angle: Vec3::new(v[3], v[4], v[5]),
        })
    }

    /// Camera-to-world rotation matrix.
    pub fn rotation(&self) -> Mat3 {
        Rotation3::new(self.axis_angle).into_inner()
    }
}

/// Shared pinhole intrinsics: focal length, optical center, radial distortion.
///
/// The flat layout is `[f, cu, cv, k1, .., kD]`; the distortion vector may be
/// empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub focal: Real,
    pub center: Vec2,
    pub distortion: Vec<Real>,
    /// Fixed-point iterations used when undistorting.
    pub iters: usize,
}

impl Intrinsics {
    pub fn new(focal: Real, center: Vec2, distortion: Vec<Real>) -> Self {
        Self {
            focal,
            center,
            distortion,
            iters: 8,
        }
    }

    /// Total number of intrinsic parameters `1 + 2 + D`.
    pub fn num_params(&self) -> usize {
        3 + self.distortion.len()
    }

    pub fn to_dvec(&self) -> DVector<Real> {
        let mut v = Vec::with_capacity(self.num_params());
        v.push(self.focal);
        v.push(self.center.x);
        v.push(self.center.y);
        v.extend_from_slice(&self.distortion);
        DVector::from_vec(v)
    }

    pub fn from_slice(v: &[Real]) -> Result<Self> {
        ensure!(v.len() >= 3, "expected >= 3 intrinsic params, got {}", v.len());
        Ok(Self {
            focal: v[0],
            center: Vec2::new(v[1], v[2]),
            distortion: v[3..].to_vec(),
            iters: 8,
        })
    }

    /// Apply the radial distortion polynomial to normalized coordinates.
    pub fn distort(&self, n: Vec2) -> Vec2 {
        let r2 = n.norm_squared();
        let mut factor = 1.0;
        let mut rpow = r2;
        for k in &self.distortion {
            factor += k * rpow;
            rpow *= r2;
        }
        n * factor
    }

    /// Invert [`Self::distort`] by fixed-point iteration.
    pub fn undistort(&self, d: Vec2) -> Vec2 {
        let mut n = d;
        for _ in 0..self.iters {
            let r2 = n.norm_squared();
            let mut factor = 1.0;
            let mut rpow = r2;
            for k in &self.distortion {
                factor += k * rpow;
                rpow *= r2;
            }
            n = d / factor;
        }
        n
    }
}

/// A pinhole camera: pose plus shared intrinsics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    pub extrinsics: Extrinsics,
    pub intrinsics: Intrinsics,
}

impl PinholeCamera {
    pub fn new(extrinsics: Extrinsics, intrinsics: Intrinsics) -> Self {
        Self {
            extrinsics,
            intrinsics,
        }
    }

    pub fn camera_center(&self) -> Vec3 {
        self.extrinsics.center
    }

    /// Project an ECEF point; `None` when the point is at or behind the
    /// camera plane.
    pub fn project(&self, xyz: &Pt3) -> Option<Vec2> {
        let q = self.extrinsics.rotation().transpose() * (xyz.coords - self.extrinsics.center);
        if q.z <= PROJECTION_EPS {
            return None;
        }
        let n = Vec2::new(q.x / q.z, q.y / q.z);
        let d = self.intrinsics.distort(n);
        Some(d * self.intrinsics.focal + self.intrinsics.center)
    }

    /// Cast the unit ray through a pixel, in world coordinates.
    pub fn pixel_to_ray(&self, pix: Vec2) -> (Vec3, Vec3) {
        let n = (pix - self.intrinsics.center) / self.intrinsics.focal;
        let u = self.intrinsics.undistort(n);
        let dir_cam = Vector3::new(u.x, u.y, 1.0).normalize();
        let dir = self.extrinsics.rotation() * dir_cam;
        (self.extrinsics.center, dir)
    }

    /// Apply an ECEF similarity transform `x -> s R x + t` to the pose.
    pub fn apply_transform(&mut self, scale: Real, rotation: &Mat3, translation: &Vec3) {
        self.extrinsics.center = scale * rotation * self.extrinsics.center + translation;
        let new_rot = rotation * self.extrinsics.rotation();
        self.extrinsics.axis_angle = Rotation3::from_matrix(&new_rot).scaled_axis();
    }
}

/// Rodrigues rotation of `v` by axis-angle `aa`, generic for autodiff.
pub fn rotate_axis_angle<T: RealField>(aa: &Vector3<T>, v: &Vector3<T>) -> Vector3<T> {
    let theta2 = aa.norm_squared();
    let small = T::from_f64(1.0e-14).unwrap();
    if theta2 > small {
        let theta = theta2.sqrt();
        let axis = aa / theta.clone();
        let cos_t = theta.clone().cos();
        let sin_t = theta.sin();
        let cross = axis.cross(v);
        let dot = axis.dot(v);
        v * cos_t.clone() + cross * sin_t + axis * (dot * (T::one() - cos_t))
    } else {
        // First-order expansion near the identity keeps derivatives finite.
        v + aa.cross(v)
    }
}

/// Rotate `v` by the inverse of axis-angle `aa`.
pub fn rotate_axis_angle_inv<T: RealField>(aa: &Vector3<T>, v: &Vector3<T>) -> Vector3<T> {
    rotate_axis_angle(&(-aa), v)
}

/// Generic pinhole projection from flat parameter blocks.
///
/// `cam` is the 6-vector `[center, axis_angle]`; `focal`, `center_u/v` and
/// `distortion` are the (possibly multiplier-scaled) intrinsic values; `pw`
/// is the world point. Depth is guarded the same way as the `f64` path so
/// residuals stay finite for points near the camera plane.
pub fn project_generic<T: RealField>(
    cam: &DVector<T>,
    focal: T,
    center_u: T,
    center_v: T,
    distortion: &[T],
    pw: &Vector3<T>,
) -> Vector2<T> {
    debug_assert!(cam.len() == 6, "camera block must have 6 params");
    let c = Vector3::new(cam[0].clone(), cam[1].clone(), cam[2].clone());
    let aa = Vector3::new(cam[3].clone(), cam[4].clone(), cam[5].clone());

    let q = rotate_axis_angle_inv(&aa, &(pw - c));
    let eps = T::from_f64(PROJECTION_EPS).unwrap();
    let z = q.z.clone() + eps;
    let nx = q.x.clone() / z.clone();
    let ny = q.y.clone() / z;

    let r2 = nx.clone() * nx.clone() + ny.clone() * ny.clone();
    let mut factor = T::one();
    let mut rpow = r2.clone();
    for k in distortion {
        factor = factor + k.clone() * rpow.clone();
        rpow = rpow * r2.clone();
    }

    Vector2::new(
        nx * factor.clone() * focal.clone() + center_u,
        ny * factor * focal + center_v,
    )
}

/// Axis-angle rotation matrix, `f64` convenience wrapper.
pub fn axis_angle_matrix(aa: &Vec3) -> Matrix3<Real> {
    Rotation3::new(*aa).into_inner()
}
