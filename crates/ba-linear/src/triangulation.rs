//! Multi-ray triangulation of 3D points.
//!
//! Solves the least-squares intersection of the viewing rays and gates the
//! result on the maximum pairwise ray separation angle, so nearly parallel
//! ray bundles are rejected instead of producing points at infinity.

use ba_core::{Mat3, Pt3, Real, Vec3};
use nalgebra::Matrix3;

/// Intersect viewing rays `(origin, unit direction)` in a least-squares
/// sense.
///
/// Returns `None` when fewer than two rays are given, when every ray pair
/// subtends less than `min_angle_rad`, or when the normal system is
/// singular.
pub fn triangulate_rays(rays: &[(Vec3, Vec3)], min_angle_rad: Real) -> Option<Pt3> {
    if rays.len() < 2 {
        return None;
    }

    // Require at least one pair of rays with enough angular separation.
    let cos_limit = min_angle_rad.cos();
    let mut separated = false;
    'outer: for (i, (_, di)) in rays.iter().enumerate() {
        for (_, dj) in rays.iter().skip(i + 1) {
            if di.dot(dj).abs() < cos_limit {
                separated = true;
                break 'outer;
            }
        }
    }
    if !separated {
        return None;
    }

    // Minimize sum_i || (I - d_i d_i^T) (x - o_i) ||^2.
    let mut a = Mat3::zeros();
    let mut b = Vec3::zeros();
    for (origin, dir) in rays {
        let proj = Matrix3::identity() - dir * dir.transpose();
        a += proj;
        b += proj * origin;
    }

    a.lu().solve(&b).map(Pt3::from)
}
