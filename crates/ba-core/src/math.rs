//! Mathematical type definitions shared across the workspace.

use nalgebra::{Matrix3, Point2, Point3, Vector2, Vector3};

/// Scalar type used throughout the library (currently `f64`).
pub type Real = f64;

/// 2D vector with [`Real`] components.
pub type Vec2 = Vector2<Real>;
/// 3D vector with [`Real`] components.
pub type Vec3 = Vector3<Real>;
/// 2D point with [`Real`] coordinates.
pub type Pt2 = Point2<Real>;
/// 3D point with [`Real`] coordinates.
pub type Pt3 = Point3<Real>;
/// 3×3 matrix with [`Real`] entries.
pub type Mat3 = Matrix3<Real>;

/// Nearest-rank percentile of a sample, `pct` in `[0, 100]`.
///
/// Returns `None` for an empty sample. The input does not need to be sorted.
pub fn percentile(values: &[Real], pct: Real) -> Option<Real> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("NaN in percentile input"));
    let rank = (pct / 100.0 * (sorted.len() as Real - 1.0)).round() as usize;
    Some(sorted[rank.min(sorted.len() - 1)])
}
