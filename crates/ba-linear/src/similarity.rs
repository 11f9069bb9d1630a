//! Closed-form similarity transform fitting (Umeyama's method).
//!
//! Recovers the `x -> s R x + t` transform mapping a "from" point set onto a
//! "to" point set in the least-squares sense. Used to bootstrap pinhole
//! cameras from camera-position hints or ground control points.

use anyhow::{ensure, Result};
use ba_core::{Mat3, Real, Vec3};
use nalgebra::Matrix3;

/// A scale + rotation + translation transform in ECEF.
#[derive(Debug, Clone, PartialEq)]
pub struct Similarity {
    pub scale: Real,
    pub rotation: Mat3,
    pub translation: Vec3,
}

impl Similarity {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: Mat3::identity(),
            translation: Vec3::zeros(),
        }
    }

    pub fn apply(&self, p: &Vec3) -> Vec3 {
        self.scale * self.rotation * p + self.translation
    }
}

/// Fit `(s, R, t)` so that `s R from[i] + t ~= to[i]` (Umeyama, 1991).
///
/// Requires at least three non-degenerate correspondences.
pub fn fit_similarity(from: &[Vec3], to: &[Vec3]) -> Result<Similarity> {
    ensure!(
        from.len() == to.len(),
        "point set sizes differ: {} vs {}",
        from.len(),
        to.len()
    );
    ensure!(
        from.len() >= 3,
        "need at least 3 correspondences to fit a similarity, got {}",
        from.len()
    );

    let n = from.len() as Real;
    let mean_from = from.iter().sum::<Vec3>() / n;
    let mean_to = to.iter().sum::<Vec3>() / n;

    let mut sigma = Mat3::zeros();
    let mut var_from = 0.0;
    for (f, t) in from.iter().zip(to.iter()) {
        let df = f - mean_from;
        let dt = t - mean_to;
        sigma += dt * df.transpose();
        var_from += df.norm_squared();
    }
    sigma /= n;
    var_from /= n;
    ensure!(var_from > 0.0, "degenerate source point set");

    let svd = sigma.svd(true, true);
    let u = svd.u.ok_or_else(|| anyhow::anyhow!("SVD failed in similarity fit"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow::anyhow!("SVD failed in similarity fit"))?;

    // Reflection guard: force det(R) = +1.
    let mut s_diag = Matrix3::identity();
    if (u.determinant() * v_t.determinant()) < 0.0 {
        s_diag[(2, 2)] = -1.0;
    }

    let rotation = u * s_diag * v_t;
    let trace_ds = svd.singular_values[0]
        + svd.singular_values[1]
        + svd.singular_values[2] * s_diag[(2, 2)];
    let scale = trace_ds / var_from;
    let translation = mean_to - scale * rotation * mean_from;

    Ok(Similarity {
        scale,
        rotation,
        translation,
    })
}
