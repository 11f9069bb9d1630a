//! Adjustment files and the initial-transform warm start.
//!
//! An adjustment file records a rigid pose delta per camera:
//!
//! ```text
//! tx ty tz
//! qw qx qy qz
//! ```
//!
//! The initial-transform file is a 4x4 row-major matrix applied to cameras
//! (and non-GCP points) as a scale + rotation + translation in ECEF.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use ba_core::{Mat3, PinholeCamera, Real, Vec3};
use ba_linear::Similarity;
use nalgebra::{Quaternion, Rotation3, UnitQuaternion};

/// Conventional adjustment file path for one image under a prefix.
pub fn adjustment_file_name(prefix: &str, image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    PathBuf::from(format!("{}-{}.adjust", prefix, stem))
}

/// Read one adjustment: `(translation, rotation)`.
pub fn read_adjustment(path: &Path) -> Result<(Vec3, UnitQuaternion<Real>)> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read adjustment {}", path.display()))?;
    let values: Vec<Real> = text
        .split_whitespace()
        .map(|t| {
            t.parse::<Real>()
                .with_context(|| format!("bad value {:?} in {}", t, path.display()))
        })
        .collect::<Result<_>>()?;
    ensure!(
        values.len() == 7,
        "adjustment {} must have 7 values (tx ty tz qw qx qy qz), got {}",
        path.display(),
        values.len()
    );
    let translation = Vec3::new(values[0], values[1], values[2]);
    let quat = Quaternion::new(values[3], values[4], values[5], values[6]);
    Ok((translation, UnitQuaternion::from_quaternion(quat)))
}

/// Write one adjustment.
pub fn write_adjustment(
    path: &Path,
    translation: &Vec3,
    rotation: &UnitQuaternion<Real>,
) -> Result<()> {
    let q = rotation.quaternion();
    let text = format!(
        "{} {} {}\n{} {} {} {}\n",
        translation.x, translation.y, translation.z, q.w, q.i, q.j, q.k
    );
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Apply an adjustment to a camera as a rigid transform about the origin.
pub fn apply_adjustment(
    camera: &mut PinholeCamera,
    translation: &Vec3,
    rotation: &UnitQuaternion<Real>,
) {
    camera.apply_transform(1.0, rotation.to_rotation_matrix().matrix(), translation);
}

/// The camera's pose expressed as an adjustment relative to `original`.
pub fn adjustment_between(
    original: &PinholeCamera,
    adjusted: &PinholeCamera,
) -> (Vec3, UnitQuaternion<Real>) {
    let r_orig = original.extrinsics.rotation();
    let r_adj = adjusted.extrinsics.rotation();
    let delta: Mat3 = r_adj * r_orig.transpose();
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&delta));
    let translation = adjusted.extrinsics.center - delta * original.extrinsics.center;
    (translation, rotation)
}

/// Read the 4x4 row-major initial transform and split it into
/// scale + rotation + translation.
pub fn read_initial_transform(path: &Path) -> Result<Similarity> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read initial transform {}", path.display()))?;
    let values: Vec<Real> = text
        .split_whitespace()
        .map(|t| {
            t.parse::<Real>()
                .with_context(|| format!("bad value {:?} in {}", t, path.display()))
        })
        .collect::<Result<_>>()?;
    ensure!(
        values.len() == 16,
        "initial transform {} must have 16 values, got {}",
        path.display(),
        values.len()
    );

    let m = Mat3::new(
        values[0], values[1], values[2], //
        values[4], values[5], values[6], //
        values[8], values[9], values[10],
    );
    let translation = Vec3::new(values[3], values[7], values[11]);
    let det = m.determinant();
    if det <= 0.0 {
        bail!(
            "initial transform {} has non-positive determinant {}",
            path.display(),
            det
        );
    }
    let scale = det.cbrt();
    Ok(Similarity {
        scale,
        rotation: m / scale,
        translation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ba_core::{Extrinsics, Intrinsics, Vec2};

    fn camera() -> PinholeCamera {
        PinholeCamera::new(
            Extrinsics {
                center: Vec3::new(100.0, 0.0, 0.0),
                axis_angle: Vec3::new(0.0, 0.1, 0.0),
            },
            Intrinsics::new(1000.0, Vec2::new(500.0, 500.0), vec![]),
        )
    }

    #[test]
    fn adjustment_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.adjust");
        let t = Vec3::new(1.0, -2.0, 3.0);
        let r = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        write_adjustment(&path, &t, &r).unwrap();
        let (rt, rr) = read_adjustment(&path).unwrap();
        assert!((rt - t).norm() < 1e-12);
        assert!(rr.angle_to(&r) < 1e-12);
    }

    #[test]
    fn adjustment_between_inverts_apply() {
        let original = camera();
        let mut adjusted = original.clone();
        let t = Vec3::new(5.0, 6.0, -7.0);
        let r = UnitQuaternion::from_euler_angles(0.05, -0.02, 0.2);
        apply_adjustment(&mut adjusted, &t, &r);

        let (rt, rr) = adjustment_between(&original, &adjusted);
        assert!((rt - t).norm() < 1e-6, "translation {:?}", rt);
        assert!(rr.angle_to(&r) < 1e-6);
    }

    #[test]
    fn initial_transform_decomposes_scale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transform.txt");
        // Scale 2 about Z-rotation by 90 degrees, translate by (1, 2, 3).
        fs::write(
            &path,
            "0 -2 0 1\n2 0 0 2\n0 0 2 3\n0 0 0 1\n",
        )
        .unwrap();
        let sim = read_initial_transform(&path).unwrap();
        assert!((sim.scale - 2.0).abs() < 1e-12);
        assert!((sim.apply(&Vec3::new(1.0, 0.0, 0.0)) - Vec3::new(1.0, 4.0, 3.0)).norm() < 1e-9);
    }

    #[test]
    fn malformed_transform_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        fs::write(&path, "1 0 0\n").unwrap();
        assert!(read_initial_transform(&path).is_err());
    }
}
