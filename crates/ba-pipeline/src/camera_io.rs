//! Pinhole camera files.
//!
//! A keyed text format, one `key = values` line each:
//!
//! ```text
//! focal = 1000
//! center = 500 500
//! position = x y z
//! rotation = rx ry rz
//! distortion = k1 k2
//! ```
//!
//! `rotation` is the axis-angle camera-to-world rotation; `distortion` is
//! optional.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use ba_core::{Extrinsics, Intrinsics, PinholeCamera, Real, Vec2, Vec3};

/// Read one camera file.
pub fn read_camera_file(path: &Path) -> Result<PinholeCamera> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read camera file {}", path.display()))?;

    let mut fields: BTreeMap<String, Vec<Real>> = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, rest)) = line.split_once('=') else {
            bail!(
                "{}:{}: expected 'key = values', got {:?}",
                path.display(),
                lineno + 1,
                line
            );
        };
        let values: Vec<Real> = rest
            .split_whitespace()
            .map(|t| {
                t.parse::<Real>().with_context(|| {
                    format!("{}:{}: bad number {:?}", path.display(), lineno + 1, t)
                })
            })
            .collect::<Result<_>>()?;
        fields.insert(key.trim().to_string(), values);
    }

    let take = |key: &str, len: usize| -> Result<Vec<Real>> {
        let values = fields
            .get(key)
            .with_context(|| format!("camera file {} is missing {:?}", path.display(), key))?;
        ensure!(
            values.len() == len,
            "camera file {}: {:?} needs {} values, got {}",
            path.display(),
            key,
            len,
            values.len()
        );
        Ok(values.clone())
    };

    let focal = take("focal", 1)?[0];
    let center = take("center", 2)?;
    let position = take("position", 3)?;
    let rotation = take("rotation", 3)?;
    let distortion = fields.get("distortion").cloned().unwrap_or_default();

    Ok(PinholeCamera::new(
        Extrinsics {
            center: Vec3::new(position[0], position[1], position[2]),
            axis_angle: Vec3::new(rotation[0], rotation[1], rotation[2]),
        },
        Intrinsics::new(focal, Vec2::new(center[0], center[1]), distortion),
    ))
}

/// Write one camera file.
pub fn write_camera_file(path: &Path, camera: &PinholeCamera) -> Result<()> {
    let e = &camera.extrinsics;
    let i = &camera.intrinsics;
    let mut text = format!(
        "focal = {}\ncenter = {} {}\nposition = {} {} {}\nrotation = {} {} {}\n",
        i.focal,
        i.center.x,
        i.center.y,
        e.center.x,
        e.center.y,
        e.center.z,
        e.axis_angle.x,
        e.axis_angle.y,
        e.axis_angle.z
    );
    if !i.distortion.is_empty() {
        text.push_str("distortion =");
        for k in &i.distortion {
            text.push_str(&format!(" {}", k));
        }
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cam = PinholeCamera::new(
            Extrinsics {
                center: Vec3::new(1.0, 2.0, 3.0),
                axis_angle: Vec3::new(0.1, -0.2, 0.3),
            },
            Intrinsics::new(900.0, Vec2::new(640.0, 480.0), vec![1e-4, -2e-6]),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.tsai");
        write_camera_file(&path, &cam).unwrap();
        let back = read_camera_file(&path).unwrap();
        assert_eq!(back, cam);
    }

    #[test]
    fn missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tsai");
        fs::write(&path, "focal = 900\ncenter = 1 2\n").unwrap();
        assert!(read_camera_file(&path).is_err());
    }

    #[test]
    fn distortion_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodist.tsai");
        fs::write(
            &path,
            "focal = 900\ncenter = 1 2\nposition = 0 0 0\nrotation = 0 0 0\n",
        )
        .unwrap();
        let cam = read_camera_file(&path).unwrap();
        assert!(cam.intrinsics.distortion.is_empty());
    }
}
