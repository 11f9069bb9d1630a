//! Pre-solve alignment of pinhole cameras.
//!
//! Fits one similarity transform from camera-position hints or from GCPs
//! and applies it in place to every camera pose and every non-GCP world
//! point, so the network starts in the survey frame before optimization.

use anyhow::{ensure, Result};
use ba_core::{ControlNetwork, PinholeCamera, Real, Vec3};
use ba_linear::{fit_similarity, Similarity};
use log::{info, warn};

use crate::cnet_build::triangulate_point;

/// Apply a similarity to every camera and every non-GCP point.
pub fn apply_similarity(
    sim: &Similarity,
    cameras: &mut [PinholeCamera],
    cnet: &mut ControlNetwork,
) {
    for cam in cameras.iter_mut() {
        cam.apply_transform(sim.scale, &sim.rotation, &sim.translation);
    }
    for p in 0..cnet.num_points() {
        if cnet.is_gcp(p) {
            continue;
        }
        let point = cnet.point_mut(p);
        point.xyz = sim.apply(&point.xyz);
    }
}

/// Align cameras to externally estimated camera positions.
///
/// `hints[i]` is the ECEF position hint for camera `i`, when known. At
/// least three hinted cameras are required.
pub fn align_from_camera_positions(
    cameras: &mut [PinholeCamera],
    cnet: &mut ControlNetwork,
    hints: &[Option<Vec3>],
) -> Result<Similarity> {
    info!("initializing camera positions from the camera position file");
    ensure!(
        hints.len() == cameras.len(),
        "expected {} camera position hints, got {}",
        cameras.len(),
        hints.len()
    );

    let mut from = Vec::new();
    let mut to = Vec::new();
    for (cam, hint) in cameras.iter().zip(hints.iter()) {
        if let Some(xyz) = hint {
            from.push(cam.camera_center());
            to.push(*xyz);
        }
    }
    ensure!(
        from.len() >= 3,
        "at least 3 camera position matches are required to initialize the cameras, found {}",
        from.len()
    );

    let sim = fit_similarity(&from, &to)?;
    apply_similarity(&sim, cameras, cnet);
    Ok(sim)
}

/// Align cameras to the ground control points.
///
/// Each GCP is triangulated from the current cameras; pairs of
/// (triangulated, surveyed) positions feed the similarity fit. Points that
/// fail to triangulate are dropped silently, counted against the required
/// minimum of three.
pub fn align_from_gcp(
    cameras: &mut [PinholeCamera],
    cnet: &mut ControlNetwork,
) -> Result<Similarity> {
    info!("initializing camera positions from ground control points");

    let mut from = Vec::new();
    let mut to = Vec::new();
    for p in 0..cnet.num_points() {
        if !cnet.is_gcp(p) {
            continue;
        }
        let Some(predicted) = triangulate_point(cnet, p, cameras, 0.0) else {
            continue;
        };
        from.push(predicted);
        to.push(cnet.point(p).xyz);
    }
    ensure!(
        from.len() >= 3,
        "not enough valid GCPs for alignment: {} triangulated, need 3",
        from.len()
    );

    let sim = fit_similarity(&from, &to)?;
    apply_similarity(&sim, cameras, cnet);
    Ok(sim)
}

/// Warn when the mean GCP position sits far from the mean triangulated
/// tie-point position; the classic symptom of swapped lat/lon GCP columns.
pub fn check_gcp_dists(cameras: &[PinholeCamera], cnet: &ControlNetwork) {
    const WARN_DISTANCE_M: Real = 100_000.0;

    let mut gcp_sum = Vec3::zeros();
    let mut gcp_count = 0.0;
    let mut tie_sum = Vec3::zeros();
    let mut tie_count = 0.0;

    for p in 0..cnet.num_points() {
        if cnet.is_gcp(p) {
            gcp_sum += cnet.point(p).xyz;
            gcp_count += 1.0;
        } else if let Some(xyz) = triangulate_point(cnet, p, cameras, 0.0) {
            tie_sum += xyz;
            tie_count += 1.0;
        }
    }
    if gcp_count == 0.0 || tie_count == 0.0 {
        return;
    }

    let dist = (gcp_sum / gcp_count - tie_sum / tie_count).norm();
    if dist > WARN_DISTANCE_M {
        warn!(
            "GCPs are over 100 km from the other points. Are your lat/lon GCP coordinates swapped?"
        );
    }
}
