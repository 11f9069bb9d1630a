//! The control network: world points and their per-camera pixel
//! observations.
//!
//! Iteration order is the contract here: every consumer that needs to match
//! the solver's residual layout walks cameras in index order and, within a
//! camera, observations in insertion order. Construction policies (minimum
//! camera count, triangulation gating) live in the pipeline crate.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::math::{Real, Vec2, Vec3};

/// Whether a world point is a free tie point or an anchored ground control
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointKind {
    Tie,
    Gcp,
}

/// A world point in ECEF meters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldPoint {
    pub xyz: Vec3,
    pub kind: PointKind,
    /// Per-axis standard deviations; meaningful for GCPs.
    pub sigma: Vec3,
}

/// A pixel observation of a world point in one camera.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Observation {
    pub point: usize,
    pub pixel: Vec2,
    pub sigma: Vec2,
}

/// All world points and observations for one adjustment problem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlNetwork {
    points: Vec<WorldPoint>,
    obs_per_camera: Vec<Vec<Observation>>,
    #[serde(skip)]
    seen_pairs: HashSet<(usize, usize)>,
}

impl ControlNetwork {
    pub fn new(num_cameras: usize) -> Self {
        Self {
            points: Vec::new(),
            obs_per_camera: vec![Vec::new(); num_cameras],
            seen_pairs: HashSet::new(),
        }
    }

    pub fn num_cameras(&self) -> usize {
        self.obs_per_camera.len()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn point(&self, p: usize) -> &WorldPoint {
        &self.points[p]
    }

    pub fn point_mut(&mut self, p: usize) -> &mut WorldPoint {
        &mut self.points[p]
    }

    pub fn points(&self) -> &[WorldPoint] {
        &self.points
    }

    pub fn is_gcp(&self, p: usize) -> bool {
        self.points[p].kind == PointKind::Gcp
    }

    /// Append a point and return its index.
    pub fn add_point(&mut self, xyz: Vec3, kind: PointKind, sigma: Vec3) -> usize {
        self.points.push(WorldPoint { xyz, kind, sigma });
        self.points.len() - 1
    }

    /// Record an observation. NaN pixel sigmas default to `(1, 1)`; a
    /// `(camera, point)` pair may appear at most once.
    pub fn add_observation(
        &mut self,
        camera: usize,
        point: usize,
        pixel: Vec2,
        sigma: Vec2,
    ) -> Result<()> {
        ensure!(
            camera < self.obs_per_camera.len(),
            "camera index {} out of bounds ({})",
            camera,
            self.obs_per_camera.len()
        );
        ensure!(
            point < self.points.len(),
            "point index {} out of bounds ({})",
            point,
            self.points.len()
        );
        ensure!(
            self.seen_pairs.insert((camera, point)),
            "duplicate observation of point {} in camera {}",
            point,
            camera
        );
        let sigma = if sigma.x.is_nan() || sigma.y.is_nan() {
            Vec2::new(1.0, 1.0)
        } else {
            sigma
        };
        self.obs_per_camera[camera].push(Observation {
            point,
            pixel,
            sigma,
        });
        Ok(())
    }

    /// Observations of one camera, in insertion order.
    pub fn observations_of(&self, camera: usize) -> &[Observation] {
        &self.obs_per_camera[camera]
    }

    /// Canonical double-loop iteration: cameras outer, observations inner.
    pub fn iter_observations(&self) -> impl Iterator<Item = (usize, &Observation)> {
        self.obs_per_camera
            .iter()
            .enumerate()
            .flat_map(|(cam, obs)| obs.iter().map(move |o| (cam, o)))
    }

    /// Number of cameras observing each point.
    pub fn observation_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.points.len()];
        for (_, obs) in self.iter_observations() {
            counts[obs.point] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_iteration_order() {
        let mut cnet = ControlNetwork::new(2);
        let p0 = cnet.add_point(Vec3::zeros(), PointKind::Tie, Vec3::zeros());
        let p1 = cnet.add_point(Vec3::zeros(), PointKind::Tie, Vec3::zeros());

        cnet.add_observation(1, p0, Vec2::new(1.0, 1.0), Vec2::new(1.0, 1.0))
            .unwrap();
        cnet.add_observation(0, p1, Vec2::new(2.0, 2.0), Vec2::new(1.0, 1.0))
            .unwrap();
        cnet.add_observation(0, p0, Vec2::new(3.0, 3.0), Vec2::new(1.0, 1.0))
            .unwrap();

        let order: Vec<(usize, usize)> = cnet
            .iter_observations()
            .map(|(cam, o)| (cam, o.point))
            .collect();
        assert_eq!(order, vec![(0, p1), (0, p0), (1, p0)]);
    }

    #[test]
    fn duplicate_pair_rejected() {
        let mut cnet = ControlNetwork::new(1);
        let p = cnet.add_point(Vec3::zeros(), PointKind::Tie, Vec3::zeros());
        cnet.add_observation(0, p, Vec2::zeros(), Vec2::new(1.0, 1.0))
            .unwrap();
        assert!(cnet
            .add_observation(0, p, Vec2::zeros(), Vec2::new(1.0, 1.0))
            .is_err());
    }

    #[test]
    fn nan_sigma_defaults_to_unit() {
        let mut cnet = ControlNetwork::new(1);
        let p = cnet.add_point(Vec3::zeros(), PointKind::Tie, Vec3::zeros());
        cnet.add_observation(0, p, Vec2::zeros(), Vec2::new(Real::NAN, 1.0))
            .unwrap();
        assert_eq!(cnet.observations_of(0)[0].sigma, Vec2::new(1.0, 1.0));
    }

    #[test]
    fn observation_counts_per_point() {
        let mut cnet = ControlNetwork::new(3);
        let p0 = cnet.add_point(Vec3::zeros(), PointKind::Tie, Vec3::zeros());
        let p1 = cnet.add_point(Vec3::zeros(), PointKind::Gcp, Vec3::new(1.0, 1.0, 1.0));
        for cam in 0..3 {
            cnet.add_observation(cam, p0, Vec2::zeros(), Vec2::new(1.0, 1.0))
                .unwrap();
        }
        cnet.add_observation(1, p1, Vec2::zeros(), Vec2::new(1.0, 1.0))
            .unwrap();
        assert_eq!(cnet.observation_counts(), vec![3, 1]);
    }
}
