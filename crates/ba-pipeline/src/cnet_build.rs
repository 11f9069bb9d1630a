//! Control network construction.
//!
//! Pairwise matches are merged into tracks; a track becomes a world point
//! only when it is observed in at least two distinct cameras and its rays
//! triangulate at no less than the minimum angle. GCPs are appended
//! afterwards from GCP files and may have zero matched observations.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ba_core::{ControlNetwork, Datum, PinholeCamera, PointKind, Real, Vec2, Vec3};
use ba_linear::triangulate_rays;
use log::{info, warn};

use crate::gcp::GcpRecord;
use crate::match_file::read_match_file;

/// Feature node identity: camera index plus the pixel's bit pattern.
type FeatureKey = (usize, u64, u64);

fn feature_key(cam: usize, pixel: Vec2) -> FeatureKey {
    (cam, pixel.x.to_bits(), pixel.y.to_bits())
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new() -> Self {
        Self { parent: Vec::new() }
    }

    fn make(&mut self) -> usize {
        self.parent.push(self.parent.len());
        self.parent.len() - 1
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Triangulate one network point from its current observations.
///
/// Returns `None` when the point has fewer than two observations or the
/// rays are more parallel than `min_angle_rad`.
pub fn triangulate_point(
    cnet: &ControlNetwork,
    point: usize,
    cameras: &[PinholeCamera],
    min_angle_rad: Real,
) -> Option<Vec3> {
    let mut rays = Vec::new();
    for (cam, obs) in cnet.iter_observations() {
        if obs.point == point {
            rays.push(cameras[cam].pixel_to_ray(obs.pixel));
        }
    }
    triangulate_rays(&rays, min_angle_rad).map(|p| p.coords)
}

/// Build the tie-point part of the control network from on-disk match
/// files.
///
/// Pairs with fewer than `min_matches` rows are skipped with a warning, as
/// are pairs whose match file fails to load. The network may come out empty;
/// the caller decides whether GCPs alone are enough to proceed.
pub fn build_control_network(
    cameras: &[PinholeCamera],
    match_files: &BTreeMap<(usize, usize), PathBuf>,
    min_matches: usize,
    min_triangulation_angle_deg: Real,
) -> Result<ControlNetwork> {
    let mut cnet = ControlNetwork::new(cameras.len());
    let min_angle_rad = min_triangulation_angle_deg.to_radians();

    let mut uf = UnionFind::new();
    let mut nodes: HashMap<FeatureKey, usize> = HashMap::new();
    let mut node_data: Vec<(usize, Vec2)> = Vec::new();

    let intern = |uf: &mut UnionFind,
                      nodes: &mut HashMap<FeatureKey, usize>,
                      node_data: &mut Vec<(usize, Vec2)>,
                      cam: usize,
                      pixel: Vec2| {
        *nodes.entry(feature_key(cam, pixel)).or_insert_with(|| {
            node_data.push((cam, pixel));
            uf.make()
        })
    };

    for ((left_cam, right_cam), path) in match_files {
        let (left, right) = match read_match_file(path) {
            Ok(lists) => lists,
            Err(err) => {
                warn!(
                    "could not read matches between cameras {} and {}: {:#}",
                    left_cam, right_cam, err
                );
                continue;
            }
        };
        if left.len() < min_matches {
            warn!(
                "skipping pair ({}, {}): only {} matches (min {})",
                left_cam,
                right_cam,
                left.len(),
                min_matches
            );
            continue;
        }
        for (l, r) in left.iter().zip(right.iter()) {
            let a = intern(&mut uf, &mut nodes, &mut node_data, *left_cam, l.pixel());
            let b = intern(&mut uf, &mut nodes, &mut node_data, *right_cam, r.pixel());
            uf.union(a, b);
        }
    }

    // Group features into tracks.
    let mut tracks: BTreeMap<usize, Vec<(usize, Vec2)>> = BTreeMap::new();
    for node in 0..node_data.len() {
        let root = uf.find(node);
        tracks.entry(root).or_default().push(node_data[node]);
    }

    let mut dropped_angle = 0usize;
    let mut dropped_conflict = 0usize;
    for track in tracks.values() {
        // A camera may contribute at most one feature per track.
        let mut per_camera: BTreeMap<usize, Vec2> = BTreeMap::new();
        let mut conflict = false;
        for (cam, pixel) in track {
            if per_camera.insert(*cam, *pixel).is_some() {
                conflict = true;
            }
        }
        if conflict {
            dropped_conflict += 1;
            continue;
        }
        if per_camera.len() < 2 {
            continue;
        }

        let rays: Vec<_> = per_camera
            .iter()
            .map(|(cam, pixel)| cameras[*cam].pixel_to_ray(*pixel))
            .collect();
        let Some(xyz) = triangulate_rays(&rays, min_angle_rad) else {
            dropped_angle += 1;
            continue;
        };

        let point = cnet.add_point(xyz.coords, PointKind::Tie, Vec3::zeros());
        for (cam, pixel) in per_camera {
            cnet.add_observation(cam, point, pixel, Vec2::new(1.0, 1.0))?;
        }
    }

    info!(
        "built control network: {} points ({} tracks dropped by angle, {} ambiguous)",
        cnet.num_points(),
        dropped_angle,
        dropped_conflict
    );
    Ok(cnet)
}

/// Append ground control points from parsed GCP records.
///
/// Measurements referencing unknown images are skipped with a warning; a
/// GCP with zero resolvable measurements is still added.
pub fn add_ground_control_points(
    cnet: &mut ControlNetwork,
    records: &[GcpRecord],
    images: &[String],
    datum: &Datum,
) -> Result<()> {
    for record in records {
        // File order is lat, lon; internal order is lon, lat.
        let llh = Vec3::new(
            record.lat_lon_height.y,
            record.lat_lon_height.x,
            record.lat_lon_height.z,
        );
        let xyz = datum.geodetic_to_cartesian(&llh);
        let point = cnet.add_point(xyz, PointKind::Gcp, record.sigma);

        for measure in &record.measures {
            let Some(cam) = images.iter().position(|img| img == &measure.image) else {
                warn!(
                    "GCP {} references unknown image {}; skipping that measure",
                    record.id, measure.image
                );
                continue;
            };
            cnet.add_observation(cam, point, measure.pixel, measure.sigma)?;
        }
    }
    Ok(())
}

/// Dump the control network in the GCP text format (lat-first, sigmas
/// clamped to at least 1 when unset).
pub fn save_cnet_as_csv(
    cnet: &ControlNetwork,
    datum: &Datum,
    images: &[String],
    path: &Path,
) -> Result<()> {
    let mut per_point_measures: Vec<Vec<(usize, Vec2, Vec2)>> = vec![Vec::new(); cnet.num_points()];
    for (cam, obs) in cnet.iter_observations() {
        per_point_measures[obs.point].push((cam, obs.pixel, obs.sigma));
    }

    let mut out = String::new();
    for (count, p) in (1..).zip(0..cnet.num_points()) {
        let point = cnet.point(p);
        let llh = datum.cartesian_to_geodetic(&point.xyz);
        let mut sigma = point.sigma;
        for i in 0..3 {
            if sigma[i] <= 0.0 {
                sigma[i] = 1.0;
            }
        }
        // lat, lon order on disk.
        out.push_str(&format!(
            "{} {} {} {} {} {} {}",
            count, llh.y, llh.x, llh.z, sigma.x, sigma.y, sigma.z
        ));
        for (cam, pixel, psigma) in &per_point_measures[p] {
            out.push_str(&format!(
                " {} {} {} {} {}",
                images[*cam], pixel.x, pixel.y, psigma.x, psigma.y
            ));
        }
        out.push('\n');
    }
    std::fs::write(path, out)
        .with_context(|| format!("failed to write control network csv {}", path.display()))?;
    info!("wrote control network to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_file::{write_match_file, MatchRecord};
    use ba_core::{Extrinsics, Intrinsics, Pt3};

    fn stereo_cameras() -> Vec<PinholeCamera> {
        let intr = Intrinsics::new(1000.0, Vec2::new(500.0, 500.0), vec![]);
        vec![
            PinholeCamera::new(
                Extrinsics {
                    center: Vec3::zeros(),
                    axis_angle: Vec3::zeros(),
                },
                intr.clone(),
            ),
            PinholeCamera::new(
                Extrinsics {
                    center: Vec3::new(1.0, 0.0, 0.0),
                    axis_angle: Vec3::zeros(),
                },
                intr,
            ),
        ]
    }

    fn write_pair_matches(
        dir: &Path,
        cameras: &[PinholeCamera],
        points: &[Vec3],
    ) -> BTreeMap<(usize, usize), PathBuf> {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for p in points {
            let lp = cameras[0].project(&Pt3::from(*p)).unwrap();
            let rp = cameras[1].project(&Pt3::from(*p)).unwrap();
            left.push(MatchRecord::from_pixel(lp));
            right.push(MatchRecord::from_pixel(rp));
        }
        let path = dir.join("pair01.match");
        write_match_file(&path, &left, &right).unwrap();
        BTreeMap::from([((0usize, 1usize), path)])
    }

    #[test]
    fn tracks_triangulate_to_world_points() {
        let cameras = stereo_cameras();
        let dir = tempfile::tempdir().unwrap();
        let points = vec![Vec3::new(0.5, 0.5, 10.0), Vec3::new(-0.2, 0.3, 12.0)];
        let matches = write_pair_matches(dir.path(), &cameras, &points);

        let cnet = build_control_network(&cameras, &matches, 1, 0.01).unwrap();
        assert_eq!(cnet.num_points(), 2);
        let recovered = cnet.point(0).xyz;
        assert!(
            points.iter().any(|p| (p - recovered).norm() < 1e-6),
            "unexpected point {:?}",
            recovered
        );
        // Both cameras observe both points.
        assert_eq!(cnet.observations_of(0).len(), 2);
        assert_eq!(cnet.observations_of(1).len(), 2);
    }

    #[test]
    fn sparse_pairs_are_skipped() {
        let cameras = stereo_cameras();
        let dir = tempfile::tempdir().unwrap();
        let matches =
            write_pair_matches(dir.path(), &cameras, &[Vec3::new(0.5, 0.5, 10.0)]);
        let cnet = build_control_network(&cameras, &matches, 10, 0.01).unwrap();
        assert_eq!(cnet.num_points(), 0);
    }

    #[test]
    fn gcp_records_become_anchored_points() {
        let datum = Datum::from_name("WGS_1984").unwrap();
        let mut cnet = ControlNetwork::new(2);
        let records = vec![GcpRecord {
            id: "1".to_string(),
            lat_lon_height: Vec3::new(45.0, 10.0, 100.0),
            sigma: Vec3::new(0.5, 0.5, 1.0),
            measures: vec![crate::gcp::GcpMeasure {
                image: "left.tif".to_string(),
                pixel: Vec2::new(10.0, 20.0),
                sigma: Vec2::new(1.0, 1.0),
            }],
        }];
        add_ground_control_points(
            &mut cnet,
            &records,
            &["left.tif".to_string(), "right.tif".to_string()],
            &datum,
        )
        .unwrap();

        assert_eq!(cnet.num_points(), 1);
        assert_eq!(cnet.point(0).kind, PointKind::Gcp);
        // Internal storage is lon-first.
        let llh = datum.cartesian_to_geodetic(&cnet.point(0).xyz);
        assert!((llh.x - 10.0).abs() < 1e-9);
        assert!((llh.y - 45.0).abs() < 1e-9);
        assert_eq!(cnet.observations_of(0).len(), 1);
    }

    #[test]
    fn single_camera_features_never_become_points() {
        // A match file pairing camera 0 with itself produces tracks seen by
        // one camera only; none may enter the network.
        let cameras = stereo_cameras();
        let dir = tempfile::tempdir().unwrap();
        let rec = MatchRecord::from_pixel(Vec2::new(10.0, 10.0));
        let other = MatchRecord::from_pixel(Vec2::new(20.0, 20.0));
        let path = dir.path().join("self.match");
        write_match_file(&path, &[rec], &[other]).unwrap();

        let matches = BTreeMap::from([((0usize, 0usize), path)]);
        let cnet = build_control_network(&cameras, &matches, 1, 0.01).unwrap();
        assert_eq!(cnet.num_points(), 0);
    }

    #[test]
    fn missing_match_file_is_skipped_not_fatal() {
        let cameras = stereo_cameras();
        let matches = BTreeMap::from([((0usize, 1usize), PathBuf::from("/nonexistent.match"))]);
        let cnet = build_control_network(&cameras, &matches, 1, 0.01).unwrap();
        assert_eq!(cnet.num_points(), 0);
    }
}
