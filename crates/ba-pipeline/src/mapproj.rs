//! The map-projection bridge.
//!
//! Matches made between map-projected images are moved back into native
//! camera pixel space: each map-projected pixel goes through its image
//! georeference to lon/lat, picks up a height from the DEM, becomes an ECEF
//! point and is projected into the native camera. A sibling workflow turns
//! map-image-to-DEM matches into a GCP file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use ba_core::{Datum, GeoTransform, GridRaster, PinholeCamera, Pt3, Real, Vec2, Vec3};
use log::{info, warn};

use crate::gcp::{GcpMeasure, GcpRecord};
use crate::match_file::{match_file_name, read_match_file, write_match_file, MatchRecord};

/// A map-projected image: its georeference and pixel extent, read from a
/// sidecar text file `x0 y0 dx dy cols rows`.
#[derive(Debug, Clone, Copy)]
pub struct MapImage {
    pub georef: GeoTransform,
    pub cols: usize,
    pub rows: usize,
}

impl MapImage {
    pub fn from_sidecar(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read georeference sidecar {}", path.display()))?;
        let values: Vec<Real> = text
            .split_whitespace()
            .map(|t| {
                t.parse::<Real>()
                    .with_context(|| format!("bad value {:?} in {}", t, path.display()))
            })
            .collect::<Result<_>>()?;
        ensure!(
            values.len() == 6,
            "georeference sidecar {} must have 6 values (x0 y0 dx dy cols rows)",
            path.display()
        );
        Ok(Self {
            georef: GeoTransform {
                x0: values[0],
                y0: values[1],
                dx: values[2],
                dy: values[3],
            },
            cols: values[4] as usize,
            rows: values[5] as usize,
        })
    }
}

/// Lift a map-projected pixel to ECEF through the DEM. `None` when the
/// pixel leaves the DEM or lands on nodata.
fn map_pixel_to_ecef(
    pixel: Vec2,
    map: &MapImage,
    dem: &GridRaster,
    datum: &Datum,
) -> Option<Vec3> {
    let ll = map.georef.pixel_to_lonlat(pixel);
    let height = dem.sample_lonlat(ll)?;
    Some(datum.geodetic_to_cartesian(&Vec3::new(ll.x, ll.y, height)))
}

/// Rewrite matches between map-projected image pairs into native-camera
/// pixel space.
///
/// `map_images[i]` is the map-projected counterpart of camera `i`;
/// `map_names[i]` its file name (for locating the input match files). The
/// re-projected matches are written under `out_prefix` for the native image
/// names. Pairs without a match file are skipped.
#[allow(clippy::too_many_arguments)]
pub fn create_matches_from_mapprojected(
    cameras: &[PinholeCamera],
    images: &[PathBuf],
    map_images: &[MapImage],
    map_names: &[PathBuf],
    dem: &GridRaster,
    datum: &Datum,
    out_prefix: &str,
) -> Result<()> {
    ensure!(
        cameras.len() == map_images.len(),
        "expecting as many input cameras as map-projected images ({} vs {})",
        cameras.len(),
        map_images.len()
    );

    for i in 0..cameras.len() {
        for j in (i + 1)..cameras.len() {
            let in_path = match_file_name(out_prefix, &map_names[i], &map_names[j]);
            if !in_path.exists() {
                warn!("missing map-projected match file {}", in_path.display());
                continue;
            }
            let (left, right) = read_match_file(&in_path)?;

            let mut left_cam = Vec::new();
            let mut right_cam = Vec::new();
            for (l, r) in left.iter().zip(right.iter()) {
                let Some(xyz1) = map_pixel_to_ecef(l.pixel(), &map_images[i], dem, datum) else {
                    continue;
                };
                let Some(pix1) = cameras[i].project(&Pt3::from(xyz1)) else {
                    continue;
                };
                let Some(xyz2) = map_pixel_to_ecef(r.pixel(), &map_images[j], dem, datum) else {
                    continue;
                };
                let Some(pix2) = cameras[j].project(&Pt3::from(xyz2)) else {
                    continue;
                };

                let mut l2 = l.clone();
                l2.x = pix1.x;
                l2.y = pix1.y;
                l2.ix = pix1.x.round() as i32;
                l2.iy = pix1.y.round() as i32;
                let mut r2 = r.clone();
                r2.x = pix2.x;
                r2.y = pix2.y;
                r2.ix = pix2.x.round() as i32;
                r2.iy = pix2.y.round() as i32;
                left_cam.push(l2);
                right_cam.push(r2);
            }

            let out_path = match_file_name(out_prefix, &images[i], &images[j]);
            info!(
                "saving {} re-projected matches to {}",
                left_cam.len(),
                out_path.display()
            );
            write_match_file(&out_path, &left_cam, &right_cam)?;
        }
    }
    Ok(())
}

/// Turn map-image-to-DEM matches into a GCP file, back-projecting each
/// matched DEM pixel into every native camera image.
///
/// The match file for image `i` pairs features in the map-projected image
/// with features in the DEM; every match file must list the same DEM
/// features in the same order.
#[allow(clippy::too_many_arguments)]
pub fn create_gcp_from_mapprojected(
    cameras: &[PinholeCamera],
    images: &[PathBuf],
    map_images: &[MapImage],
    map_names: &[PathBuf],
    dem_name: &Path,
    dem: &GridRaster,
    datum: &Datum,
    out_prefix: &str,
) -> Result<PathBuf> {
    ensure!(
        cameras.len() == map_images.len(),
        "expecting as many input cameras as map-projected images ({} vs {})",
        cameras.len(),
        map_images.len()
    );

    let mut image_feats: Vec<Vec<MatchRecord>> = Vec::new();
    let mut dem_feats: Option<Vec<MatchRecord>> = None;
    for map_name in map_names {
        let path = match_file_name(out_prefix, map_name, dem_name);
        let (ip1, ip2) = read_match_file(&path)
            .with_context(|| format!("missing map-to-DEM match file {}", path.display()))?;
        if let Some(prev) = &dem_feats {
            ensure!(
                prev.len() == ip2.len(),
                "all match files must have the same number of interest points"
            );
        }
        image_feats.push(ip1);
        dem_feats = Some(ip2);
    }
    let dem_feats = dem_feats.unwrap_or_default();

    let mut records = Vec::new();
    let mut cam_matches: Vec<Vec<MatchRecord>> = image_feats.clone();
    for (p, dem_ip) in dem_feats.iter().enumerate() {
        let dem_pixel = dem_ip.pixel();
        let ll = dem.georef.pixel_to_lonlat(dem_pixel);
        let Some(height) = dem.sample_pixel(dem_pixel) else {
            info!("skipping pixel outside of DEM: {:?}", dem_pixel);
            continue;
        };

        let mut record = GcpRecord {
            id: records.len().to_string(),
            // GCP files are lat-first.
            lat_lon_height: Vec3::new(ll.y, ll.x, height),
            sigma: Vec3::new(1.0, 1.0, 1.0),
            measures: Vec::new(),
        };

        for i in 0..cameras.len() {
            let ip = &image_feats[i][p];
            let Some(xyz) = map_pixel_to_ecef(ip.pixel(), &map_images[i], dem, datum) else {
                continue;
            };
            let Some(cam_pix) = cameras[i].project(&Pt3::from(xyz)) else {
                continue;
            };
            let mut adjusted = ip.clone();
            adjusted.x = cam_pix.x;
            adjusted.y = cam_pix.y;
            cam_matches[i][p] = adjusted;

            record.measures.push(GcpMeasure {
                image: images[i].to_string_lossy().into_owned(),
                pixel: cam_pix,
                sigma: Vec2::new(1.0, 1.0),
            });
        }
        records.push(record);
    }

    let stem = |p: &Path| {
        p.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    };
    let joined: Vec<String> = images.iter().map(|p| stem(p)).collect();
    let gcp_path = PathBuf::from(format!("{}-{}.gcp", out_prefix, joined.join("__")));
    info!("writing {}", gcp_path.display());
    crate::gcp::write_gcp_file(&gcp_path, &records)?;

    // Also emit native-frame match files, including the self pair, which is
    // useful with a single image.
    for i in 0..cameras.len() {
        for j in i..cameras.len() {
            let out_path = match_file_name(out_prefix, &images[i], &images[j]);
            write_match_file(&out_path, &cam_matches[i], &cam_matches[j])?;
        }
    }
    Ok(gcp_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ba_core::{Extrinsics, Intrinsics};

    fn flat_dem(height: Real) -> GridRaster {
        let georef = GeoTransform {
            x0: -0.05,
            y0: 0.05,
            dx: 0.001,
            dy: -0.001,
        };
        GridRaster::new(georef, 101, 101, -9999.0, vec![height; 101 * 101]).unwrap()
    }

    fn nadir_camera(datum: &Datum) -> PinholeCamera {
        // Above (0, 0) looking straight down the ECEF x-axis.
        let center = datum.geodetic_to_cartesian(&Vec3::new(0.0, 0.0, 500_000.0));
        // Camera +Z must point toward the planet: rotate +Z onto -X.
        let axis_angle = Vec3::new(0.0, -std::f64::consts::FRAC_PI_2, 0.0);
        PinholeCamera::new(
            Extrinsics {
                center,
                axis_angle,
            },
            Intrinsics::new(100_000.0, Vec2::new(2000.0, 2000.0), vec![]),
        )
    }

    #[test]
    fn bridge_roundtrip_hits_native_projection() {
        let datum = Datum::from_name("WGS_1984").unwrap();
        let dem = flat_dem(10.0);
        let cam = nadir_camera(&datum);
        let map = MapImage {
            georef: GeoTransform {
                x0: -0.05,
                y0: 0.05,
                dx: 0.001,
                dy: -0.001,
            },
            cols: 101,
            rows: 101,
        };

        // A pixel near the map center lifts through the DEM and projects
        // into the native camera; re-lifting the result reproduces the same
        // ECEF point by construction of the flat DEM.
        let map_pixel = Vec2::new(50.0, 50.0);
        let xyz = map_pixel_to_ecef(map_pixel, &map, &dem, &datum).unwrap();
        let native = cam.project(&Pt3::from(xyz)).unwrap();
        assert!(native.x.is_finite() && native.y.is_finite());

        let llh = datum.cartesian_to_geodetic(&xyz);
        assert!((llh.z - 10.0).abs() < 1e-6);
    }

    #[test]
    fn sidecar_parses_six_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map1.geo");
        fs::write(&path, "-0.05 0.05 0.001 -0.001 101 101\n").unwrap();
        let map = MapImage::from_sidecar(&path).unwrap();
        assert_eq!(map.cols, 101);
        assert!((map.georef.dy + 0.001).abs() < 1e-12);
    }

    #[test]
    fn bridge_rewrites_pair_matches() {
        let datum = Datum::from_name("WGS_1984").unwrap();
        let dem = flat_dem(0.0);
        let cams = vec![nadir_camera(&datum), nadir_camera(&datum)];
        let map = MapImage {
            georef: dem.georef,
            cols: 101,
            rows: 101,
        };

        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("run").to_string_lossy().into_owned();
        let map_names = vec![PathBuf::from("map_a.tif"), PathBuf::from("map_b.tif")];
        let images = vec![PathBuf::from("raw_a.tif"), PathBuf::from("raw_b.tif")];

        let recs = vec![
            MatchRecord::from_pixel(Vec2::new(40.0, 40.0)),
            MatchRecord::from_pixel(Vec2::new(60.0, 55.0)),
        ];
        write_match_file(
            &match_file_name(&prefix, &map_names[0], &map_names[1]),
            &recs,
            &recs,
        )
        .unwrap();

        create_matches_from_mapprojected(
            &cams, &images, &[map, map], &map_names, &dem, &datum, &prefix,
        )
        .unwrap();

        let (l, r) = read_match_file(&match_file_name(&prefix, &images[0], &images[1])).unwrap();
        assert_eq!(l.len(), 2);
        // Identical cameras and identical map pixels give identical
        // native projections on both sides.
        assert!((l[0].pixel() - r[0].pixel()).norm() < 1e-9);
    }
}
