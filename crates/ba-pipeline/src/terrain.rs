//! Reference-terrain setup.
//!
//! Loads the trusted terrain (a DEM grid or a lon/lat/height point list),
//! pairs cameras `(2k, 2k+1)`, and keeps only the terrain points whose
//! left-image projection lands on a valid disparity sample and whose
//! disparity-transported pixel agrees with the right-camera projection
//! within `max-disp-error`.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use ba_core::{Datum, DisparityRaster, GridRaster, PinholeCamera, Pt3, Real, Vec2, Vec3};
use ba_optim::TerrainObservation;
use log::info;

use crate::options::BaOptions;

/// Load terrain points in ECEF. `.asc` grids yield one point per valid
/// cell; any other extension is read as `lon lat height` lines.
pub fn load_terrain_points(path: &Path, datum: &Datum, max_points: usize) -> Result<Vec<Vec3>> {
    let mut llh_points = Vec::new();
    if path.extension().map(|e| e == "asc").unwrap_or(false) {
        let dem = GridRaster::from_ascii_grid(path)?;
        for row in 0..dem.rows {
            for col in 0..dem.cols {
                if let Some(height) = dem.at(col as i64, row as i64) {
                    let ll = dem
                        .georef
                        .pixel_to_lonlat(Vec2::new(col as Real, row as Real));
                    llh_points.push(Vec3::new(ll.x, ll.y, height));
                }
            }
        }
    } else {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read reference terrain {}", path.display()))?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<Real> = line
                .split_whitespace()
                .map(|t| {
                    t.parse::<Real>().with_context(|| {
                        format!("{}:{}: bad value {:?}", path.display(), lineno + 1, t)
                    })
                })
                .collect::<Result<_>>()?;
            ensure!(
                fields.len() >= 3,
                "{}:{}: expected 'lon lat height'",
                path.display(),
                lineno + 1
            );
            llh_points.push(Vec3::new(fields[0], fields[1], fields[2]));
        }
    }

    // Uniform subsample down to the configured cap.
    let stride = (llh_points.len() / max_points.max(1)).max(1);
    let points: Vec<Vec3> = llh_points
        .iter()
        .step_by(stride)
        .map(|llh| datum.geodetic_to_cartesian(llh))
        .collect();
    info!(
        "loaded {} of {} reference terrain points from {}",
        points.len(),
        llh_points.len(),
        path.display()
    );
    Ok(points)
}

/// Build the terrain observations for the assembler.
///
/// Cameras pair up as `(0,1), (2,3), ...`; disparity `k` maps pair `k`.
pub fn collect_terrain_observations(
    terrain: &[Vec3],
    cameras: &[PinholeCamera],
    disparities: &[DisparityRaster],
    options: &BaOptions,
) -> Result<Vec<TerrainObservation>> {
    ensure!(
        cameras.len() % 2 == 0,
        "a reference terrain can only be used with an even number of cameras"
    );
    ensure!(
        2 * disparities.len() == cameras.len(),
        "expecting one disparity for each pair of images ({} disparities, {} cameras)",
        disparities.len(),
        cameras.len()
    );

    let mut observations = Vec::new();
    for xyz in terrain {
        for pair in 0..disparities.len() {
            let left = 2 * pair;
            let right = left + 1;
            let disp = &disparities[pair];

            let Some(left_pred) = cameras[left].project(&Pt3::from(*xyz)) else {
                continue;
            };
            if left_pred.x < 0.0
                || left_pred.y < 0.0
                || left_pred.x > (disp.cols() - 1) as Real
                || left_pred.y > (disp.rows() - 1) as Real
            {
                continue;
            }
            let Some(d) = disp.sample(left_pred) else {
                continue;
            };
            let Some(right_pred) = cameras[right].project(&Pt3::from(*xyz)) else {
                continue;
            };

            let transported = left_pred + d;
            if (transported - right_pred).norm() > options.max_disp_error {
                continue;
            }
            observations.push(TerrainObservation {
                xyz: *xyz,
                left,
                right,
                disparity: d,
            });
        }
    }
    info!("found {} reference points in range", observations.len());
    Ok(observations)
}
