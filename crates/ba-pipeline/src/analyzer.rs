//! Post-solve residual analysis.
//!
//! Decodes the flat residual vector by walking the residual schedule in the
//! exact order the assembler produced it, then writes the residual log
//! files and the pointmap CSV. Invoked with and without the robust loss
//! applied, before and after each optimization.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{ensure, Result};
use ba_core::{ControlNetwork, Datum, Real, Vec3};
use ba_optim::{point_key, Assembly, ResidualKind};
use log::{info, warn};
use nalgebra::DVector;

/// Shared inputs for one analyzer invocation.
pub struct AnalyzerContext<'a> {
    pub assembly: &'a Assembly,
    pub cnet: &'a ControlNetwork,
    pub camera_names: &'a [String],
    pub datum: Option<&'a Datum>,
    pub outliers: &'a BTreeSet<usize>,
}

/// Mean reprojection residual per point and observation count, decoded from
/// a flat residual vector. Outlier points carry no count and a NaN mean.
pub fn mean_point_residuals(
    assembly: &Assembly,
    flat: &[Real],
    num_points: usize,
    outliers: &BTreeSet<usize>,
) -> (Vec<Real>, Vec<Option<usize>>) {
    let mut sums = vec![0.0; num_points];
    let mut counts = vec![0usize; num_points];

    let mut offset = 0usize;
    for entry in &assembly.schedule.entries {
        let dim = entry.dim();
        if let ResidualKind::Reprojection { point, .. } = entry.kind {
            let ex = flat[offset];
            let ey = flat[offset + 1];
            sums[point] += (ex.abs() + ey.abs()) / 2.0;
            counts[point] += 1;
        }
        offset += dim;
    }

    let mut means = vec![Real::NAN; num_points];
    let mut obs = vec![None; num_points];
    for p in 0..num_points {
        if outliers.contains(&p) {
            continue;
        }
        obs[p] = Some(counts[p]);
        if counts[p] > 0 {
            means[p] = sums[p] / counts[p] as Real;
        }
    }
    (means, obs)
}

/// Write the residual log family for one prefix: `_averages.txt`,
/// `_raw_pixels.txt`, `_raw_gcp.txt`, `_raw_cameras.txt`,
/// `_reference_terrain.txt` and `_pointmap.csv`.
pub fn write_residual_logs(
    ctx: &AnalyzerContext<'_>,
    prefix: &Path,
    apply_loss: bool,
    state: &HashMap<String, DVector<Real>>,
) -> Result<()> {
    let flat = ctx.assembly.schedule.evaluate(state, apply_loss)?;
    let num_cameras = ctx.cnet.num_cameras();

    // Decode the flat vector in schedule order.
    let mut pixel_rows: Vec<Vec<(Real, Real)>> = vec![Vec::new(); num_cameras];
    let mut terrain_rows: Vec<(Vec3, Real)> = Vec::new();
    let mut gcp_rows: Vec<(usize, [Real; 3])> = Vec::new();
    let mut prior_rows: Vec<(usize, [Real; 6])> = Vec::new();

    let mut offset = 0usize;
    for entry in &ctx.assembly.schedule.entries {
        let dim = entry.dim();
        match entry.kind {
            ResidualKind::Reprojection { camera, .. } => {
                pixel_rows[camera].push((flat[offset], flat[offset + 1]));
            }
            ResidualKind::TerrainDisparity { terrain, .. } => {
                let err = (flat[offset].powi(2) + flat[offset + 1].powi(2)).sqrt();
                terrain_rows.push((ctx.assembly.terrain_points[terrain], err));
            }
            ResidualKind::GcpPosition { point } => {
                gcp_rows.push((point, [flat[offset], flat[offset + 1], flat[offset + 2]]));
            }
            ResidualKind::CameraPrior { camera } | ResidualKind::PosePrior { camera } => {
                let mut row = [0.0; 6];
                row.copy_from_slice(&flat[offset..offset + 6]);
                prior_rows.push((camera, row));
            }
        }
        offset += dim;
    }
    ensure!(
        offset == flat.len(),
        "decoded {} residual rows but the vector has {}",
        offset,
        flat.len()
    );

    let path = |suffix: &str| {
        let mut s = prefix.as_os_str().to_os_string();
        s.push(suffix);
        std::path::PathBuf::from(s)
    };

    // Summary file plus the raw per-kind files.
    let mut averages = String::new();
    let mut raw_pixels = String::new();

    averages.push_str("Mean residual error and point count for cameras:\n");
    for cam in 0..num_cameras {
        let rows = &pixel_rows[cam];
        let name = &ctx.camera_names[cam];
        writeln!(raw_pixels, "{}, {}", name, rows.len())?;
        let mut mean = 0.0;
        for (ex, ey) in rows {
            mean += ex.abs() + ey.abs();
            writeln!(raw_pixels, "{}, {}", ex, ey)?;
        }
        if !rows.is_empty() {
            mean /= rows.len() as Real;
        }
        writeln!(averages, "{}, {}, {}", name, mean, rows.len())?;
    }

    let mut raw_gcp = String::new();
    if !gcp_rows.is_empty() {
        averages.push_str("GCP residual errors:\n");
        for (i, (_, row)) in gcp_rows.iter().enumerate() {
            let mean = row.iter().map(|v| v.abs()).sum::<Real>() / 3.0;
            writeln!(averages, "{}, {}", i, mean)?;
            writeln!(raw_gcp, "{}, {}, {}, {}", i, row[0], row[1], row[2])?;
        }
    }

    let mut raw_cams = String::new();
    for (camera, row) in &prior_rows {
        let name = &ctx.camera_names[*camera];
        let mean_pos = row[..3].iter().map(|v| v.abs()).sum::<Real>() / 3.0;
        let mean_rot = row[3..].iter().map(|v| v.abs()).sum::<Real>() / 3.0;
        if *camera == 0 {
            averages.push_str("Camera weight position and orientation residual errors:\n");
        }
        writeln!(averages, "{}, {}, {}", name, mean_pos, mean_rot)?;
        write!(raw_cams, "{}", name)?;
        for v in row {
            write!(raw_cams, ", {}", v)?;
        }
        raw_cams.push('\n');
    }

    if !terrain_rows.is_empty() {
        match ctx.datum {
            Some(datum) => {
                let mut reference =
                    String::from("# lon, lat, height_above_datum, pixel_error_norm\n");
                averages.push_str("reference terrain residual errors:\n");
                for (i, (xyz, err)) in terrain_rows.iter().enumerate() {
                    let llh = datum.cartesian_to_geodetic(xyz);
                    writeln!(reference, "{}, {}, {}, {}", llh.x, llh.y, llh.z, err)?;
                    writeln!(averages, "{}, {}", i, err)?;
                }
                std::fs::write(path("_reference_terrain.txt"), &reference)?;
            }
            None => warn!("no datum specified, cannot write the reference terrain log"),
        }
    }

    info!("writing residual logs with prefix {}", prefix.display());
    std::fs::write(path("_averages.txt"), &averages)?;
    std::fs::write(path("_raw_pixels.txt"), &raw_pixels)?;
    std::fs::write(path("_raw_gcp.txt"), &raw_gcp)?;
    std::fs::write(path("_raw_cameras.txt"), &raw_cams)?;

    write_pointmap(ctx, &path("_pointmap.csv"), state, &flat)?;
    Ok(())
}

/// The `lon, lat, height, mean_residual, num_observations` CSV, skipping
/// outliers. Requires a datum.
fn write_pointmap(
    ctx: &AnalyzerContext<'_>,
    path: &Path,
    state: &HashMap<String, DVector<Real>>,
    flat: &[Real],
) -> Result<()> {
    let Some(datum) = ctx.datum else {
        warn!("no datum specified, cannot write file: {}", path.display());
        return Ok(());
    };

    let num_points = ctx.cnet.num_points();
    let (means, obs) = mean_point_residuals(ctx.assembly, flat, num_points, ctx.outliers);

    let mut out = String::from("# lon, lat, height_above_datum, mean_residual, num_observations\n");
    for p in 0..num_points {
        if ctx.outliers.contains(&p) {
            continue;
        }
        let Some(count) = obs[p] else { continue };
        if count == 0 {
            continue;
        }
        let xyz = match state.get(&point_key(p)) {
            Some(v) => Vec3::new(v[0], v[1], v[2]),
            None => ctx.cnet.point(p).xyz,
        };
        let llh = datum.cartesian_to_geodetic(&xyz);
        writeln!(out, "{}, {}, {}, {}, {}", llh.x, llh.y, llh.z, means[p], count)?;
    }
    info!("writing: {}", path.display());
    std::fs::write(path, out)?;
    Ok(())
}
