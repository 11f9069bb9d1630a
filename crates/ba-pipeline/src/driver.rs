//! The multi-pass outlier-filtering loop.
//!
//! Each pass re-optimizes from a pristine snapshot of the initial
//! parameters with a (monotonically growing) outlier set. Between passes
//! the raw reprojection residuals classify new outliers and the on-disk
//! match files are rewritten to their surviving subset. Match files are
//! only ever touched between passes, never during one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::{bail, ensure, Result};
use ba_core::{ControlNetwork, GridRaster, PinholeCamera, Real};
use ba_optim::{
    assemble, camera_key, point_key,
    intrinsics::{KEY_CENTER, KEY_DISTORTION, KEY_FOCAL},
    solve, AssemblerConfig, Assembly, IntrinsicsState, SolveReport, TerrainObservation,
};
use log::info;
use nalgebra::DVector;

use crate::analyzer::{mean_point_residuals, write_residual_logs, AnalyzerContext};
use crate::kml::write_points_kml;
use crate::match_file::{read_match_file, write_match_file};
use crate::options::BaOptions;

/// Everything one adjustment run needs, prepared by the front end.
pub struct RunInputs {
    pub cameras: Vec<PinholeCamera>,
    pub camera_names: Vec<String>,
    pub cnet: ControlNetwork,
    /// On-disk match files per camera pair; rewritten between passes.
    pub match_files: BTreeMap<(usize, usize), PathBuf>,
    pub heights_dem: Option<GridRaster>,
    pub terrain: Vec<TerrainObservation>,
}

/// The refined state after all passes.
#[derive(Debug)]
pub struct RunOutputs {
    pub cameras: Vec<PinholeCamera>,
    pub cnet: ControlNetwork,
    pub outliers: BTreeSet<usize>,
    pub passes_run: usize,
    pub reports: Vec<SolveReport>,
}

/// Run the configured number of bundle adjustment passes.
pub fn run_passes(inputs: RunInputs, options: &BaOptions) -> Result<RunOutputs> {
    let RunInputs {
        mut cameras,
        camera_names,
        mut cnet,
        match_files,
        heights_dem,
        terrain,
    } = inputs;

    for &idx in &options.fixed_camera_indices {
        ensure!(
            idx < cameras.len(),
            "the camera index to keep fixed {} is out of bounds",
            idx
        );
    }

    let datum = options.resolve_datum()?;
    let cfg = AssemblerConfig {
        kernel: options.kernel()?,
        camera_weight: options.camera_weight,
        rotation_weight: options.rotation_weight,
        translation_weight: options.translation_weight,
        overlap_exponent: options.overlap_exponent,
        fixed_cameras: options.fixed_camera_indices.clone(),
        fix_gcp_xyz: options.fix_gcp_xyz,
        use_llh_error: options.use_lon_lat_height_gcp_error,
        datum: datum.clone(),
        solve_intrinsics: options.solve_intrinsics,
        intrinsics_to_float: options.intrinsics_to_float.clone(),
    };

    info!(
        "solver may use up to {} worker threads",
        options.effective_num_threads()
    );

    // Flat parameter state owned by the loop; the assembler borrows it for
    // the duration of one pass.
    let mut cameras_vec: Vec<DVector<Real>> =
        cameras.iter().map(|c| c.extrinsics.to_dvec()).collect();
    let mut points_vec: Vec<DVector<Real>> = (0..cnet.num_points())
        .map(|p| {
            let xyz = cnet.point(p).xyz;
            DVector::from_vec(vec![xyz.x, xyz.y, xyz.z])
        })
        .collect();
    let mut intr_state = IntrinsicsState::new(cameras[0].intrinsics.clone());

    // Pristine snapshots restored before every pass after the first.
    let orig_cameras = cameras_vec.clone();
    let orig_points = points_vec.clone();
    let orig_intrinsics = intr_state.base.clone();

    let mut outliers: BTreeSet<usize> = BTreeSet::new();
    let mut reports = Vec::new();
    let mut passes_run = 0usize;

    for pass in 0..options.num_passes {
        if options.num_passes > 1 {
            info!("bundle adjust pass: {}", pass);
        }
        if pass > 0 {
            // Each pass re-solves from scratch with the grown outlier set.
            cameras_vec.clone_from(&orig_cameras);
            points_vec.clone_from(&orig_points);
            intr_state.base = orig_intrinsics.clone();
            intr_state.reset_multipliers();
        }

        let assembly = assemble(
            &cnet,
            &cameras_vec,
            &orig_cameras,
            &mut points_vec,
            &intr_state,
            &outliers,
            heights_dem.as_ref(),
            &terrain,
            &cfg,
        )?;

        let ctx = AnalyzerContext {
            assembly: &assembly,
            cnet: &cnet,
            camera_names: &camera_names,
            datum: datum.as_ref(),
            outliers: &outliers,
        };

        if pass == 0 {
            info!("writing initial condition files");
            let prefix = |tag: &str| PathBuf::from(format!("{}-{}", options.out_prefix, tag));
            write_residual_logs(&ctx, &prefix("initial_residuals_loss_function"), true, &assembly.initial)?;
            write_residual_logs(
                &ctx,
                &prefix("initial_residuals_no_loss_function"),
                false,
                &assembly.initial,
            )?;
            write_points_kml(
                &prefix("initial_points.kml"),
                "initial_points",
                datum.as_ref(),
                &points_vec,
                &outliers,
            )?;
        }

        let (problem, initial) = assembly.compile();
        let (solution, report) = solve(&problem, initial, &options.solve_options())?;
        reports.push(report);
        passes_run = pass + 1;

        // Pull the solved values back into the loop's state.
        for (icam, vec) in cameras_vec.iter_mut().enumerate() {
            if let Some(v) = solution.get(&camera_key(icam)) {
                vec.clone_from(v);
            }
        }
        for (ipt, vec) in points_vec.iter_mut().enumerate() {
            if let Some(v) = solution.get(&point_key(ipt)) {
                vec.clone_from(v);
            }
        }

        info!("writing final condition log files");
        let prefix = |tag: &str| PathBuf::from(format!("{}-{}", options.out_prefix, tag));
        let ctx = AnalyzerContext {
            assembly: &assembly,
            cnet: &cnet,
            camera_names: &camera_names,
            datum: datum.as_ref(),
            outliers: &outliers,
        };
        write_residual_logs(&ctx, &prefix("final_residuals_loss_function"), true, &solution)?;
        write_residual_logs(
            &ctx,
            &prefix("final_residuals_no_loss_function"),
            false,
            &solution,
        )?;
        write_points_kml(
            &prefix("final_points.kml"),
            "final_points",
            datum.as_ref(),
            &points_vec,
            &outliers,
        )?;
        log_gcp_changes(&cnet, &points_vec, &outliers);

        // Absorb the intrinsic multipliers once the logs reflect them.
        if options.solve_intrinsics {
            let focal = solution
                .get(KEY_FOCAL)
                .cloned()
                .unwrap_or_else(|| intr_state.focal_multiplier.clone());
            let center = solution
                .get(KEY_CENTER)
                .cloned()
                .unwrap_or_else(|| intr_state.center_multiplier.clone());
            let dist = solution.get(KEY_DISTORTION).cloned();
            info!(
                "final intrinsic multipliers: focal {:?} center {:?} distortion {:?}",
                focal.as_slice(),
                center.as_slice(),
                dist.as_ref().map(|d| d.as_slice().to_vec())
            );
            intr_state.absorb(&focal, &center, dist.as_ref());
        }

        let last_pass = pass + 1 == options.num_passes;
        let mut num_new_outliers = 0;
        if !last_pass {
            num_new_outliers =
                update_outliers(&assembly, &solution, &cnet, &mut outliers, options)?;
        }

        if options.num_passes > 1 && num_new_outliers > 0 {
            rewrite_match_files(&cnet, &outliers, &match_files, options)?;
        }

        if !last_pass && num_new_outliers == 0 {
            info!("no new outliers removed, no more passes are needed");
            break;
        }

        let remaining = cnet.num_points() - outliers.len();
        if options.num_passes > 1 && remaining < options.min_matches {
            bail!(
                "too few points remain after filtering: {} (min {})",
                remaining,
                options.min_matches
            );
        }
    }

    // Push the optimized state back into the typed cameras and network.
    for (cam, vec) in cameras.iter_mut().zip(cameras_vec.iter()) {
        cam.extrinsics = ba_core::Extrinsics::from_slice(vec.as_slice())?;
        cam.intrinsics = intr_state.base.clone();
    }
    for (p, vec) in points_vec.iter().enumerate() {
        cnet.point_mut(p).xyz = ba_core::Vec3::new(vec[0], vec[1], vec[2]);
    }

    Ok(RunOutputs {
        cameras,
        cnet,
        outliers,
        passes_run,
        reports,
    })
}

/// Classify new outliers from the raw (no-loss) reprojection residuals.
/// Returns the number of points newly flagged.
fn update_outliers(
    assembly: &Assembly,
    state: &HashMap<String, DVector<Real>>,
    cnet: &ControlNetwork,
    outliers: &mut BTreeSet<usize>,
    options: &BaOptions,
) -> Result<usize> {
    info!("removing pixel outliers in preparation for another solver attempt");

    let flat = assembly.schedule.evaluate(state, false)?;
    let (means, _) = mean_point_residuals(assembly, &flat, cnet.num_points(), outliers);

    // Collect the surviving non-GCP residual means in canonical order.
    let mut actual = Vec::new();
    let mut seen = BTreeSet::new();
    for (_, obs) in cnet.iter_observations() {
        let p = obs.point;
        if outliers.contains(&p) || cnet.is_gcp(p) || !seen.insert(p) {
            continue;
        }
        actual.push(means[p]);
    }
    if actual.is_empty() {
        return Ok(0);
    }

    let params = &options.remove_outliers_params;
    let q = ba_core::math::percentile(&actual, params.pct).unwrap_or(0.0);
    let mut threshold = q * params.factor;
    threshold = threshold.clamp(params.err1, params.err2);
    info!(
        "removing as outliers points with mean reprojection error > {}",
        threshold
    );

    let mut num_new = 0;
    for &p in &seen {
        if means[p] > threshold {
            outliers.insert(p);
            num_new += 1;
        }
    }
    info!(
        "removed {} outliers by reprojection error, now have {} points remaining",
        num_new,
        cnet.num_points() - outliers.len()
    );
    Ok(num_new)
}

/// Rewrite every match file to the pairs that survive outlier filtering:
/// the intersection of the original rows with the surviving control
/// network, further pruned by the disparity band filter. Idempotent for a
/// fixed outlier set.
fn rewrite_match_files(
    cnet: &ControlNetwork,
    outliers: &BTreeSet<usize>,
    match_files: &BTreeMap<(usize, usize), PathBuf>,
    options: &BaOptions,
) -> Result<()> {
    for (&(left_cam, right_cam), path) in match_files {
        let (orig_left, orig_right) = read_match_file(path)?;

        // Original rows keyed by both pixel bit patterns.
        let mut lookup: HashMap<(u64, u64, u64, u64), usize> = HashMap::new();
        for (row, (l, r)) in orig_left.iter().zip(orig_right.iter()).enumerate() {
            lookup.insert(
                (l.x.to_bits(), l.y.to_bits(), r.x.to_bits(), r.y.to_bits()),
                row,
            );
        }

        let mut kept_rows = Vec::new();
        for p in 0..cnet.num_points() {
            if cnet.is_gcp(p) || outliers.contains(&p) {
                continue;
            }
            let find_pixel = |cam: usize| {
                cnet.observations_of(cam)
                    .iter()
                    .find(|o| o.point == p)
                    .map(|o| o.pixel)
            };
            let (Some(lp), Some(rp)) = (find_pixel(left_cam), find_pixel(right_cam)) else {
                continue;
            };
            if let Some(&row) = lookup.get(&(
                lp.x.to_bits(),
                lp.y.to_bits(),
                rp.x.to_bits(),
                rp.y.to_bits(),
            )) {
                kept_rows.push(row);
            }
        }

        let kept_rows = filter_rows_by_disparity(&orig_left, &orig_right, kept_rows, options);

        let new_left: Vec<_> = kept_rows.iter().map(|&r| orig_left[r].clone()).collect();
        let new_right: Vec<_> = kept_rows.iter().map(|&r| orig_right[r].clone()).collect();
        info!(
            "writing {} of {} matches to {}",
            new_left.len(),
            orig_left.len(),
            path.display()
        );
        write_match_file(path, &new_left, &new_right)?;
    }
    Ok(())
}

/// Drop rows whose pixel delta leaves the expanded central band of the
/// joint disparity distribution.
fn filter_rows_by_disparity(
    left: &[crate::match_file::MatchRecord],
    right: &[crate::match_file::MatchRecord],
    rows: Vec<usize>,
    options: &BaOptions,
) -> Vec<usize> {
    if rows.is_empty() {
        return rows;
    }
    let params = &options.remove_outliers_by_disparity_params;
    let dx: Vec<Real> = rows.iter().map(|&r| right[r].x - left[r].x).collect();
    let dy: Vec<Real> = rows.iter().map(|&r| right[r].y - left[r].y).collect();

    let band = |values: &[Real]| -> (Real, Real) {
        let lo = ba_core::math::percentile(values, 100.0 - params.pct).unwrap();
        let hi = ba_core::math::percentile(values, params.pct).unwrap();
        let mid = 0.5 * (lo + hi);
        let half = 0.5 * (hi - lo) * params.factor;
        (mid - half, mid + half)
    };
    let (bx, ex) = band(&dx);
    let (by, ey) = band(&dy);

    rows.into_iter()
        .zip(dx.iter().zip(dy.iter()))
        .filter(|(_, (dx, dy))| **dx >= bx && **dx <= ex && **dy >= by && **dy <= ey)
        .map(|(r, _)| r)
        .collect()
}

fn log_gcp_changes(cnet: &ControlNetwork, points: &[DVector<Real>], outliers: &BTreeSet<usize>) {
    for p in 0..cnet.num_points() {
        if !cnet.is_gcp(p) || outliers.contains(&p) {
            continue;
        }
        let input = cnet.point(p).xyz;
        let optimized = ba_core::Vec3::new(points[p][0], points[p][1], points[p][2]);
        info!(
            "gcp {}: input {:?} optimized {:?} diff {:?}",
            p,
            input.as_slice(),
            optimized.as_slice(),
            (input - optimized).as_slice()
        );
    }
}
