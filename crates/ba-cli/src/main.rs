//! `bundle-adjust`: refine camera poses (and optionally shared pinhole
//! intrinsics) together with triangulated ground points, from pairwise
//! image matches and optional ground control points.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use ba_core::{DisparityRaster, GridRaster, PinholeCamera, Real};
use ba_pipeline::{
    adjustments, align, camera_io, camera_positions, cnet_build, gcp, mapproj, match_file, pairs,
    terrain, BaOptions, DisparityFilterParams, OutlierParams,
};
use clap::Parser;
use log::{info, warn};

/// Bundle adjustment over satellite and aerial image sets.
#[derive(Debug, Parser)]
#[command(author, version, about = "Multi-pass bundle adjustment with outlier filtering")]
struct Args {
    /// Input images, camera files and optional .gcp files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Prefix for output filenames.
    #[arg(short, long)]
    output_prefix: String,

    /// Robust cost function: l2, huber, cauchy or arctan.
    #[arg(long, default_value = "cauchy")]
    cost_function: String,

    /// Threshold for the robust cost functions.
    #[arg(long, default_value_t = 0.5)]
    robust_threshold: Real,

    /// Weight tying cameras to their input poses.
    #[arg(long, default_value_t = 1.0)]
    camera_weight: Real,

    /// Finer-grained rotation prior weight.
    #[arg(long, default_value_t = 0.0)]
    rotation_weight: Real,

    /// Finer-grained translation prior weight.
    #[arg(long, default_value_t = 0.0)]
    translation_weight: Real,

    /// Features seen in n images get weight proportional to (n-1)^exponent.
    #[arg(long, default_value_t = 0.0)]
    overlap_exponent: Real,

    /// Number of bundle adjustment passes; outliers are filtered between
    /// passes.
    #[arg(long, default_value_t = 1)]
    num_passes: usize,

    /// Outlier removal parameters: 'pct factor err1 err2'.
    #[arg(long, default_value = "75.0 3.0 2.0 3.0")]
    remove_outliers_params: String,

    /// Disparity-based outlier removal parameters: 'pct factor'.
    #[arg(long, default_value = "90.0 3.0")]
    remove_outliers_by_disparity_params: String,

    /// Minimum number of matches per image pair, and of surviving points.
    #[arg(long, default_value_t = 30)]
    min_matches: usize,

    /// Minimum ray separation angle at a triangulated point, degrees.
    #[arg(long, default_value_t = 0.1)]
    min_triangulation_angle: Real,

    /// Solver iteration cap.
    #[arg(long, default_value_t = 1000)]
    max_iterations: usize,

    /// Solver tolerance; smaller means more iterations.
    #[arg(long, default_value_t = 1e-8)]
    parameter_tolerance: Real,

    /// Optimize shared pinhole intrinsics as well.
    #[arg(long)]
    solve_intrinsics: bool,

    /// Intrinsic groups to float, from: focal_length, optical_center,
    /// distortion_params.
    #[arg(long, default_value = "")]
    intrinsics_to_float: String,

    /// Do not float the GCP coordinates.
    #[arg(long)]
    fix_gcp_xyz: bool,

    /// Space-separated camera indices to keep fixed.
    #[arg(long, default_value = "")]
    fixed_camera_indices: String,

    /// Replace tie-point heights with values from this DEM and freeze them.
    #[arg(long)]
    heights_from_dem: Option<PathBuf>,

    /// Interpret GCP sigmas as lat/lon/height instead of ECEF x/y/z.
    #[arg(long)]
    use_lon_lat_height_gcp_error: bool,

    /// 4x4 row-major transform applied to cameras and points before
    /// optimization.
    #[arg(long)]
    initial_transform: Option<PathBuf>,

    /// Prefix to read .adjust files from a previous run.
    #[arg(long)]
    input_adjustments_prefix: Option<String>,

    /// Map-projected image sidecars plus the DEM they were projected onto;
    /// rewrites their matches into native pixel space before adjustment.
    #[arg(long, num_args = 2..)]
    mapprojected_data: Vec<PathBuf>,

    /// Map-projected image sidecars plus the DEM; synthesizes a GCP file
    /// and exits.
    #[arg(long, num_args = 2..)]
    gcp_data: Vec<PathBuf>,

    /// Trusted terrain (ASCII grid DEM or lon/lat/height list) used as soft
    /// ground truth.
    #[arg(long)]
    reference_terrain: Option<PathBuf>,

    /// Disparity files, one per camera pair, for the reference terrain.
    #[arg(long, num_args = 1..)]
    disparity_list: Vec<PathBuf>,

    /// Maximum disparity disagreement in pixels for reference terrain
    /// points.
    #[arg(long, default_value_t = -1.0)]
    max_disp_error: Real,

    /// Cap on reference terrain points.
    #[arg(long, default_value_t = 100_000_000)]
    max_num_reference_points: usize,

    /// Datum name: WGS_1984, D_MOON or D_MARS.
    #[arg(long)]
    datum: Option<String>,

    /// Explicit datum semi-major axis in meters.
    #[arg(long, default_value_t = 0.0)]
    semi_major_axis: Real,

    /// Explicit datum semi-minor axis in meters.
    #[arg(long, default_value_t = 0.0)]
    semi_minor_axis: Real,

    /// CSV with estimated camera positions.
    #[arg(long)]
    camera_positions: Option<PathBuf>,

    /// Column layout of the camera-positions CSV.
    #[arg(long, default_value = "")]
    csv_format: String,

    /// Skip pairs whose estimated camera centers are farther apart than
    /// this distance in meters.
    #[arg(long, default_value_t = -1.0)]
    position_filter_dist: Real,

    /// Only match each image against this many subsequent images.
    #[arg(long, default_value_t = 0)]
    overlap_limit: usize,

    /// File listing image pairs expected to overlap.
    #[arg(long)]
    overlap_list: Option<PathBuf>,

    /// Dump the control network in the GCP text format.
    #[arg(long)]
    save_cnet_as_csv: bool,

    /// Session type; isis sessions pin the solver to one thread.
    #[arg(long, default_value = "pinhole")]
    session_type: String,

    /// Solver worker threads (0 = automatic).
    #[arg(long, default_value_t = 0)]
    num_threads: usize,
}

fn parse_list<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>> {
    text.replace(',', " ")
        .split_whitespace()
        .map(|t| {
            t.parse::<T>()
                .map_err(|_| anyhow::anyhow!("bad {} value: {:?}", what, t))
        })
        .collect()
}

fn to_options(args: &Args) -> Result<BaOptions> {
    let op: Vec<Real> = parse_list(&args.remove_outliers_params, "remove-outliers-params")?;
    ensure!(
        op.len() == 4,
        "remove-outliers-params must be 'pct factor err1 err2'"
    );
    let dp: Vec<Real> = parse_list(
        &args.remove_outliers_by_disparity_params,
        "remove-outliers-by-disparity-params",
    )?;
    ensure!(
        dp.len() == 2,
        "remove-outliers-by-disparity-params must be 'pct factor'"
    );
    let fixed: Vec<usize> = parse_list(&args.fixed_camera_indices, "fixed-camera-indices")?;
    let to_float: BTreeSet<String> = args
        .intrinsics_to_float
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();

    Ok(BaOptions {
        out_prefix: args.output_prefix.clone(),
        cost_function: args.cost_function.clone(),
        robust_threshold: args.robust_threshold,
        camera_weight: args.camera_weight,
        rotation_weight: args.rotation_weight,
        translation_weight: args.translation_weight,
        overlap_exponent: args.overlap_exponent,
        num_passes: args.num_passes,
        remove_outliers_params: OutlierParams {
            pct: op[0],
            factor: op[1],
            err1: op[2],
            err2: op[3],
        },
        remove_outliers_by_disparity_params: DisparityFilterParams {
            pct: dp[0],
            factor: dp[1],
        },
        min_matches: args.min_matches,
        min_triangulation_angle: args.min_triangulation_angle,
        max_iterations: args.max_iterations,
        parameter_tolerance: args.parameter_tolerance,
        solve_intrinsics: args.solve_intrinsics,
        intrinsics_to_float: to_float,
        fix_gcp_xyz: args.fix_gcp_xyz,
        fixed_camera_indices: fixed.into_iter().collect(),
        heights_from_dem: args.heights_from_dem.clone(),
        use_lon_lat_height_gcp_error: args.use_lon_lat_height_gcp_error,
        initial_transform: args.initial_transform.clone(),
        input_adjustments_prefix: args.input_adjustments_prefix.clone(),
        mapprojected_data: args.mapprojected_data.clone(),
        gcp_data: args.gcp_data.clone(),
        reference_terrain: args.reference_terrain.clone(),
        disparity_list: args.disparity_list.clone(),
        max_disp_error: args.max_disp_error,
        max_num_reference_points: args.max_num_reference_points,
        datum: args.datum.clone(),
        semi_major_axis: args.semi_major_axis,
        semi_minor_axis: args.semi_minor_axis,
        camera_positions: args.camera_positions.clone(),
        csv_format: args.csv_format.clone(),
        position_filter_dist: args.position_filter_dist,
        overlap_limit: args.overlap_limit,
        overlap_list: args.overlap_list.clone(),
        save_cnet_as_csv: args.save_cnet_as_csv,
        session_type: args.session_type.clone(),
        num_threads: args.num_threads,
    })
}

/// Split the positional inputs into images, camera files and GCP files.
/// When no camera files are given, `<image stem>.tsai` next to each image
/// is assumed.
fn separate_inputs(inputs: &[PathBuf]) -> Result<(Vec<PathBuf>, Vec<PathBuf>, Vec<PathBuf>)> {
    let mut images = Vec::new();
    let mut cameras = Vec::new();
    let mut gcps = Vec::new();
    for input in inputs {
        match input.extension().and_then(|e| e.to_str()) {
            Some("gcp") => gcps.push(input.clone()),
            Some("tsai") | Some("cam") => cameras.push(input.clone()),
            _ => images.push(input.clone()),
        }
    }
    if cameras.is_empty() {
        cameras = images.iter().map(|img| img.with_extension("tsai")).collect();
    }
    ensure!(!images.is_empty(), "missing input image files");
    ensure!(
        cameras.len() == images.len(),
        "must have as many cameras as images ({} vs {})",
        cameras.len(),
        images.len()
    );
    Ok((images, cameras, gcps))
}

/// Parse `--mapprojected-data` / `--gcp-data` style lists: sidecars plus a
/// trailing DEM.
fn split_map_list(list: &[PathBuf]) -> Result<(Vec<PathBuf>, PathBuf)> {
    ensure!(
        list.len() >= 2,
        "expected at least one map-projected image sidecar and a DEM"
    );
    let mut names = list.to_vec();
    let dem = names.pop().unwrap();
    Ok((names, dem))
}

fn main() {
    env_logger::init();
    if let Err(err) = try_main() {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    let options = to_options(&args)?;
    let (images, camera_files, gcp_files) = separate_inputs(&args.inputs)?;
    options
        .validate(!gcp_files.is_empty())
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let datum = options.resolve_datum()?;
    let image_names: Vec<String> = images
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    // Load the cameras.
    let mut cameras: Vec<PinholeCamera> = camera_files
        .iter()
        .map(|p| camera_io::read_camera_file(p))
        .collect::<Result<_>>()?;
    info!("loaded {} cameras", cameras.len());

    // Warm starts: prior adjustments, then the initial transform.
    if let Some(prefix) = &options.input_adjustments_prefix {
        for (cam, image) in cameras.iter_mut().zip(images.iter()) {
            let path = adjustments::adjustment_file_name(prefix, image);
            let (t, r) = adjustments::read_adjustment(&path)?;
            adjustments::apply_adjustment(cam, &t, &r);
        }
    }

    // The map-projection workflows need the DEM and sidecars up front.
    if !options.gcp_data.is_empty() {
        let (sidecars, dem_path) = split_map_list(&options.gcp_data)?;
        let datum = datum
            .clone()
            .context("the gcp-data workflow requires a datum")?;
        let dem = GridRaster::from_ascii_grid(&dem_path)?;
        let maps: Vec<_> = sidecars
            .iter()
            .map(|p| mapproj::MapImage::from_sidecar(p))
            .collect::<Result<_>>()?;
        mapproj::create_gcp_from_mapprojected(
            &cameras,
            &images,
            &maps,
            &sidecars,
            &dem_path,
            &dem,
            &datum,
            &options.out_prefix,
        )?;
        return Ok(());
    }
    if !options.mapprojected_data.is_empty() {
        let (sidecars, dem_path) = split_map_list(&options.mapprojected_data)?;
        let datum = datum
            .clone()
            .context("the mapprojected-data workflow requires a datum")?;
        let dem = GridRaster::from_ascii_grid(&dem_path)?;
        let maps: Vec<_> = sidecars
            .iter()
            .map(|p| mapproj::MapImage::from_sidecar(p))
            .collect::<Result<_>>()?;
        mapproj::create_matches_from_mapprojected(
            &cameras,
            &images,
            &maps,
            &sidecars,
            &dem,
            &datum,
            &options.out_prefix,
        )?;
    }

    // Camera position hints.
    let position_hints = match &options.camera_positions {
        Some(path) => {
            let records =
                camera_positions::read_camera_positions(path, &options.csv_format, datum.as_ref())?;
            Some(camera_positions::match_camera_positions(&image_names, &records))
        }
        None => None,
    };

    // Pair selection and discovery of the external matcher's files.
    let overlap_pairs = match &options.overlap_list {
        Some(path) => Some(pairs::read_overlap_list(path)?),
        None => None,
    };
    let selected = pairs::select_pairs(
        &image_names,
        options.overlap_limit,
        overlap_pairs.as_ref(),
        position_hints.as_deref(),
        options.position_filter_dist,
    );

    let mut match_files: BTreeMap<(usize, usize), PathBuf> = BTreeMap::new();
    for (i, j) in selected {
        let path = match_file::match_file_name(&options.out_prefix, &images[i], &images[j]);
        if path.exists() {
            match_files.insert((i, j), path);
        } else {
            warn!(
                "could not find interest point matches between images {} and {}",
                image_names[i], image_names[j]
            );
        }
    }
    if match_files.is_empty() && gcp_files.is_empty() {
        bail!("no match files found and no ground control points given");
    }

    // Build the control network.
    let mut cnet = cnet_build::build_control_network(
        &cameras,
        &match_files,
        options.min_matches,
        options.min_triangulation_angle,
    )?;
    if cnet.num_points() == 0 {
        warn!("failed to build a control network from matches; continuing with GCPs only");
    }
    if !gcp_files.is_empty() {
        info!("loading GCP files");
        let datum = datum.as_ref().context("GCP files require a datum")?;
        for path in &gcp_files {
            let records = gcp::read_gcp_file(path)?;
            cnet_build::add_ground_control_points(&mut cnet, &records, &image_names, datum)?;
        }
    }
    if options.save_cnet_as_csv {
        let datum = datum
            .as_ref()
            .context("cannot save the control network as csv without a datum")?;
        let path = PathBuf::from(format!("{}-cnet.csv", options.out_prefix));
        cnet_build::save_cnet_as_csv(&cnet, datum, &image_names, &path)?;
    }

    // The initial transform applies to cameras and tie points.
    if let Some(path) = &options.initial_transform {
        let sim = adjustments::read_initial_transform(path)?;
        info!("applying initial transform with scale {}", sim.scale);
        align::apply_similarity(&sim, &mut cameras, &mut cnet);
    }

    // Pre-solve alignment, on pinhole sessions only.
    let pinhole_session = options.session_type.to_lowercase().contains("pinhole");
    if pinhole_session {
        if let Some(hints) = &position_hints {
            align::align_from_camera_positions(&mut cameras, &mut cnet, hints)?;
        } else if !gcp_files.is_empty() {
            align::align_from_gcp(&mut cameras, &mut cnet)?;
        }
    }
    if !gcp_files.is_empty() {
        align::check_gcp_dists(&cameras, &cnet);
    }

    // Heights-from-DEM and reference-terrain support data.
    let heights_dem = match &options.heights_from_dem {
        Some(path) => Some(GridRaster::from_ascii_grid(path)?),
        None => None,
    };
    let terrain_obs = match &options.reference_terrain {
        Some(path) => {
            let datum = datum
                .as_ref()
                .context("when using a reference terrain, must specify the datum")?;
            let points =
                terrain::load_terrain_points(path, datum, options.max_num_reference_points)?;
            let disparities: Vec<DisparityRaster> = options
                .disparity_list
                .iter()
                .map(|p| DisparityRaster::from_ascii(p))
                .collect::<Result<_>>()?;
            terrain::collect_terrain_observations(&points, &cameras, &disparities, &options)?
        }
        None => Vec::new(),
    };

    // Run the passes.
    let original_cameras = cameras.clone();
    let outputs = ba_pipeline::run_passes(
        ba_pipeline::RunInputs {
            cameras,
            camera_names: camera_files
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            cnet,
            match_files,
            heights_dem,
            terrain: terrain_obs,
        },
        &options,
    )?;
    info!(
        "finished {} passes with {} outliers",
        outputs.passes_run,
        outputs.outliers.len()
    );

    // Save refined cameras and their adjustments.
    for ((camera, original), image) in outputs
        .cameras
        .iter()
        .zip(original_cameras.iter())
        .zip(images.iter())
    {
        let cam_path = camera_output_name(&options.out_prefix, image);
        camera_io::write_camera_file(&cam_path, camera)?;
        info!("writing: {}", cam_path.display());

        let (t, r) = adjustments::adjustment_between(original, camera);
        let adj_path = adjustments::adjustment_file_name(&options.out_prefix, image);
        adjustments::write_adjustment(&adj_path, &t, &r)?;
    }

    // A machine-readable run summary next to the logs.
    let report = serde_json::json!({
        "passes_run": outputs.passes_run,
        "num_points": outputs.cnet.num_points(),
        "num_outliers": outputs.outliers.len(),
        "converged": outputs.reports.iter().all(|r| r.converged),
        "hit_iteration_cap": outputs.reports.iter().any(|r| r.hit_iteration_cap),
    });
    let report_path = PathBuf::from(format!("{}-report.json", options.out_prefix));
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
    info!("writing: {}", report_path.display());
    Ok(())
}

fn camera_output_name(prefix: &str, image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    PathBuf::from(format!("{}-{}.tsai", prefix, stem))
}
