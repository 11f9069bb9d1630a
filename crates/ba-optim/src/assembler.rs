//! Problem assembly: control network + configuration -> residual schedule.
//!
//! Assembly walks the network in canonical order and emits one schedule
//! entry per residual block: reprojection entries first (cameras outer,
//! observations inner, outliers skipped), then terrain-disparity entries,
//! then GCP entries, then camera-prior entries, then rotation/translation
//! prior entries. The analyzer and outlier filter decode residual vectors
//! by walking the same schedule.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{ensure, Context, Result};
use ba_core::{ControlNetwork, Datum, GridRaster, Real, Vec2, Vec3};
use log::info;
use nalgebra::DVector;
use tiny_solver::problem::Problem;

use crate::factors::{
    CameraPriorFactor, DisparityFactor, GcpLlhFactor, GcpXyzFactor, PosePriorFactor,
    ReprojectionFactor,
};
use crate::intrinsics::{
    frozen_groups, IntrinsicsState, GROUP_CENTER, GROUP_DISTORTION, GROUP_FOCAL, KEY_CENTER,
    KEY_DISTORTION, KEY_FOCAL,
};
use crate::robust::RobustKernel;
use crate::schedule::{FactorData, ResidualEntry, ResidualKind, ResidualSchedule};

/// Parameter block key for camera `i`.
pub fn camera_key(i: usize) -> String {
    format!("cam/{}", i)
}

/// Parameter block key for point `p`.
pub fn point_key(p: usize) -> String {
    format!("pt/{}", p)
}

/// A reference-terrain observation, prepared by the pipeline: the trusted
/// point, its stereo pair and the disparity sampled at the left projection.
#[derive(Debug, Clone)]
pub struct TerrainObservation {
    pub xyz: Vec3,
    pub left: usize,
    pub right: usize,
    pub disparity: Vec2,
}

/// Assembly-time configuration (a slice of the full option surface).
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub kernel: RobustKernel,
    pub camera_weight: Real,
    pub rotation_weight: Real,
    pub translation_weight: Real,
    pub overlap_exponent: Real,
    pub fixed_cameras: BTreeSet<usize>,
    pub fix_gcp_xyz: bool,
    pub use_llh_error: bool,
    pub datum: Option<Datum>,
    pub solve_intrinsics: bool,
    pub intrinsics_to_float: BTreeSet<String>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            kernel: RobustKernel::None,
            camera_weight: 0.0,
            rotation_weight: 0.0,
            translation_weight: 0.0,
            overlap_exponent: 0.0,
            fixed_cameras: BTreeSet::new(),
            fix_gcp_xyz: false,
            use_llh_error: false,
            datum: None,
            solve_intrinsics: false,
            intrinsics_to_float: BTreeSet::new(),
        }
    }
}

/// An assembled problem: the schedule, the initial parameter state and the
/// constancy markings, plus the counts the analyzer needs.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub schedule: ResidualSchedule,
    pub initial: HashMap<String, DVector<Real>>,
    pub fixed_blocks: BTreeMap<String, Vec<usize>>,
    /// Reprojection residual blocks per camera, in camera order.
    pub cam_residual_counts: Vec<usize>,
    /// Point indices of scheduled GCP entries, in schedule order.
    pub gcp_points: Vec<usize>,
    /// Terrain points of scheduled disparity entries, in schedule order.
    pub terrain_points: Vec<Vec3>,
}

impl Assembly {
    /// Compile to the solver backend's problem and its initial value map.
    pub fn compile(&self) -> (Problem, HashMap<String, DVector<Real>>) {
        let mut problem = Problem::new();
        for entry in &self.schedule.entries {
            let loss = if entry.robust {
                self.schedule.kernel.to_loss()
            } else {
                None
            };
            let refs: Vec<&str> = entry.params.iter().map(|s| s.as_str()).collect();
            match &entry.factor {
                FactorData::Reprojection(f) => {
                    problem.add_residual_block(entry.dim(), &refs, Box::new(f.clone()), loss)
                }
                FactorData::Disparity(f) => {
                    problem.add_residual_block(entry.dim(), &refs, Box::new(f.clone()), loss)
                }
                FactorData::GcpXyz(f) => {
                    problem.add_residual_block(entry.dim(), &refs, Box::new(f.clone()), loss)
                }
                FactorData::GcpLlh(f) => {
                    problem.add_residual_block(entry.dim(), &refs, Box::new(f.clone()), loss)
                }
                FactorData::CameraPrior(f) => {
                    problem.add_residual_block(entry.dim(), &refs, Box::new(f.clone()), loss)
                }
                FactorData::PosePrior(f) => {
                    problem.add_residual_block(entry.dim(), &refs, Box::new(f.clone()), loss)
                }
            };
        }
        for (name, idxs) in &self.fixed_blocks {
            for idx in idxs {
                problem.fix_variable(name, *idx);
            }
        }
        (problem, self.initial.clone())
    }
}

/// Materialize the residual schedule for one pass.
///
/// `points` is mutated when heights-from-DEM mode overwrites tie-point
/// heights. `orig_cameras` anchors the prior entries; `outliers` is the
/// current outlier set.
#[allow(clippy::too_many_arguments)]
pub fn assemble(
    cnet: &ControlNetwork,
    cameras: &[DVector<Real>],
    orig_cameras: &[DVector<Real>],
    points: &mut [DVector<Real>],
    intrinsics: &IntrinsicsState,
    outliers: &BTreeSet<usize>,
    heights_dem: Option<&GridRaster>,
    terrain: &[TerrainObservation],
    cfg: &AssemblerConfig,
) -> Result<Assembly> {
    ensure!(
        cameras.len() == cnet.num_cameras(),
        "expected {} cameras, got {}",
        cnet.num_cameras(),
        cameras.len()
    );
    ensure!(
        points.len() == cnet.num_points(),
        "expected {} points, got {}",
        cnet.num_points(),
        points.len()
    );
    if heights_dem.is_some() || cfg.use_llh_error {
        ensure!(
            cfg.datum.is_some(),
            "a datum is required for heights-from-dem and lon-lat-height GCP errors"
        );
    }

    let mut schedule = ResidualSchedule {
        entries: Vec::new(),
        kernel: cfg.kernel,
    };
    let mut initial: HashMap<String, DVector<Real>> = HashMap::new();
    let mut fixed_blocks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut cam_residual_counts = vec![0usize; cnet.num_cameras()];
    let mut dem_frozen: BTreeSet<usize> = BTreeSet::new();

    let intr_keys = intrinsic_param_keys(intrinsics, cfg.solve_intrinsics);

    // Shared-feature bonus: how many cameras observe each surviving point.
    let overlap_counts = if cfg.overlap_exponent > 0.0 {
        let mut counts = vec![0usize; cnet.num_points()];
        for (_, obs) in cnet.iter_observations() {
            if !outliers.contains(&obs.point) {
                counts[obs.point] += 1;
            }
        }
        Some(counts)
    } else {
        None
    };

    // 1. Reprojection entries, cameras outer, observations inner.
    for icam in 0..cnet.num_cameras() {
        let cam_name = camera_key(icam);
        for obs in cnet.observations_of(icam) {
            let ipt = obs.point;
            if outliers.contains(&ipt) {
                continue;
            }

            let mut sigma = obs.sigma;
            if let Some(counts) = &overlap_counts {
                let n = counts[ipt];
                if n > 1 {
                    sigma /= ((n - 1) as Real).powf(cfg.overlap_exponent);
                }
            }

            if let (Some(dem), false) = (heights_dem, cnet.is_gcp(ipt)) {
                if !dem_frozen.contains(&ipt) {
                    let datum = cfg.datum.as_ref().unwrap();
                    if inject_dem_height(dem, datum, &mut points[ipt]) {
                        fixed_blocks.insert(point_key(ipt), vec![0, 1, 2]);
                        dem_frozen.insert(ipt);
                    }
                }
            }

            let pt_name = point_key(ipt);
            initial
                .entry(cam_name.clone())
                .or_insert_with(|| cameras[icam].clone());
            initial
                .entry(pt_name.clone())
                .or_insert_with(|| points[ipt].clone());

            let mut params = vec![cam_name.clone(), pt_name];
            params.extend(intr_keys.iter().cloned());

            schedule.entries.push(ResidualEntry {
                kind: ResidualKind::Reprojection {
                    camera: icam,
                    point: ipt,
                },
                params,
                factor: FactorData::Reprojection(ReprojectionFactor {
                    observation: obs.pixel,
                    sigma,
                    intrinsics: intrinsics.base.clone(),
                    solve_intrinsics: cfg.solve_intrinsics,
                }),
                robust: true,
            });

            if cfg.fixed_cameras.contains(&icam) {
                fixed_blocks.insert(cam_name.clone(), (0..6).collect());
            }
            cam_residual_counts[icam] += 1;
        }
    }

    // 2. Reference-terrain disparity entries.
    let mut terrain_points = Vec::with_capacity(terrain.len());
    for (idx, t) in terrain.iter().enumerate() {
        let left_name = camera_key(t.left);
        let right_name = camera_key(t.right);
        initial
            .entry(left_name.clone())
            .or_insert_with(|| cameras[t.left].clone());
        initial
            .entry(right_name.clone())
            .or_insert_with(|| cameras[t.right].clone());

        let mut params = vec![left_name, right_name];
        params.extend(intr_keys.iter().cloned());

        schedule.entries.push(ResidualEntry {
            kind: ResidualKind::TerrainDisparity {
                left: t.left,
                right: t.right,
                terrain: idx,
            },
            params,
            factor: FactorData::Disparity(DisparityFactor {
                xyz: t.xyz,
                disparity: t.disparity,
                intrinsics: intrinsics.base.clone(),
                solve_intrinsics: cfg.solve_intrinsics,
            }),
            robust: true,
        });
        terrain_points.push(t.xyz);
    }

    // 3. GCP position entries.
    let mut gcp_points = Vec::new();
    for ipt in 0..cnet.num_points() {
        if !cnet.is_gcp(ipt) || outliers.contains(&ipt) {
            continue;
        }
        let point = cnet.point(ipt);
        let pt_name = point_key(ipt);
        initial
            .entry(pt_name.clone())
            .or_insert_with(|| points[ipt].clone());

        let factor = if cfg.use_llh_error {
            let datum = cfg
                .datum
                .as_ref()
                .context("lon-lat-height GCP errors require a datum")?;
            let llh = datum.cartesian_to_geodetic(&point.xyz);
            // The file carries (sigma_lat, sigma_lon, sigma_h); reorder for
            // the lon/lat/height residual.
            let sigma = Vec3::new(point.sigma.y, point.sigma.x, point.sigma.z);
            FactorData::GcpLlh(GcpLlhFactor {
                observation_llh: llh,
                sigma,
                semi_major: datum.semi_major,
                semi_minor: datum.semi_minor,
            })
        } else {
            FactorData::GcpXyz(GcpXyzFactor {
                observation: point.xyz,
                sigma: point.sigma,
            })
        };

        schedule.entries.push(ResidualEntry {
            kind: ResidualKind::GcpPosition { point: ipt },
            params: vec![pt_name.clone()],
            factor,
            robust: false,
        });
        gcp_points.push(ipt);

        if cfg.fix_gcp_xyz {
            fixed_blocks.insert(pt_name, vec![0, 1, 2]);
        }
    }

    // 4. Uniform camera priors.
    if cfg.camera_weight > 0.0 {
        for icam in 0..cnet.num_cameras() {
            let cam_name = camera_key(icam);
            initial
                .entry(cam_name.clone())
                .or_insert_with(|| cameras[icam].clone());
            schedule.entries.push(ResidualEntry {
                kind: ResidualKind::CameraPrior { camera: icam },
                params: vec![cam_name],
                factor: FactorData::CameraPrior(CameraPriorFactor {
                    original: orig_cameras[icam].clone(),
                    weight: cfg.camera_weight,
                }),
                robust: false,
            });
        }
    }

    // 5. Split rotation/translation priors. When both prior families are
    // configured this duplicates the camera rows, as the residual layout
    // requires.
    if cfg.rotation_weight > 0.0 || cfg.translation_weight > 0.0 {
        for icam in 0..cnet.num_cameras() {
            let cam_name = camera_key(icam);
            initial
                .entry(cam_name.clone())
                .or_insert_with(|| cameras[icam].clone());
            schedule.entries.push(ResidualEntry {
                kind: ResidualKind::PosePrior { camera: icam },
                params: vec![cam_name],
                factor: FactorData::PosePrior(PosePriorFactor {
                    original: orig_cameras[icam].clone(),
                    rotation_weight: cfg.rotation_weight,
                    translation_weight: cfg.translation_weight,
                }),
                robust: false,
            });
        }
    }

    // Intrinsic multiplier blocks, with per-group freezing.
    if cfg.solve_intrinsics {
        initial.insert(KEY_FOCAL.to_string(), intrinsics.focal_multiplier.clone());
        initial.insert(KEY_CENTER.to_string(), intrinsics.center_multiplier.clone());
        if !intrinsics.base.distortion.is_empty() {
            initial.insert(KEY_DISTORTION.to_string(), intrinsics.dist_multiplier.clone());
        }
        for group in frozen_groups(&cfg.intrinsics_to_float) {
            match group {
                GROUP_FOCAL => {
                    fixed_blocks.insert(KEY_FOCAL.to_string(), vec![0]);
                }
                GROUP_CENTER => {
                    fixed_blocks.insert(KEY_CENTER.to_string(), vec![0, 1]);
                }
                GROUP_DISTORTION => {
                    if !intrinsics.base.distortion.is_empty() {
                        fixed_blocks.insert(
                            KEY_DISTORTION.to_string(),
                            (0..intrinsics.base.distortion.len()).collect(),
                        );
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    info!(
        "assembled {} residual blocks ({} reprojection, {} terrain, {} gcp)",
        schedule.entries.len(),
        cam_residual_counts.iter().sum::<usize>(),
        terrain_points.len(),
        gcp_points.len()
    );

    Ok(Assembly {
        schedule,
        initial,
        fixed_blocks,
        cam_residual_counts,
        gcp_points,
        terrain_points,
    })
}

fn intrinsic_param_keys(intrinsics: &IntrinsicsState, solve: bool) -> Vec<String> {
    if !solve {
        return Vec::new();
    }
    let mut keys = vec![KEY_FOCAL.to_string(), KEY_CENTER.to_string()];
    if !intrinsics.base.distortion.is_empty() {
        keys.push(KEY_DISTORTION.to_string());
    }
    keys
}

/// Replace the point's height with the DEM height at its lon/lat. Returns
/// whether the sample was valid (the point is frozen only in that case).
fn inject_dem_height(dem: &GridRaster, datum: &Datum, point: &mut DVector<Real>) -> bool {
    let xyz = Vec3::new(point[0], point[1], point[2]);
    let llh = datum.cartesian_to_geodetic(&xyz);
    match dem.sample_lonlat(Vec2::new(llh.x, llh.y)) {
        Some(height) => {
            let new_xyz = datum.geodetic_to_cartesian(&Vec3::new(llh.x, llh.y, height));
            point[0] = new_xyz.x;
            point[1] = new_xyz.y;
            point[2] = new_xyz.z;
            true
        }
        None => false,
    }
}
