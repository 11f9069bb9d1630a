//! End-to-end scenarios for the multi-pass driver on synthetic stereo rigs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ba_core::{ControlNetwork, Extrinsics, Intrinsics, PinholeCamera, PointKind, Pt3, Real, Vec2, Vec3};
use ba_pipeline::match_file::{read_match_file, write_match_file, MatchRecord};
use ba_pipeline::{run_passes, BaOptions, RunInputs};

fn pinhole(center: Vec3) -> PinholeCamera {
    PinholeCamera::new(
        Extrinsics {
            center,
            axis_angle: Vec3::zeros(),
        },
        Intrinsics::new(1000.0, Vec2::new(500.0, 500.0), vec![]),
    )
}

/// Observations at the exact projections of `world` into `cameras`.
fn perfect_network(cameras: &[PinholeCamera], world: &[Vec3]) -> ControlNetwork {
    let mut cnet = ControlNetwork::new(cameras.len());
    for w in world {
        let p = cnet.add_point(*w, PointKind::Tie, Vec3::zeros());
        for (icam, cam) in cameras.iter().enumerate() {
            let pix = cam.project(&Pt3::from(*w)).unwrap();
            cnet.add_observation(icam, p, pix, Vec2::new(1.0, 1.0)).unwrap();
        }
    }
    cnet
}

fn base_options(prefix: &std::path::Path) -> BaOptions {
    BaOptions {
        out_prefix: prefix.join("run").to_string_lossy().into_owned(),
        cost_function: "l2".to_string(),
        camera_weight: 0.0,
        min_matches: 1,
        ..BaOptions::default()
    }
}

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("cam{}.tsai", i)).collect()
}

fn final_residual_norm(prefix: &str) -> Real {
    let raw = std::fs::read_to_string(format!(
        "{}-final_residuals_no_loss_function_raw_pixels.txt",
        prefix
    ))
    .unwrap();
    let mut sum = 0.0;
    for line in raw.lines() {
        let fields: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if fields.len() == 2 {
            if let (Ok(ex), Ok(ey)) = (fields[0].parse::<Real>(), fields[1].parse::<Real>()) {
                sum += ex * ex + ey * ey;
            }
        }
    }
    sum.sqrt()
}

#[test]
fn perfect_stereo_converges_with_no_outliers() {
    let cameras = vec![pinhole(Vec3::zeros()), pinhole(Vec3::new(1.0, 0.0, 0.0))];
    let world = vec![Vec3::new(0.5, 0.5, 10.0)];
    let cnet = perfect_network(&cameras, &world);

    let dir = tempfile::tempdir().unwrap();
    let options = base_options(dir.path());

    let outputs = run_passes(
        RunInputs {
            cameras,
            camera_names: names(2),
            cnet,
            match_files: BTreeMap::new(),
            heights_dem: None,
            terrain: Vec::new(),
        },
        &options,
    )
    .unwrap();

    assert!(outputs.outliers.is_empty());
    assert_eq!(outputs.passes_run, 1);
    let norm = final_residual_norm(&options.out_prefix);
    assert!(norm < 1e-10, "final residual norm {}", norm);
}

#[test]
fn single_pass_leaves_match_files_untouched() {
    let cameras = vec![pinhole(Vec3::zeros()), pinhole(Vec3::new(1.0, 0.0, 0.0))];
    let world = vec![Vec3::new(0.5, 0.5, 10.0)];
    let cnet = perfect_network(&cameras, &world);

    let dir = tempfile::tempdir().unwrap();
    let match_path = dir.path().join("a__b.match");
    let rec = MatchRecord::from_pixel(Vec2::new(1.0, 2.0));
    write_match_file(&match_path, &[rec.clone()], &[rec]).unwrap();
    let before = std::fs::read(&match_path).unwrap();

    let options = base_options(dir.path());
    run_passes(
        RunInputs {
            cameras,
            camera_names: names(2),
            cnet,
            match_files: BTreeMap::from([((0, 1), match_path.clone())]),
            heights_dem: None,
            terrain: Vec::new(),
        },
        &options,
    )
    .unwrap();

    assert_eq!(std::fs::read(&match_path).unwrap(), before);
}

#[test]
fn gross_outlier_is_flagged_and_match_files_rewritten() {
    let cameras = vec![pinhole(Vec3::zeros()), pinhole(Vec3::new(1.0, 0.0, 0.0))];
    let good = Vec3::new(0.5, 0.5, 10.0);
    let bad = Vec3::new(-0.4, 0.2, 12.0);

    let mut cnet = ControlNetwork::new(2);
    let mut match_left = Vec::new();
    let mut match_right = Vec::new();

    let p_good = cnet.add_point(good, PointKind::Tie, Vec3::zeros());
    for (icam, cam) in cameras.iter().enumerate() {
        let pix = cam.project(&Pt3::from(good)).unwrap();
        cnet.add_observation(icam, p_good, pix, Vec2::new(1.0, 1.0)).unwrap();
    }
    match_left.push(MatchRecord::from_pixel(
        cameras[0].project(&Pt3::from(good)).unwrap(),
    ));
    match_right.push(MatchRecord::from_pixel(
        cameras[1].project(&Pt3::from(good)).unwrap(),
    ));

    // The second point's right-image observation is off by 50 pixels.
    let p_bad = cnet.add_point(bad, PointKind::Tie, Vec3::zeros());
    let left_pix = cameras[0].project(&Pt3::from(bad)).unwrap();
    let right_pix = cameras[1].project(&Pt3::from(bad)).unwrap() + Vec2::new(50.0, 0.0);
    cnet.add_observation(0, p_bad, left_pix, Vec2::new(1.0, 1.0)).unwrap();
    cnet.add_observation(1, p_bad, right_pix, Vec2::new(1.0, 1.0)).unwrap();
    match_left.push(MatchRecord::from_pixel(left_pix));
    match_right.push(MatchRecord::from_pixel(right_pix));

    let dir = tempfile::tempdir().unwrap();
    let match_path = dir.path().join("a__b.match");
    write_match_file(&match_path, &match_left, &match_right).unwrap();

    let mut options = base_options(dir.path());
    options.num_passes = 2;
    options.fixed_camera_indices = [0, 1].into_iter().collect();

    let outputs = run_passes(
        RunInputs {
            cameras,
            camera_names: names(2),
            cnet,
            match_files: BTreeMap::from([((0, 1), match_path.clone())]),
            heights_dem: None,
            terrain: Vec::new(),
        },
        &options,
    )
    .unwrap();

    assert_eq!(outputs.outliers.iter().copied().collect::<Vec<_>>(), vec![p_bad]);
    assert_eq!(outputs.passes_run, 2);

    // The rewritten match file keeps only the good pair.
    let (left, right) = read_match_file(&match_path).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].pixel(), match_left[0].pixel());
    assert_eq!(right[0].pixel(), match_right[0].pixel());

    let norm = final_residual_norm(&options.out_prefix);
    assert!(norm < 1e-10, "final residual norm {}", norm);
}

#[test]
fn fixed_camera_keeps_its_parameters_bit_for_bit() {
    let true_cameras = vec![
        pinhole(Vec3::zeros()),
        pinhole(Vec3::new(1.0, 0.0, 0.0)),
        pinhole(Vec3::new(2.0, 0.0, 0.0)),
    ];
    let world: Vec<Vec3> = (0..6)
        .map(|i| Vec3::new(0.3 * i as Real, 0.4 * (i % 3) as Real, 10.0 + i as Real))
        .collect();
    let cnet = perfect_network(&true_cameras, &world);

    // Perturb cameras 1 and 2 away from the poses that generated the
    // observations.
    let mut cameras = true_cameras;
    cameras[1].extrinsics.center.x += 0.02;
    cameras[2].extrinsics.center.y -= 0.015;
    let initial: Vec<_> = cameras.iter().map(|c| c.extrinsics).collect();

    let dir = tempfile::tempdir().unwrap();
    let mut options = base_options(dir.path());
    options.fixed_camera_indices = [0].into_iter().collect();

    let outputs = run_passes(
        RunInputs {
            cameras,
            camera_names: names(3),
            cnet,
            match_files: BTreeMap::new(),
            heights_dem: None,
            terrain: Vec::new(),
        },
        &options,
    )
    .unwrap();

    let final_exts: Vec<_> = outputs.cameras.iter().map(|c| c.extrinsics).collect();
    assert_eq!(final_exts[0], initial[0], "fixed camera must not move");
    assert!(
        final_exts[1] != initial[1] || final_exts[2] != initial[2],
        "free cameras should have moved"
    );
}

#[test]
fn zero_iterations_keep_initial_residuals() {
    let cameras = vec![pinhole(Vec3::zeros()), pinhole(Vec3::new(1.0, 0.0, 0.0))];
    // A deliberately wrong point so residuals are nonzero.
    let mut cnet = ControlNetwork::new(2);
    let p = cnet.add_point(Vec3::new(0.5, 0.5, 11.0), PointKind::Tie, Vec3::zeros());
    let truth = Vec3::new(0.5, 0.5, 10.0);
    for (icam, cam) in cameras.iter().enumerate() {
        let pix = cam.project(&Pt3::from(truth)).unwrap();
        cnet.add_observation(icam, p, pix, Vec2::new(1.0, 1.0)).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let mut options = base_options(dir.path());
    options.max_iterations = 0;
    options.cost_function = "huber".to_string();
    options.robust_threshold = 0.5;

    let outputs = run_passes(
        RunInputs {
            cameras: cameras.clone(),
            camera_names: names(2),
            cnet,
            match_files: BTreeMap::new(),
            heights_dem: None,
            terrain: Vec::new(),
        },
        &options,
    )
    .unwrap();

    // No parameter movement at all.
    assert_eq!(outputs.cameras[0].extrinsics, cameras[0].extrinsics);
    assert_eq!(outputs.cameras[1].extrinsics, cameras[1].extrinsics);
    assert!(outputs.reports[0].hit_iteration_cap);

    // Initial and final logs agree, with and without the loss.
    for family in ["loss_function", "no_loss_function"] {
        let initial = std::fs::read_to_string(format!(
            "{}-initial_residuals_{}_raw_pixels.txt",
            options.out_prefix, family
        ))
        .unwrap();
        let fin = std::fs::read_to_string(format!(
            "{}-final_residuals_{}_raw_pixels.txt",
            options.out_prefix, family
        ))
        .unwrap();
        assert_eq!(initial, fin, "{} family differs", family);
    }
}

#[test]
fn gcp_is_never_an_outlier() {
    let cameras = vec![pinhole(Vec3::zeros()), pinhole(Vec3::new(1.0, 0.0, 0.0))];
    let mut cnet = ControlNetwork::new(2);

    let good = Vec3::new(0.5, 0.5, 10.0);
    let p_good = cnet.add_point(good, PointKind::Tie, Vec3::zeros());
    for (icam, cam) in cameras.iter().enumerate() {
        let pix = cam.project(&Pt3::from(good)).unwrap();
        cnet.add_observation(icam, p_good, pix, Vec2::new(1.0, 1.0)).unwrap();
    }

    // A GCP whose observations are wildly wrong must survive filtering.
    let p_gcp = cnet.add_point(
        Vec3::new(-0.5, 0.5, 12.0),
        PointKind::Gcp,
        Vec3::new(1.0, 1.0, 1.0),
    );
    cnet.add_observation(0, p_gcp, Vec2::new(900.0, 900.0), Vec2::new(1.0, 1.0)).unwrap();
    cnet.add_observation(1, p_gcp, Vec2::new(100.0, 100.0), Vec2::new(1.0, 1.0)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let match_path = dir.path().join("a__b.match");
    let rec = MatchRecord::from_pixel(cameras[0].project(&Pt3::from(good)).unwrap());
    let rec_r = MatchRecord::from_pixel(cameras[1].project(&Pt3::from(good)).unwrap());
    write_match_file(&match_path, &[rec], &[rec_r]).unwrap();

    let mut options = base_options(dir.path());
    options.num_passes = 2;
    options.fixed_camera_indices = [0, 1].into_iter().collect();
    options.fix_gcp_xyz = true;

    let outputs = run_passes(
        RunInputs {
            cameras,
            camera_names: names(2),
            cnet,
            match_files: BTreeMap::from([((0, 1), match_path)]),
            heights_dem: None,
            terrain: Vec::new(),
        },
        &options,
    )
    .unwrap();

    assert!(!outputs.outliers.contains(&p_gcp));
}

#[test]
fn too_few_survivors_abort_the_run() {
    let cameras = vec![pinhole(Vec3::zeros()), pinhole(Vec3::new(1.0, 0.0, 0.0))];
    let good = Vec3::new(0.5, 0.5, 10.0);
    let bad = Vec3::new(-0.4, 0.2, 12.0);

    let mut cnet = ControlNetwork::new(2);
    let p_good = cnet.add_point(good, PointKind::Tie, Vec3::zeros());
    for (icam, cam) in cameras.iter().enumerate() {
        let pix = cam.project(&Pt3::from(good)).unwrap();
        cnet.add_observation(icam, p_good, pix, Vec2::new(1.0, 1.0)).unwrap();
    }
    let p_bad = cnet.add_point(bad, PointKind::Tie, Vec3::zeros());
    cnet.add_observation(0, p_bad, cameras[0].project(&Pt3::from(bad)).unwrap(), Vec2::new(1.0, 1.0))
        .unwrap();
    cnet.add_observation(
        1,
        p_bad,
        cameras[1].project(&Pt3::from(bad)).unwrap() + Vec2::new(50.0, 0.0),
        Vec2::new(1.0, 1.0),
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let match_path = dir.path().join("a__b.match");
    write_match_file(
        &match_path,
        &[MatchRecord::from_pixel(Vec2::new(0.0, 0.0))],
        &[MatchRecord::from_pixel(Vec2::new(0.0, 0.0))],
    )
    .unwrap();

    let mut options = base_options(dir.path());
    options.num_passes = 2;
    options.min_matches = 2;
    options.fixed_camera_indices = [0, 1].into_iter().collect();

    let err = run_passes(
        RunInputs {
            cameras,
            camera_names: names(2),
            cnet,
            match_files: BTreeMap::from([((0, 1), match_path)]),
            heights_dem: None,
            terrain: Vec::new(),
        },
        &options,
    )
    .unwrap_err();
    assert!(
        err.to_string().contains("too few points remain"),
        "unexpected error: {:#}",
        err
    );
}

#[test]
fn solve_intrinsics_absorbs_multipliers_into_shared_intrinsics() {
    let cameras = vec![pinhole(Vec3::zeros()), pinhole(Vec3::new(1.0, 0.0, 0.0))];
    let world: Vec<Vec3> = (0..5)
        .map(|i| Vec3::new(0.2 * i as Real, 0.3 * i as Real, 10.0 + i as Real))
        .collect();
    let cnet = perfect_network(&cameras, &world);

    let dir = tempfile::tempdir().unwrap();
    let mut options = base_options(dir.path());
    options.solve_intrinsics = true;
    options.intrinsics_to_float = ["focal_length".to_string()].into_iter().collect();
    options.fixed_camera_indices = [0, 1].into_iter().collect();

    let outputs = run_passes(
        RunInputs {
            cameras: cameras.clone(),
            camera_names: names(2),
            cnet,
            match_files: BTreeMap::new(),
            heights_dem: None,
            terrain: Vec::new(),
        },
        &options,
    )
    .unwrap();

    // All cameras share one absorbed intrinsics value, and on perfect data
    // the focal length stays put.
    assert_eq!(outputs.cameras[0].intrinsics, outputs.cameras[1].intrinsics);
    assert!(
        (outputs.cameras[0].intrinsics.focal - 1000.0).abs() < 1e-6,
        "focal drifted to {}",
        outputs.cameras[0].intrinsics.focal
    );
}
