//! The run configuration surface.
//!
//! `BaOptions` carries every recognized option; validation happens once,
//! up front, and fails with a single descriptive message. There is no
//! process-wide settings object: the options value is passed explicitly to
//! every component that needs it.

use std::collections::BTreeSet;
use std::path::PathBuf;

use ba_core::{Datum, Real};
use ba_optim::RobustKernel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors reported before any work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing output prefix")]
    MissingOutputPrefix,
    #[error("{0}")]
    BadCostFunction(String),
    #[error("the {0} weight must be non-negative")]
    NegativeWeight(&'static str),
    #[error("expecting at least one bundle adjust pass")]
    NoPasses,
    #[error("remove-outliers-params must be 'pct factor err1 err2' with err1 <= err2")]
    BadOutlierParams,
    #[error("cannot specify both the overlap limit and the overlap list")]
    OverlapConflict,
    #[error("when using a camera position file, the csv-format option must be set")]
    MissingCsvFormat,
    #[error("when ground control points or a camera position file are used, the datum must be specified")]
    MissingDatum,
    #[error("to float only certain intrinsics, solve-intrinsics must be on")]
    IntrinsicsToFloatWithoutSolve,
    #[error("when using a reference terrain, must specify a list of disparities")]
    MissingDisparityList,
    #[error("when using a reference terrain, must specify max-disp-error as a positive value")]
    BadMaxDispError,
    #[error("when using a reference terrain, the datum must be specified")]
    TerrainNeedsDatum,
    #[error("unknown datum: {0}")]
    BadDatum(String),
}

/// Outlier-bracket parameters `(pct, factor, err1, err2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierParams {
    pub pct: Real,
    pub factor: Real,
    pub err1: Real,
    pub err2: Real,
}

impl Default for OutlierParams {
    fn default() -> Self {
        Self {
            pct: 75.0,
            factor: 3.0,
            err1: 2.0,
            err2: 3.0,
        }
    }
}

/// Disparity-band filter parameters `(pct, factor)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisparityFilterParams {
    pub pct: Real,
    pub factor: Real,
}

impl Default for DisparityFilterParams {
    fn default() -> Self {
        Self {
            pct: 90.0,
            factor: 3.0,
        }
    }
}

/// All recognized options for one adjustment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaOptions {
    pub out_prefix: String,

    pub cost_function: String,
    pub robust_threshold: Real,
    pub camera_weight: Real,
    pub rotation_weight: Real,
    pub translation_weight: Real,
    pub overlap_exponent: Real,

    pub num_passes: usize,
    pub remove_outliers_params: OutlierParams,
    pub remove_outliers_by_disparity_params: DisparityFilterParams,
    pub min_matches: usize,
    pub min_triangulation_angle: Real,

    pub max_iterations: usize,
    pub parameter_tolerance: Real,

    pub solve_intrinsics: bool,
    pub intrinsics_to_float: BTreeSet<String>,
    pub fix_gcp_xyz: bool,
    pub fixed_camera_indices: BTreeSet<usize>,

    pub heights_from_dem: Option<PathBuf>,
    pub use_lon_lat_height_gcp_error: bool,

    pub initial_transform: Option<PathBuf>,
    pub input_adjustments_prefix: Option<String>,

    pub mapprojected_data: Vec<PathBuf>,
    pub gcp_data: Vec<PathBuf>,

    pub reference_terrain: Option<PathBuf>,
    pub disparity_list: Vec<PathBuf>,
    pub max_disp_error: Real,
    pub max_num_reference_points: usize,

    pub datum: Option<String>,
    pub semi_major_axis: Real,
    pub semi_minor_axis: Real,

    pub camera_positions: Option<PathBuf>,
    pub csv_format: String,
    pub position_filter_dist: Real,

    pub overlap_limit: usize,
    pub overlap_list: Option<PathBuf>,

    pub save_cnet_as_csv: bool,
    pub session_type: String,
    pub num_threads: usize,
}

impl Default for BaOptions {
    fn default() -> Self {
        Self {
            out_prefix: String::new(),
            cost_function: "cauchy".to_string(),
            robust_threshold: 0.5,
            camera_weight: 1.0,
            rotation_weight: 0.0,
            translation_weight: 0.0,
            overlap_exponent: 0.0,
            num_passes: 1,
            remove_outliers_params: OutlierParams::default(),
            remove_outliers_by_disparity_params: DisparityFilterParams::default(),
            min_matches: 30,
            min_triangulation_angle: 0.1,
            max_iterations: 1000,
            parameter_tolerance: 1e-8,
            solve_intrinsics: false,
            intrinsics_to_float: BTreeSet::new(),
            fix_gcp_xyz: false,
            fixed_camera_indices: BTreeSet::new(),
            heights_from_dem: None,
            use_lon_lat_height_gcp_error: false,
            initial_transform: None,
            input_adjustments_prefix: None,
            mapprojected_data: Vec::new(),
            gcp_data: Vec::new(),
            reference_terrain: None,
            disparity_list: Vec::new(),
            max_disp_error: -1.0,
            max_num_reference_points: 100_000_000,
            datum: None,
            semi_major_axis: 0.0,
            semi_minor_axis: 0.0,
            camera_positions: None,
            csv_format: String::new(),
            position_filter_dist: -1.0,
            overlap_limit: 0,
            overlap_list: None,
            save_cnet_as_csv: false,
            session_type: "pinhole".to_string(),
            num_threads: 0,
        }
    }
}

impl BaOptions {
    /// Validate the option surface; called once before any work.
    ///
    /// `have_gcp` tells whether GCP files were supplied on the command line.
    pub fn validate(&self, have_gcp: bool) -> Result<(), ConfigError> {
        if self.out_prefix.is_empty() {
            return Err(ConfigError::MissingOutputPrefix);
        }
        self.kernel().map_err(|e| ConfigError::BadCostFunction(e.to_string()))?;
        if self.camera_weight < 0.0 {
            return Err(ConfigError::NegativeWeight("camera"));
        }
        if self.rotation_weight < 0.0 {
            return Err(ConfigError::NegativeWeight("rotation"));
        }
        if self.translation_weight < 0.0 {
            return Err(ConfigError::NegativeWeight("translation"));
        }
        if self.num_passes == 0 {
            return Err(ConfigError::NoPasses);
        }
        let op = &self.remove_outliers_params;
        if !(0.0..=100.0).contains(&op.pct) || op.factor <= 0.0 || op.err1 > op.err2 {
            return Err(ConfigError::BadOutlierParams);
        }
        if self.overlap_limit > 0 && self.overlap_list.is_some() {
            return Err(ConfigError::OverlapConflict);
        }
        if self.camera_positions.is_some() && self.csv_format.is_empty() {
            return Err(ConfigError::MissingCsvFormat);
        }
        if !self.intrinsics_to_float.is_empty() && !self.solve_intrinsics {
            return Err(ConfigError::IntrinsicsToFloatWithoutSolve);
        }

        let have_datum =
            self.datum.is_some() || (self.semi_major_axis > 0.0 && self.semi_minor_axis > 0.0);
        if (have_gcp || self.camera_positions.is_some() || self.use_lon_lat_height_gcp_error)
            && !have_datum
        {
            return Err(ConfigError::MissingDatum);
        }
        if let Some(name) = &self.datum {
            Datum::from_name(name).map_err(|_| ConfigError::BadDatum(name.clone()))?;
        }

        if self.reference_terrain.is_some() {
            if self.disparity_list.is_empty() {
                return Err(ConfigError::MissingDisparityList);
            }
            if self.max_disp_error <= 0.0 {
                return Err(ConfigError::BadMaxDispError);
            }
            if !have_datum {
                return Err(ConfigError::TerrainNeedsDatum);
            }
        }
        Ok(())
    }

    /// The configured robust kernel.
    pub fn kernel(&self) -> anyhow::Result<RobustKernel> {
        RobustKernel::from_config(&self.cost_function, self.robust_threshold)
    }

    /// The configured datum, if any.
    pub fn resolve_datum(&self) -> anyhow::Result<Option<Datum>> {
        if let Some(name) = &self.datum {
            return Ok(Some(Datum::from_name(name)?));
        }
        if self.semi_major_axis > 0.0 && self.semi_minor_axis > 0.0 {
            return Ok(Some(Datum::from_semi_axes(
                self.semi_major_axis,
                self.semi_minor_axis,
            )?));
        }
        Ok(None)
    }

    /// Solver worker threads; ISIS sessions are not thread-safe and pin to 1.
    pub fn effective_num_threads(&self) -> usize {
        if self.session_type.eq_ignore_ascii_case("isis") {
            1
        } else if self.num_threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.num_threads
        }
    }

    pub fn solve_options(&self) -> ba_optim::SolveOptions {
        ba_optim::SolveOptions {
            max_iterations: self.max_iterations,
            parameter_tolerance: self.parameter_tolerance,
            verbosity: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BaOptions {
        BaOptions {
            out_prefix: "run/out".to_string(),
            ..BaOptions::default()
        }
    }

    #[test]
    fn defaults_validate() {
        base().validate(false).unwrap();
    }

    #[test]
    fn missing_prefix_rejected() {
        let opts = BaOptions::default();
        assert!(matches!(
            opts.validate(false),
            Err(ConfigError::MissingOutputPrefix)
        ));
    }

    #[test]
    fn unknown_cost_function_rejected() {
        let mut opts = base();
        opts.cost_function = "tukey".to_string();
        assert!(matches!(
            opts.validate(false),
            Err(ConfigError::BadCostFunction(_))
        ));
    }

    #[test]
    fn overlap_conflict_rejected() {
        let mut opts = base();
        opts.overlap_limit = 5;
        opts.overlap_list = Some(PathBuf::from("pairs.txt"));
        assert!(matches!(
            opts.validate(false),
            Err(ConfigError::OverlapConflict)
        ));
    }

    #[test]
    fn gcp_without_datum_rejected() {
        let opts = base();
        assert!(matches!(opts.validate(true), Err(ConfigError::MissingDatum)));
    }

    #[test]
    fn semi_axes_stand_in_for_datum() {
        let mut opts = base();
        opts.semi_major_axis = 6378137.0;
        opts.semi_minor_axis = 6356752.3;
        opts.validate(true).unwrap();
        assert!(opts.resolve_datum().unwrap().is_some());
    }

    #[test]
    fn intrinsics_to_float_requires_solving() {
        let mut opts = base();
        opts.intrinsics_to_float.insert("focal_length".to_string());
        assert!(matches!(
            opts.validate(false),
            Err(ConfigError::IntrinsicsToFloatWithoutSolve)
        ));
    }

    #[test]
    fn reference_terrain_requires_support_options() {
        let mut opts = base();
        opts.reference_terrain = Some(PathBuf::from("dem.asc"));
        opts.datum = Some("WGS_1984".to_string());
        assert!(matches!(
            opts.validate(false),
            Err(ConfigError::MissingDisparityList)
        ));
        opts.disparity_list.push(PathBuf::from("d.asc"));
        assert!(matches!(
            opts.validate(false),
            Err(ConfigError::BadMaxDispError)
        ));
        opts.max_disp_error = 2.0;
        opts.validate(false).unwrap();
    }

    #[test]
    fn isis_sessions_pin_to_one_thread() {
        let mut opts = base();
        opts.session_type = "isis".to_string();
        opts.num_threads = 8;
        assert_eq!(opts.effective_num_threads(), 1);
    }
}
