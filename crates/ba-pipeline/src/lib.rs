//! The multi-pass bundle adjustment workflow.
//!
//! This crate owns everything around the optimizer: the option surface,
//! control network construction, on-disk formats (match / GCP /
//! camera-position / adjustment / transform files), the pre-solve aligner,
//! the map-projection bridge, the multi-pass outlier loop and the residual
//! analyzer.

pub mod adjustments;
pub mod align;
pub mod analyzer;
pub mod camera_io;
pub mod camera_positions;
pub mod cnet_build;
pub mod driver;
pub mod gcp;
pub mod kml;
pub mod mapproj;
pub mod match_file;
pub mod options;
pub mod pairs;
pub mod terrain;

pub use driver::{run_passes, RunInputs, RunOutputs};
pub use options::{BaOptions, ConfigError, DisparityFilterParams, OutlierParams};
