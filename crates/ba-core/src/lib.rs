//! Core math and geometry primitives for `bundle-rs`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`, `Pt3`, ...),
//! - the geodetic datum and ECEF conversions (`Datum`),
//! - the pinhole camera model used by the adjustment engine,
//! - masked grid rasters for DEM and disparity sampling.
//!
//! Higher-level algorithms live in `ba-linear`, `ba-optim` and
//! `ba-pipeline`; the `bundle-adjust` binary is in `ba-cli`.

/// Linear algebra type aliases.
pub mod math;
/// Reference ellipsoids and geodetic <-> ECEF conversions.
pub mod datum;
/// Camera models.
pub mod camera;
/// The control network data model.
pub mod cnet;
/// Masked grid rasters with affine lon/lat georeferencing.
pub mod raster;

pub use camera::{Extrinsics, Intrinsics, PinholeCamera};
pub use cnet::{ControlNetwork, Observation, PointKind, WorldPoint};
pub use datum::Datum;
pub use math::*;
pub use raster::{DisparityRaster, GeoTransform, GridRaster};
