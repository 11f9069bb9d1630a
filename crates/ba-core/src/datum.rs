//! Reference ellipsoids and geodetic <-> ECEF conversions.
//!
//! Longitude and latitude are in degrees, heights and Cartesian coordinates
//! in meters. The conversions are also available generically over
//! [`nalgebra::RealField`] so residual factors can differentiate through
//! them.

use anyhow::{bail, ensure, Result};
use nalgebra::{RealField, Vector3};
use serde::{Deserialize, Serialize};

use crate::math::{Real, Vec3};

/// A reference ellipsoid for converting between ECEF and geodetic coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub name: String,
    /// Semi-major axis in meters.
    pub semi_major: Real,
    /// Semi-minor axis in meters.
    pub semi_minor: Real,
}

impl Datum {
    /// Look up a well-known datum by name.
    ///
    /// Accepted: `WGS_1984` / `WGS84` / `Earth`, `D_MOON` / `Moon`,
    /// `D_MARS` / `Mars`.
    pub fn from_name(name: &str) -> Result<Self> {
        let (canonical, a, b) = match name.to_lowercase().as_str() {
            "wgs_1984" | "wgs84" | "earth" => ("WGS_1984", 6378137.0, 6356752.314245),
            "d_moon" | "moon" => ("D_MOON", 1737400.0, 1737400.0),
            "d_mars" | "mars" => ("D_MARS", 3396190.0, 3396190.0),
            _ => bail!(
                "unknown datum: {} (options: WGS_1984, D_MOON, D_MARS)",
                name
            ),
        };
        Ok(Self {
            name: canonical.to_string(),
            semi_major: a,
            semi_minor: b,
        })
    }

    /// Build a datum from explicit semi-axes.
    pub fn from_semi_axes(semi_major: Real, semi_minor: Real) -> Result<Self> {
        ensure!(
            semi_major > 0.0 && semi_minor > 0.0 && semi_minor <= semi_major,
            "invalid ellipsoid semi-axes: {} / {}",
            semi_major,
            semi_minor
        );
        Ok(Self {
            name: "User Specified Datum".to_string(),
            semi_major,
            semi_minor,
        })
    }

    /// Convert `(lon_deg, lat_deg, height)` to ECEF meters.
    pub fn geodetic_to_cartesian(&self, llh: &Vec3) -> Vec3 {
        geodetic_to_cartesian_generic(self.semi_major, self.semi_minor, llh.x, llh.y, llh.z)
    }

    /// Convert ECEF meters to `(lon_deg, lat_deg, height)`.
    pub fn cartesian_to_geodetic(&self, xyz: &Vec3) -> Vec3 {
        cartesian_to_geodetic_generic(self.semi_major, self.semi_minor, xyz.x, xyz.y, xyz.z)
    }
}

/// Geodetic to ECEF, generic over the scalar for autodiff use.
pub fn geodetic_to_cartesian_generic<T: RealField>(
    semi_major: Real,
    semi_minor: Real,
    lon_deg: T,
    lat_deg: T,
    height: T,
) -> Vector3<T> {
    let a = T::from_f64(semi_major).unwrap();
    let e2 = T::from_f64(first_eccentricity_sq(semi_major, semi_minor)).unwrap();
    let deg = T::from_f64(std::f64::consts::PI / 180.0).unwrap();

    let lon = lon_deg * deg.clone();
    let lat = lat_deg * deg;
    let sin_lat = lat.clone().sin();
    let cos_lat = lat.clone().cos();
    let n = a / (T::one() - e2.clone() * sin_lat.clone() * sin_lat.clone()).sqrt();

    let x = (n.clone() + height.clone()) * cos_lat.clone() * lon.clone().cos();
    let y = (n.clone() + height.clone()) * cos_lat * lon.sin();
    let z = (n * (T::one() - e2) + height) * sin_lat;
    Vector3::new(x, y, z)
}

/// ECEF to geodetic via Bowring's closed-form approximation, generic over the
/// scalar for autodiff use. Accurate to well below a millimeter for points
/// near the ellipsoid surface.
pub fn cartesian_to_geodetic_generic<T: RealField>(
    semi_major: Real,
    semi_minor: Real,
    x: T,
    y: T,
    z: T,
) -> Vector3<T> {
    let a = T::from_f64(semi_major).unwrap();
    let b = T::from_f64(semi_minor).unwrap();
    let e2 = T::from_f64(first_eccentricity_sq(semi_major, semi_minor)).unwrap();
    let ep2 = T::from_f64(second_eccentricity_sq(semi_major, semi_minor)).unwrap();
    let rad2deg = T::from_f64(180.0 / std::f64::consts::PI).unwrap();

    let p = (x.clone() * x.clone() + y.clone() * y.clone()).sqrt();
    let theta = (z.clone() * a.clone()).atan2(p.clone() * b.clone());
    let sin_t = theta.clone().sin();
    let cos_t = theta.cos();

    let lat = (z + ep2 * b * sin_t.clone() * sin_t.clone() * sin_t)
        .atan2(p.clone() - e2.clone() * a.clone() * cos_t.clone() * cos_t.clone() * cos_t);
    let lon = y.atan2(x);

    let sin_lat = lat.clone().sin();
    let cos_lat = lat.clone().cos();
    let n = a / (T::one() - e2 * sin_lat.clone() * sin_lat).sqrt();
    let h = p / cos_lat - n;

    Vector3::new(lon * rad2deg.clone(), lat * rad2deg, h)
}

fn first_eccentricity_sq(a: Real, b: Real) -> Real {
    1.0 - (b * b) / (a * a)
}

fn second_eccentricity_sq(a: Real, b: Real) -> Real {
    (a * a) / (b * b) - 1.0
}
