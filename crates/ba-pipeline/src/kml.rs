//! KML output of surviving world points.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use ba_core::{Datum, Real, Vec3};
use log::{info, warn};
use nalgebra::DVector;

const POINT_ICON: &str = "http://maps.google.com/mapfiles/kml/shapes/placemark_circle.png";

/// Subsample stride: every 30th point, relaxed so at least 20 points
/// survive for small networks.
fn kml_point_skip(num_points: usize) -> usize {
    const MIN_KML_POINTS: usize = 20;
    let mut skip = 30usize;
    if num_points / skip < MIN_KML_POINTS {
        skip = num_points / MIN_KML_POINTS;
    }
    skip.max(1)
}

/// Write one Placemark per sampled surviving point at its geodetic
/// position. Skipped entirely (with a warning) when no datum is configured.
pub fn write_points_kml(
    path: &Path,
    name: &str,
    datum: Option<&Datum>,
    points: &[DVector<Real>],
    outliers: &BTreeSet<usize>,
) -> Result<()> {
    let Some(datum) = datum else {
        warn!("no datum specified, can't write file: {}", path.display());
        return Ok(());
    };

    let skip = kml_point_skip(points.len());
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n");
    writeln!(out, "<Document><name>{}</name>", name)?;
    writeln!(
        out,
        "<Style id=\"point\"><IconStyle><Icon><href>{}</href></Icon></IconStyle></Style>",
        POINT_ICON
    )?;

    for p in (0..points.len()).step_by(skip) {
        if outliers.contains(&p) {
            continue;
        }
        let v = &points[p];
        let llh = datum.cartesian_to_geodetic(&Vec3::new(v[0], v[1], v[2]));
        writeln!(
            out,
            "<Placemark><styleUrl>#point</styleUrl>\
             <Point><extrude>1</extrude><coordinates>{},{},{}</coordinates></Point>\
             </Placemark>",
            llh.x, llh.y, llh.z
        )?;
    }
    out.push_str("</Document>\n</kml>\n");

    info!("writing: {}", path.display());
    std::fs::write(path, out)?;
    Ok(())
}
