//! Camera position hint files (CSV).
//!
//! The `csv-format` string names the columns, e.g.
//! `"file, lon, lat, height_above_datum"` or `"file, x, y, z"`. Geodetic
//! columns require a datum; projected easting/northing columns are not
//! supported and rejected up front.

use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use ba_core::{Datum, Real, Vec3};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    File,
    Lon,
    Lat,
    Height,
    EcefX,
    EcefY,
    EcefZ,
}

/// A parsed camera-position record.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPosition {
    pub file: String,
    pub xyz: Vec3,
}

fn parse_format(format: &str) -> Result<Vec<Column>> {
    let mut columns = Vec::new();
    for name in format.split(',').map(|s| s.trim()) {
        let col = match name {
            "file" => Column::File,
            "lon" => Column::Lon,
            "lat" => Column::Lat,
            "height_above_datum" | "height" => Column::Height,
            "x" => Column::EcefX,
            "y" => Column::EcefY,
            "z" => Column::EcefZ,
            "easting" | "northing" => bail!(
                "projected csv columns ({}) are not supported; provide lon/lat/height or ECEF x/y/z",
                name
            ),
            other => bail!("unknown csv-format column: {:?}", other),
        };
        columns.push(col);
    }
    ensure!(
        columns.contains(&Column::File),
        "csv-format must include a file column"
    );
    let geodetic = columns.contains(&Column::Lon)
        && columns.contains(&Column::Lat)
        && columns.contains(&Column::Height);
    let ecef = columns.contains(&Column::EcefX)
        && columns.contains(&Column::EcefY)
        && columns.contains(&Column::EcefZ);
    ensure!(
        geodetic || ecef,
        "csv-format must include lon/lat/height or x/y/z columns"
    );
    Ok(columns)
}

/// Read the camera-position file into ECEF records.
pub fn read_camera_positions(
    path: &Path,
    format: &str,
    datum: Option<&Datum>,
) -> Result<Vec<CameraPosition>> {
    let columns = parse_format(format)?;
    let geodetic = columns.contains(&Column::Lon);
    if geodetic {
        ensure!(
            datum.is_some(),
            "geodetic camera positions require a datum"
        );
    }

    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read camera positions {}", path.display()))?;

    let mut records = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        ensure!(
            fields.len() >= columns.len(),
            "{}:{}: expected {} fields, got {}",
            path.display(),
            lineno + 1,
            columns.len(),
            fields.len()
        );

        let mut file = String::new();
        let mut lon = 0.0;
        let mut lat = 0.0;
        let mut height = 0.0;
        let mut xyz = Vec3::zeros();
        for (col, field) in columns.iter().zip(fields.iter()) {
            if *col == Column::File {
                file = field.to_string();
                continue;
            }
            let v: Real = field.parse().with_context(|| {
                format!("{}:{}: bad number {:?}", path.display(), lineno + 1, field)
            })?;
            match col {
                Column::Lon => lon = v,
                Column::Lat => lat = v,
                Column::Height => height = v,
                Column::EcefX => xyz.x = v,
                Column::EcefY => xyz.y = v,
                Column::EcefZ => xyz.z = v,
                Column::File => unreachable!(),
            }
        }

        let xyz = if geodetic {
            datum.unwrap().geodetic_to_cartesian(&Vec3::new(lon, lat, height))
        } else {
            xyz
        };
        records.push(CameraPosition { file, xyz });
    }
    Ok(records)
}

/// Pair each image with its position record, matching when the record's file
/// field is contained in the image path. Unmatched images get `None` and a
/// warning.
pub fn match_camera_positions(
    images: &[String],
    records: &[CameraPosition],
) -> Vec<Option<Vec3>> {
    images
        .iter()
        .map(|image| {
            match records.iter().find(|r| image.contains(&r.file)) {
                Some(r) => Some(r.xyz),
                None => {
                    warn!("camera file {} not found in camera position file", image);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geodetic_format_converts_to_ecef() {
        let datum = Datum::from_name("WGS_1984").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos.csv");
        fs::write(&path, "img1.tif, 10.0, 45.0, 200.0\nimg2.tif, 11.0, 45.5, 250.0\n").unwrap();

        let recs =
            read_camera_positions(&path, "file, lon, lat, height_above_datum", Some(&datum))
                .unwrap();
        assert_eq!(recs.len(), 2);
        let expect = datum.geodetic_to_cartesian(&Vec3::new(10.0, 45.0, 200.0));
        assert!((recs[0].xyz - expect).norm() < 1e-9);
    }

    #[test]
    fn ecef_format_needs_no_datum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos.csv");
        fs::write(&path, "a.tif, 1.0, 2.0, 3.0\n").unwrap();
        let recs = read_camera_positions(&path, "file, x, y, z", None).unwrap();
        assert_eq!(recs[0].xyz, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn projected_columns_rejected() {
        assert!(parse_format("file, easting, northing, height").is_err());
    }

    #[test]
    fn containment_matching() {
        let records = vec![CameraPosition {
            file: "img1".to_string(),
            xyz: Vec3::new(1.0, 1.0, 1.0),
        }];
        let matched =
            match_camera_positions(&["data/img1.tif".to_string(), "data/img2.tif".to_string()], &records);
        assert!(matched[0].is_some());
        assert!(matched[1].is_none());
    }
}
