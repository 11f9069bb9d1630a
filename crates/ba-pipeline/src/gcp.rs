//! Ground control point files.
//!
//! Text format, one point per line, `#` comments allowed:
//!
//! ```text
//! id lat lon height sigma_lat sigma_lon sigma_h [image u v sigma_u sigma_v]*
//! ```
//!
//! Note the lat/lon order: the file is latitude-first while everything
//! internal is longitude-first.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ba_core::{Real, Vec2, Vec3};

/// One pixel measurement attached to a GCP.
#[derive(Debug, Clone, PartialEq)]
pub struct GcpMeasure {
    pub image: String,
    pub pixel: Vec2,
    pub sigma: Vec2,
}

/// One surveyed ground control point.
#[derive(Debug, Clone, PartialEq)]
pub struct GcpRecord {
    pub id: String,
    /// `(lat_deg, lon_deg, height)` exactly as read from the file.
    pub lat_lon_height: Vec3,
    /// `(sigma_lat, sigma_lon, sigma_h)` as read from the file.
    pub sigma: Vec3,
    pub measures: Vec<GcpMeasure>,
}

/// Read every record from one GCP file.
pub fn read_gcp_file(path: &Path) -> Result<Vec<GcpRecord>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read GCP file {}", path.display()))?;

    let mut records = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            bail!(
                "{}:{}: GCP line needs at least 7 fields, got {}",
                path.display(),
                lineno + 1,
                fields.len()
            );
        }
        let num = |idx: usize| -> Result<Real> {
            fields[idx].parse::<Real>().with_context(|| {
                format!("{}:{}: bad number {:?}", path.display(), lineno + 1, fields[idx])
            })
        };

        let mut record = GcpRecord {
            id: fields[0].to_string(),
            lat_lon_height: Vec3::new(num(1)?, num(2)?, num(3)?),
            sigma: Vec3::new(num(4)?, num(5)?, num(6)?),
            measures: Vec::new(),
        };

        let rest = &fields[7..];
        if rest.len() % 5 != 0 {
            bail!(
                "{}:{}: image measurements come in groups of 5 (image u v sigma_u sigma_v)",
                path.display(),
                lineno + 1
            );
        }
        for group in rest.chunks(5) {
            let val = |s: &str| -> Result<Real> {
                s.parse::<Real>().with_context(|| {
                    format!("{}:{}: bad number {:?}", path.display(), lineno + 1, s)
                })
            };
            record.measures.push(GcpMeasure {
                image: group[0].to_string(),
                pixel: Vec2::new(val(group[1])?, val(group[2])?),
                sigma: Vec2::new(val(group[3])?, val(group[4])?),
            });
        }
        records.push(record);
    }
    Ok(records)
}

/// Write records in the same format `read_gcp_file` accepts.
pub fn write_gcp_file(path: &Path, records: &[GcpRecord]) -> Result<()> {
    let mut out = String::new();
    for r in records {
        out.push_str(&format!(
            "{} {} {} {} {} {} {}",
            r.id,
            r.lat_lon_height.x,
            r.lat_lon_height.y,
            r.lat_lon_height.z,
            r.sigma.x,
            r.sigma.y,
            r.sigma.z
        ));
        for m in &r.measures {
            out.push_str(&format!(
                " {} {} {} {} {}",
                m.image, m.pixel.x, m.pixel.y, m.sigma.x, m.sigma.y
            ));
        }
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("failed to write GCP file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_points_with_and_without_measures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.gcp");
        fs::write(
            &path,
            "# survey 2024\n\
             1 37.5 -122.2 15.0 0.1 0.1 0.5 left.tif 100.5 200.25 1 1 right.tif 140 210 1 1\n\
             2 37.6 -122.3 18.0 0.2 0.2 0.4\n",
        )
        .unwrap();

        let records = read_gcp_file(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].measures.len(), 2);
        assert_eq!(records[0].measures[1].image, "right.tif");
        assert_eq!(records[1].measures.len(), 0);
        assert!((records[0].lat_lon_height.x - 37.5).abs() < 1e-12);
    }

    #[test]
    fn truncated_measure_group_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.gcp");
        fs::write(&path, "1 37.5 -122.2 15.0 0.1 0.1 0.5 left.tif 100.5\n").unwrap();
        assert!(read_gcp_file(&path).is_err());
    }

    #[test]
    fn write_read_roundtrip() {
        let records = vec![GcpRecord {
            id: "7".to_string(),
            lat_lon_height: Vec3::new(1.5, 2.5, 3.5),
            sigma: Vec3::new(1.0, 1.0, 1.0),
            measures: vec![GcpMeasure {
                image: "img.tif".to_string(),
                pixel: Vec2::new(4.0, 5.0),
                sigma: Vec2::new(1.0, 1.0),
            }],
        }];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rt.gcp");
        write_gcp_file(&path, &records).unwrap();
        assert_eq!(read_gcp_file(&path).unwrap(), records);
    }
}
