//! Binary interest-point match files.
//!
//! A match file holds two equal-length record lists (left image, then right
//! image), little-endian: a `u64` record count followed by the records. A
//! record is `f64 x, f64 y, i32 ix, i32 iy, f32 orientation, f32 scale,
//! f32 interest, u8 polarity, u32 octave, u32 ndesc, f64 desc[ndesc]`.
//! Rewrites preserve records verbatim except for dropped rows.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use ba_core::{Real, Vec2};

/// One interest point, as produced by the external matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub x: Real,
    pub y: Real,
    pub ix: i32,
    pub iy: i32,
    pub orientation: f32,
    pub scale: f32,
    pub interest: f32,
    pub polarity: bool,
    pub octave: u32,
    pub descriptor: Vec<Real>,
}

impl MatchRecord {
    /// A bare record at a pixel location, used when synthesizing matches.
    pub fn from_pixel(pixel: Vec2) -> Self {
        Self {
            x: pixel.x,
            y: pixel.y,
            ix: pixel.x.round() as i32,
            iy: pixel.y.round() as i32,
            orientation: 0.0,
            scale: 1.0,
            interest: 0.0,
            polarity: false,
            octave: 0,
            descriptor: Vec::new(),
        }
    }

    pub fn pixel(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

/// Conventional match file path for an image pair under an output prefix.
pub fn match_file_name(out_prefix: &str, image1: &Path, image2: &Path) -> PathBuf {
    let stem = |p: &Path| {
        p.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    };
    PathBuf::from(format!(
        "{}-{}__{}.match",
        out_prefix,
        stem(image1),
        stem(image2)
    ))
}

/// Read both record lists from a match file.
pub fn read_match_file(path: &Path) -> Result<(Vec<MatchRecord>, Vec<MatchRecord>)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open match file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let count = read_u64(&mut reader)? as usize;
    let mut left = Vec::with_capacity(count);
    for _ in 0..count {
        left.push(read_record(&mut reader)?);
    }
    let right_count = read_u64(&mut reader)? as usize;
    ensure!(
        right_count == count,
        "match file {} has {} left and {} right records",
        path.display(),
        count,
        right_count
    );
    let mut right = Vec::with_capacity(count);
    for _ in 0..count {
        right.push(read_record(&mut reader)?);
    }
    Ok((left, right))
}

/// Write both record lists to a match file.
pub fn write_match_file(path: &Path, left: &[MatchRecord], right: &[MatchRecord]) -> Result<()> {
    ensure!(
        left.len() == right.len(),
        "match lists differ in length: {} vs {}",
        left.len(),
        right.len()
    );
    let file = File::create(path)
        .with_context(|| format!("failed to create match file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    for list in [left, right] {
        writer.write_all(&(list.len() as u64).to_le_bytes())?;
        for rec in list {
            write_record(&mut writer, rec)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn read_record(reader: &mut impl Read) -> Result<MatchRecord> {
    let x = read_f64(reader)?;
    let y = read_f64(reader)?;
    let ix = read_i32(reader)?;
    let iy = read_i32(reader)?;
    let orientation = read_f32(reader)?;
    let scale = read_f32(reader)?;
    let interest = read_f32(reader)?;
    let polarity = read_u8(reader)? != 0;
    let octave = read_u32(reader)?;
    let ndesc = read_u32(reader)? as usize;
    let mut descriptor = Vec::with_capacity(ndesc);
    for _ in 0..ndesc {
        descriptor.push(read_f64(reader)?);
    }
    Ok(MatchRecord {
        x,
        y,
        ix,
        iy,
        orientation,
        scale,
        interest,
        polarity,
        octave,
        descriptor,
    })
}

fn write_record(writer: &mut impl Write, rec: &MatchRecord) -> Result<()> {
    writer.write_all(&rec.x.to_le_bytes())?;
    writer.write_all(&rec.y.to_le_bytes())?;
    writer.write_all(&rec.ix.to_le_bytes())?;
    writer.write_all(&rec.iy.to_le_bytes())?;
    writer.write_all(&rec.orientation.to_le_bytes())?;
    writer.write_all(&rec.scale.to_le_bytes())?;
    writer.write_all(&rec.interest.to_le_bytes())?;
    writer.write_all(&[rec.polarity as u8])?;
    writer.write_all(&rec.octave.to_le_bytes())?;
    writer.write_all(&(rec.descriptor.len() as u32).to_le_bytes())?;
    for d in &rec.descriptor {
        writer.write_all(&d.to_le_bytes())?;
    }
    Ok(())
}

macro_rules! read_le {
    ($name:ident, $ty:ty) => {
        fn $name(reader: &mut impl Read) -> Result<$ty> {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            reader
                .read_exact(&mut buf)
                .context("truncated match file")?;
            Ok(<$ty>::from_le_bytes(buf))
        }
    };
}

read_le!(read_f64, f64);
read_le!(read_f32, f32);
read_le!(read_i32, i32);
read_le!(read_u32, u32);
read_le!(read_u64, u64);

fn read_u8(reader: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).context("truncated match file")?;
    Ok(buf[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> (Vec<MatchRecord>, Vec<MatchRecord>) {
        let mut left = MatchRecord::from_pixel(Vec2::new(10.25, 20.5));
        left.orientation = 0.7;
        left.octave = 3;
        left.descriptor = vec![0.1, 0.2, 0.3];
        let right = MatchRecord::from_pixel(Vec2::new(12.0, 21.0));
        (vec![left.clone(), right.clone()], vec![right, left])
    }

    #[test]
    fn roundtrip_preserves_records() {
        let (left, right) = sample_records();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a__b.match");

        write_match_file(&path, &left, &right).unwrap();
        let (rl, rr) = read_match_file(&path).unwrap();
        assert_eq!(rl, left);
        assert_eq!(rr, right);
    }

    #[test]
    fn unequal_lists_rejected() {
        let (left, _) = sample_records();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.match");
        assert!(write_match_file(&path, &left, &left[..1]).is_err());
    }

    #[test]
    fn file_name_uses_stems() {
        let name = match_file_name(
            "run/out",
            Path::new("data/img_a.tif"),
            Path::new("data/img_b.tif"),
        );
        assert_eq!(name, PathBuf::from("run/out-img_a__img_b.match"));
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.match");
        std::fs::write(&path, 5u64.to_le_bytes()).unwrap();
        assert!(read_match_file(&path).is_err());
    }
}
