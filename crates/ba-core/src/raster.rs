//! Masked grid rasters with affine lon/lat georeferencing.
//!
//! DEMs are read from ESRI ASCII grids; disparity rasters are two such
//! grids (dx, then dy) concatenated under one header. Sampling is bilinear
//! and returns `None` outside the grid or when any contributing cell is
//! nodata.

use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

use crate::math::{Real, Vec2};

/// Affine pixel -> lon/lat mapping (north-up grids have `dy < 0`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub x0: Real,
    pub y0: Real,
    pub dx: Real,
    pub dy: Real,
}

impl GeoTransform {
    pub fn pixel_to_lonlat(&self, pix: Vec2) -> Vec2 {
        Vec2::new(self.x0 + self.dx * pix.x, self.y0 + self.dy * pix.y)
    }

    pub fn lonlat_to_pixel(&self, ll: Vec2) -> Vec2 {
        Vec2::new((ll.x - self.x0) / self.dx, (ll.y - self.y0) / self.dy)
    }
}

/// A single-band raster with a nodata mask.
#[derive(Debug, Clone)]
pub struct GridRaster {
    pub georef: GeoTransform,
    pub cols: usize,
    pub rows: usize,
    nodata: Real,
    data: Vec<Real>,
}

impl GridRaster {
    pub fn new(georef: GeoTransform, cols: usize, rows: usize, nodata: Real, data: Vec<Real>) -> Result<Self> {
        ensure!(
            data.len() == cols * rows,
            "raster data length {} does not match {}x{}",
            data.len(),
            cols,
            rows
        );
        Ok(Self {
            georef,
            cols,
            rows,
            nodata,
            data,
        })
    }

    /// Read an ESRI ASCII grid.
    pub fn from_ascii_grid(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read raster {}", path.display()))?;
        let mut tokens = text.split_whitespace().peekable();
        let (cols, rows, xll, yll, cell, nodata) = parse_ascii_header(&mut tokens, path)?;

        let mut data = Vec::with_capacity(cols * rows);
        for tok in tokens {
            data.push(
                tok.parse::<Real>()
                    .with_context(|| format!("bad raster value {:?} in {}", tok, path.display()))?,
            );
        }
        ensure!(
            data.len() == cols * rows,
            "raster {} has {} values, expected {}",
            path.display(),
            data.len(),
            cols * rows
        );
        Ok(Self {
            georef: north_up_georef(xll, yll, cell, rows),
            cols,
            rows,
            nodata,
            data,
        })
    }

    /// Cell value at integer coordinates, `None` outside or on nodata.
    pub fn at(&self, col: i64, row: i64) -> Option<Real> {
        if col < 0 || row < 0 || col as usize >= self.cols || row as usize >= self.rows {
            return None;
        }
        let v = self.data[row as usize * self.cols + col as usize];
        if v == self.nodata {
            None
        } else {
            Some(v)
        }
    }

    /// Bilinear sample at a fractional pixel coordinate.
    pub fn sample_pixel(&self, pix: Vec2) -> Option<Real> {
        if pix.x < 0.0 || pix.y < 0.0 || pix.x > (self.cols - 1) as Real || pix.y > (self.rows - 1) as Real {
            return None;
        }
        let c0 = pix.x.floor() as i64;
        let r0 = pix.y.floor() as i64;
        let c1 = (c0 + 1).min(self.cols as i64 - 1);
        let r1 = (r0 + 1).min(self.rows as i64 - 1);
        let fx = pix.x - c0 as Real;
        let fy = pix.y - r0 as Real;

        let v00 = self.at(c0, r0)?;
        let v10 = self.at(c1, r0)?;
        let v01 = self.at(c0, r1)?;
        let v11 = self.at(c1, r1)?;

        let top = v00 * (1.0 - fx) + v10 * fx;
        let bot = v01 * (1.0 - fx) + v11 * fx;
        Some(top * (1.0 - fy) + bot * fy)
    }

    /// Bilinear sample at a geographic coordinate.
    pub fn sample_lonlat(&self, ll: Vec2) -> Option<Real> {
        self.sample_pixel(self.georef.lonlat_to_pixel(ll))
    }
}

/// A two-band disparity raster mapping left-image pixels to (dx, dy).
#[derive(Debug, Clone)]
pub struct DisparityRaster {
    dx: GridRaster,
    dy: GridRaster,
}

impl DisparityRaster {
    /// Assemble a disparity raster from its two bands.
    pub fn from_bands(dx: GridRaster, dy: GridRaster) -> Self {
        Self { dx, dy }
    }

    /// Read a disparity file: one ESRI ASCII header, then `2 * nrows` rows
    /// of values (the dx band followed by the dy band).
    pub fn from_ascii(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read disparity {}", path.display()))?;
        let mut tokens = text.split_whitespace().peekable();
        let (cols, rows, xll, yll, cell, nodata) = parse_ascii_header(&mut tokens, path)?;

        let mut values = Vec::with_capacity(2 * cols * rows);
        for tok in tokens {
            values.push(
                tok.parse::<Real>()
                    .with_context(|| format!("bad disparity value {:?} in {}", tok, path.display()))?,
            );
        }
        ensure!(
            values.len() == 2 * cols * rows,
            "disparity {} has {} values, expected {}",
            path.display(),
            values.len(),
            2 * cols * rows
        );
        let georef = north_up_georef(xll, yll, cell, rows);
        let dy_band = values.split_off(cols * rows);
        Ok(Self {
            dx: GridRaster::new(georef, cols, rows, nodata, values)?,
            dy: GridRaster::new(georef, cols, rows, nodata, dy_band)?,
        })
    }

    pub fn cols(&self) -> usize {
        self.dx.cols
    }

    pub fn rows(&self) -> usize {
        self.dx.rows
    }

    /// Sample the disparity at a left-image pixel.
    pub fn sample(&self, pix: Vec2) -> Option<Vec2> {
        let dx = self.dx.sample_pixel(pix)?;
        let dy = self.dy.sample_pixel(pix)?;
        Some(Vec2::new(dx, dy))
    }
}

fn north_up_georef(xll: Real, yll: Real, cell: Real, rows: usize) -> GeoTransform {
    GeoTransform {
        x0: xll + 0.5 * cell,
        y0: yll + (rows as Real - 0.5) * cell,
        dx: cell,
        dy: -cell,
    }
}

fn parse_ascii_header<'a, I: Iterator<Item = &'a str>>(
    tokens: &mut std::iter::Peekable<I>,
    path: &Path,
) -> Result<(usize, usize, Real, Real, Real, Real)> {
    let mut cols = None;
    let mut rows = None;
    let mut xll = None;
    let mut yll = None;
    let mut cell = None;
    let mut nodata = -9999.0;

    // Header lines are `key value` pairs; the first bare number starts the
    // data section (nodata is optional).
    while let Some(tok) = tokens.peek() {
        if tok.parse::<Real>().is_ok() {
            break;
        }
        let key = tokens.next().unwrap().to_lowercase();
        let value: Real = tokens
            .next()
            .with_context(|| format!("missing header value for {} in {}", key, path.display()))?
            .parse()
            .with_context(|| format!("bad header value for {} in {}", key, path.display()))?;
        match key.as_str() {
            "ncols" => cols = Some(value as usize),
            "nrows" => rows = Some(value as usize),
            "xllcorner" => xll = Some(value),
            "yllcorner" => yll = Some(value),
            "cellsize" => cell = Some(value),
            "nodata_value" => nodata = value,
            other => bail!("unknown raster header key {:?} in {}", other, path.display()),
        }
    }

    match (cols, rows, xll, yll, cell) {
        (Some(c), Some(r), Some(x), Some(y), Some(s)) => Ok((c, r, x, y, s, nodata)),
        _ => bail!("incomplete raster header in {}", path.display()),
    }
}
