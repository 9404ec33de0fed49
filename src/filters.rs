//! Optional tile pre-smoothing: non-linear (median) filtering followed by
//! Gaussian smoothing. Used to stabilise local-maximum search on noisy CHMs.
//!
//! Tiles are smoothed from a window padded by the kernel reach, so two tiles
//! sharing a cell compute the same smoothed value for it.

use crate::error::{InputError, ParameterError};
use crate::raster::{Raster, RasterSource};
use serde::{Deserialize, Serialize};
use std::ops::Range;

// ---------------------------------------------------------------------------
// Smoothing parameters
// ---------------------------------------------------------------------------

/// Smoothing applied to a tile before tree-top search. Both steps are off by
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Smoothing {
    /// Median kernel size in pixels (odd).
    pub median_size: Option<usize>,
    /// Gaussian sigma in pixels.
    pub sigma: Option<f64>,
}

impl Smoothing {
    pub fn validate(&self) -> Result<(), ParameterError> {
        if let Some(k) = self.median_size {
            if k % 2 == 0 {
                return Err(ParameterError::EvenMedianSize(k));
            }
        }
        if let Some(s) = self.sigma {
            if !(s.is_finite() && s >= 0.0) {
                return Err(ParameterError::Negative {
                    name: "sigma",
                    value: s,
                });
            }
        }
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        self.median_size.map_or(true, |k| k <= 1) && self.sigma.map_or(true, |s| s <= 0.0)
    }

    /// Cells read beyond a window so that its smoothed values do not depend
    /// on where the window ends.
    pub fn halo(&self) -> usize {
        let median = match self.median_size {
            Some(k) if k > 1 => k / 2,
            _ => 0,
        };
        let gaussian = match self.sigma {
            Some(s) if s > 0.0 => gaussian_radius(s),
            _ => 0,
        };
        median + gaussian
    }

    /// Read `rows × cols` from `source` together with its smoothed surface,
    /// or `None` for the surface when smoothing is off.
    pub fn read_smoothed<S: RasterSource + ?Sized>(
        &self,
        source: &S,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> Result<(Raster, Option<Raster>), InputError> {
        if self.is_identity() {
            return Ok((source.read_window(rows, cols)?, None));
        }
        let (nrow, ncol) = source.shape();
        let halo = self.halo();
        let row0 = rows.start.saturating_sub(halo);
        let col0 = cols.start.saturating_sub(halo);
        let padded = source.read_window(
            row0..(rows.end + halo).min(nrow).max(row0),
            col0..(cols.end + halo).min(ncol).max(col0),
        )?;
        let smoothed = self.apply(&padded);
        let inner_rows = rows.start - row0..rows.end - row0;
        let inner_cols = cols.start - col0..cols.end - col0;
        Ok((
            padded.window(inner_rows.clone(), inner_cols.clone())?,
            Some(smoothed.window(inner_rows, inner_cols)?),
        ))
    }

    /// Apply median then Gaussian smoothing. No-data cells stay no-data.
    pub fn apply(&self, dem: &Raster) -> Raster {
        let nl = match self.median_size {
            Some(k) if k > 1 => median_filter(dem, k),
            _ => dem.clone(),
        };
        match self.sigma {
            Some(s) if s > 0.0 => gaussian_smooth(&nl, s),
            _ => nl,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

/// Median filter on a raster (square kernel of size `ksize × ksize`).
pub fn median_filter(dem: &Raster, ksize: usize) -> Raster {
    let half = (ksize / 2) as isize;
    let mut out = dem.clone();

    let mut buf = Vec::with_capacity(ksize * ksize);
    for r in 0..dem.nrow {
        for c in 0..dem.ncol {
            if dem.get(r, c).is_nan() {
                continue;
            }
            buf.clear();
            for dr in -half..=half {
                for dc in -half..=half {
                    if let Some(v) = dem.get_opt(r as isize + dr, c as isize + dc) {
                        buf.push(v);
                    }
                }
            }
            let mid = buf.len() / 2;
            let (_, median, _) = buf.select_nth_unstable_by(mid, f64::total_cmp);
            out.set(r, c, *median);
        }
    }
    out
}

/// Gaussian smoothing (2D separable). `sigma` in pixels.
pub fn gaussian_smooth(dem: &Raster, sigma: f64) -> Raster {
    if sigma <= 0.0 {
        return dem.clone();
    }
    let radius = gaussian_radius(sigma) as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| {
            let x = i as f64;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();

    let tmp = convolve_axis(dem, &kernel, radius, true);
    convolve_axis(&tmp, &kernel, radius, false)
}

/// Kernel half-width covering three standard deviations.
fn gaussian_radius(sigma: f64) -> usize {
    (3.0 * sigma).ceil() as usize
}

/// One separable pass; weights are renormalised over valid neighbours.
fn convolve_axis(src: &Raster, kernel: &[f64], radius: isize, horizontal: bool) -> Raster {
    let mut out = src.clone();
    for r in 0..src.nrow {
        for c in 0..src.ncol {
            if src.get(r, c).is_nan() {
                continue;
            }
            let mut sum = 0.0;
            let mut wsum = 0.0;
            for (ki, d) in (-radius..=radius).enumerate() {
                let (rr, cc) = if horizontal {
                    (r as isize, c as isize + d)
                } else {
                    (r as isize + d, c as isize)
                };
                if let Some(v) = src.get_opt(rr, cc) {
                    sum += v * kernel[ki];
                    wsum += kernel[ki];
                }
            }
            if wsum > 0.0 {
                out.set(r, c, sum / wsum);
            }
        }
    }
    out
}
