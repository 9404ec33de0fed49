//! Variable-window local-maximum tree-top detection.
//!
//! For every cell the search radius grows with the cell's height
//! ([`RadiusFunction`]); a cell is a tree top when no valid cell inside that
//! radius is higher. Ties go to the cell met first in row-major scan order.
//! Confidence comes from a [`ConfidenceFeature`] strategy.

use crate::error::{DetectionFailure, ParameterError};
use crate::filters::Smoothing;
use crate::raster::Raster;
use crate::tiling::{Located, Tile, TileId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Radius and confidence strategies
// ---------------------------------------------------------------------------

/// Height → search radius (ground units). Must be non-decreasing in height.
pub trait RadiusFunction: Send + Sync {
    fn radius(&self, height: f64) -> f64;
}

/// Built-in radius strategies. Coefficients are data, not code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RadiusModel {
    /// `radius = a·h² + b·h + c`, clamped at 0.
    Allometric { a: f64, b: f64, c: f64 },
    /// Same radius for every height.
    Fixed { radius: f64 },
}

impl Default for RadiusModel {
    fn default() -> Self {
        RadiusModel::Allometric {
            a: 0.0,
            b: 0.0325,
            c: 0.25,
        }
    }
}

impl RadiusModel {
    pub fn validate(&self) -> Result<(), ParameterError> {
        match *self {
            RadiusModel::Allometric { a, b, c } => {
                if !(a.is_finite() && b.is_finite() && c.is_finite()) {
                    return Err(ParameterError::NonMonotonicRadius { a, b });
                }
                // derivative 2a·h + b must stay >= 0 for every h >= 0
                if a < 0.0 || b < 0.0 {
                    return Err(ParameterError::NonMonotonicRadius { a, b });
                }
                Ok(())
            }
            RadiusModel::Fixed { radius } => {
                if radius.is_finite() && radius >= 0.0 {
                    Ok(())
                } else {
                    Err(ParameterError::Negative {
                        name: "radius",
                        value: radius,
                    })
                }
            }
        }
    }
}

impl RadiusFunction for RadiusModel {
    fn radius(&self, height: f64) -> f64 {
        match *self {
            RadiusModel::Allometric { a, b, c } => (a * height * height + b * height + c).max(0.0),
            RadiusModel::Fixed { radius } => radius,
        }
    }
}

/// How a detection (or crown) is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceFeature {
    /// Distance to the nearest tile edge: central detections saw more context.
    #[default]
    Distance,
    /// Raw height of the tree top.
    Height,
}

impl ConfidenceFeature {
    /// Score of a point with the given height and ground distance to its
    /// tile's nearest edge.
    pub fn score(&self, height: f64, edge_distance: f64) -> f64 {
        match self {
            ConfidenceFeature::Distance => edge_distance,
            ConfidenceFeature::Height => height,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters and detections
// ---------------------------------------------------------------------------

/// Parameters of [`TreeTopDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeTopParams {
    pub radius: RadiusModel,
    /// A tree top must be strictly higher than this.
    pub min_height: f64,
    pub confidence: ConfidenceFeature,
    pub smoothing: Smoothing,
}

impl Default for TreeTopParams {
    fn default() -> Self {
        Self {
            radius: RadiusModel::default(),
            min_height: 2.0,
            confidence: ConfidenceFeature::Distance,
            smoothing: Smoothing::default(),
        }
    }
}

impl TreeTopParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        self.radius.validate()?;
        if !self.min_height.is_finite() {
            return Err(ParameterError::Negative {
                name: "min_height",
                value: self.min_height,
            });
        }
        self.smoothing.validate()
    }
}

/// A detected tree top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Ground X of the cell centre.
    pub x: f64,
    /// Ground Y of the cell centre.
    pub y: f64,
    pub height: f64,
    pub score: f64,
    /// Search radius used, in ground units.
    pub radius: f64,
    /// Tile that produced the detection.
    pub tile: TileId,
}

impl Located for Detection {
    fn xy(&self) -> (f64, f64) {
        (self.x, self.y)
    }
}

// ---------------------------------------------------------------------------
// Variable-window maxima
// ---------------------------------------------------------------------------

/// A local maximum in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalMaximum {
    pub row: usize,
    pub col: usize,
    pub height: f64,
    pub radius: f64,
}

/// Find cells that are the highest valid cell within their height-dependent
/// radius.
///
/// `surface` drives the comparisons (it may be a smoothed copy); `heights`
/// gives the reported height, the radius and the minimum-height test.
///
/// A cell with no strictly higher cell within its radius is a candidate.
/// Among equal candidates within reach of each other only the first in scan
/// order is kept, so a flat top yields one maximum. An equal cell that is
/// itself beaten by a higher neighbour does not shadow a later one.
pub fn variable_window_maxima<R: RadiusFunction + ?Sized>(
    heights: &Raster,
    surface: &Raster,
    radius_fn: &R,
    min_height: f64,
) -> Vec<LocalMaximum> {
    let mut candidates = Vec::new();
    let mut is_candidate = vec![false; heights.len()];
    for r in 0..heights.nrow {
        for c in 0..heights.ncol {
            let h = heights.get(r, c);
            let v = surface.get(r, c);
            if h.is_nan() || v.is_nan() || h <= min_height {
                continue;
            }
            let rad = radius_fn.radius(h);
            if !any_within(surface, r, c, rad, |_, _, nv| nv > v) {
                is_candidate[r * heights.ncol + c] = true;
                candidates.push((
                    LocalMaximum {
                        row: r,
                        col: c,
                        height: h,
                        radius: rad,
                    },
                    v,
                ));
            }
        }
    }

    let ncol = heights.ncol;
    candidates
        .into_iter()
        .filter(|(m, v)| {
            !any_within(surface, m.row, m.col, m.radius, |dr, dc, nv| {
                let earlier = dr < 0 || (dr == 0 && dc < 0);
                let idx = (m.row as isize + dr) as usize * ncol + (m.col as isize + dc) as usize;
                earlier && nv == *v && is_candidate[idx]
            })
        })
        .map(|(m, _)| m)
        .collect()
}

/// Whether a valid cell within `rad` of `(r, c)` satisfies
/// `hit(dr, dc, value)`.
///
/// Rings are scanned outward so that the usual early exit comes from an
/// adjacent cell.
fn any_within<F>(surface: &Raster, r: usize, c: usize, rad: f64, mut hit: F) -> bool
where
    F: FnMut(isize, isize, f64) -> bool,
{
    let reach_r = (rad / surface.res_y).floor() as isize;
    let reach_c = (rad / surface.res_x).floor() as isize;
    let rad2 = rad * rad;
    let mut test = |dr: isize, dc: isize| {
        let gx = dc as f64 * surface.res_x;
        let gy = dr as f64 * surface.res_y;
        if gx * gx + gy * gy > rad2 {
            return false;
        }
        match surface.get_opt(r as isize + dr, c as isize + dc) {
            Some(nv) => hit(dr, dc, nv),
            None => false,
        }
    };
    for w in 1..=reach_r.max(reach_c) {
        // border ring at Chebyshev distance w: full top/bottom rows, then
        // left/right columns without the corners
        for d in -w..=w {
            if test(-w, d) || test(w, d) {
                return true;
            }
            if d.abs() < w && (test(d, -w) || test(d, w)) {
                return true;
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Tree-top detector for one tile.
#[derive(Debug, Clone)]
pub struct TreeTopDetector<R = RadiusModel> {
    radius: R,
    min_height: f64,
    confidence: ConfidenceFeature,
    smoothing: Smoothing,
}

impl TreeTopDetector<RadiusModel> {
    pub fn from_params(params: &TreeTopParams) -> Result<Self, ParameterError> {
        params.validate()?;
        Ok(Self::new(params.radius, params.min_height, params.confidence)
            .with_smoothing(params.smoothing))
    }
}

impl<R: RadiusFunction> TreeTopDetector<R> {
    pub fn new(radius: R, min_height: f64, confidence: ConfidenceFeature) -> Self {
        Self {
            radius,
            min_height,
            confidence,
            smoothing: Smoothing::default(),
        }
    }

    pub fn with_smoothing(mut self, smoothing: Smoothing) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn smoothing(&self) -> &Smoothing {
        &self.smoothing
    }

    /// Detect tree tops in `cells`, the raster window of `tile`, smoothing
    /// within the window.
    pub fn detect(&self, tile: &Tile, cells: &Raster) -> Result<Vec<Detection>, DetectionFailure> {
        if self.smoothing.is_identity() {
            self.detect_on_surface(tile, cells, cells)
        } else {
            self.detect_on_surface(tile, cells, &self.smoothing.apply(cells))
        }
    }

    /// Detect tree tops in `cells` comparing on `surface`, a smoothed copy
    /// of the same window.
    pub fn detect_on_surface(
        &self,
        tile: &Tile,
        cells: &Raster,
        surface: &Raster,
    ) -> Result<Vec<Detection>, DetectionFailure> {
        if cells.valid_count() == 0 {
            return Err(DetectionFailure::NoData(tile.id));
        }
        let maxima = variable_window_maxima(cells, surface, &self.radius, self.min_height);
        if maxima.is_empty() {
            return Err(DetectionFailure::NoMaxima(tile.id));
        }

        Ok(maxima
            .into_iter()
            .map(|m| {
                let (x, y) = cells.rc_to_xy(m.row, m.col);
                let row_f = (tile.rows.start + m.row) as f64 + 0.5;
                let col_f = (tile.cols.start + m.col) as f64 + 0.5;
                let edge = tile.edge_distance(row_f, col_f);
                Detection {
                    x,
                    y,
                    height: m.height,
                    score: self.confidence.score(m.height, edge),
                    radius: m.radius,
                    tile: tile.id,
                }
            })
            .collect())
    }
}
