//! Plot registration: the rigid 2D shift that best aligns a plot's field
//! trees with the trees detected on the canopy height model.
//!
//! Candidate shifts on a regular grid are scored by 3D tree matching between
//! the shifted field trees and the detections inside the shifted plot
//! boundary. The best grid shift is then refined by moving it by the mean
//! offset of its matched pairs while that does not make the score worse.

use crate::error::{AlignmentFailure, ParameterError};
use crate::imputation::FieldTree;
use crate::tree_matching::{
    height_regression, hist_detection, tree_matching, DetectionStats, HeightRegressionResult,
    MatchParams, MatchedPair, Point3D,
};
use geo::{Contains, Point, Polygon, Translate};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Largest number of grid steps on each side of the zero shift.
const MAX_GRID_STEPS: f64 = 1000.0;

/// Parameters of [`PlotAligner`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignParams {
    /// Largest shift tried along each axis, in ground units.
    pub max_shift: f64,
    /// Spacing of the shift grid.
    pub grid_step: f64,
    /// Mean-offset refinement rounds after the grid search.
    pub refine_iterations: usize,
    pub matching: MatchParams,
}

impl Default for AlignParams {
    fn default() -> Self {
        Self {
            max_shift: 10.0,
            grid_step: 0.5,
            refine_iterations: 10,
            matching: MatchParams::default(),
        }
    }
}

impl AlignParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        if !(self.max_shift.is_finite() && self.max_shift >= 0.0) {
            return Err(ParameterError::Negative {
                name: "max_shift",
                value: self.max_shift,
            });
        }
        if !(self.grid_step.is_finite() && self.grid_step > 0.0) {
            return Err(ParameterError::NonPositive {
                name: "grid_step",
                value: self.grid_step,
            });
        }
        let steps = self.max_shift / self.grid_step;
        if steps > MAX_GRID_STEPS {
            return Err(ParameterError::TooLarge {
                name: "max_shift / grid_step",
                value: steps,
                max: MAX_GRID_STEPS,
            });
        }
        let m = self.matching;
        if !(m.delta_ground.is_finite() && m.delta_ground > 0.0) {
            return Err(ParameterError::NonPositive {
                name: "delta_ground",
                value: m.delta_ground,
            });
        }
        if !(m.h_prec.is_finite() && m.h_prec >= 0.0) {
            return Err(ParameterError::Negative {
                name: "h_prec",
                value: m.h_prec,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plots and results
// ---------------------------------------------------------------------------

/// A surveyed plot.
#[derive(Debug, Clone)]
pub struct Plot {
    pub id: String,
    pub boundary: Polygon<f64>,
    /// Field trees; trees without a height are ignored.
    pub field_trees: Vec<FieldTree>,
    /// Detected trees as `[x, y, height]`.
    pub detected: Vec<Point3D>,
}

/// Translation added to field-tree coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shift {
    pub dx: f64,
    pub dy: f64,
    pub matches: usize,
    /// Sum of planimetric distances of the matched pairs.
    pub residual: f64,
}

impl Shift {
    /// More matches first, then smaller residual.
    fn rank(&self, other: &Shift) -> Ordering {
        other
            .matches
            .cmp(&self.matches)
            .then(self.residual.total_cmp(&other.residual))
    }
}

/// Registration result of one plot.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub plot_id: String,
    pub shift: Shift,
    /// Every field tree of the plot, translated by the shift.
    pub shifted_field_trees: Vec<FieldTree>,
    pub stats: DetectionStats,
    pub regression: Option<HeightRegressionResult>,
}

// ---------------------------------------------------------------------------
// Shift search
// ---------------------------------------------------------------------------

/// Field and detected trees of one plot, prepared for scoring.
struct Scorer<'a> {
    boundary: &'a Polygon<f64>,
    field: Vec<Point3D>,
    detected: &'a [Point3D],
    matching: MatchParams,
}

impl Scorer<'_> {
    /// Shifted field trees and the detections inside the shifted boundary.
    fn pairs(&self, dx: f64, dy: f64) -> (Vec<Point3D>, Vec<Point3D>) {
        let shifted: Vec<Point3D> = self.field.iter().map(|t| [t[0] + dx, t[1] + dy, t[2]]).collect();
        let bounds = self.boundary.translate(dx, dy);
        let inside: Vec<Point3D> = self
            .detected
            .iter()
            .filter(|d| bounds.contains(&Point::new(d[0], d[1])))
            .copied()
            .collect();
        (shifted, inside)
    }

    fn matched(&self, dx: f64, dy: f64) -> (Vec<Point3D>, Vec<Point3D>, Vec<MatchedPair>) {
        let (lr, ld) = self.pairs(dx, dy);
        let matched = tree_matching(&lr, &ld, &self.matching);
        (lr, ld, matched)
    }

    fn score(&self, dx: f64, dy: f64) -> Shift {
        let (_, _, matched) = self.matched(dx, dy);
        Shift {
            dx,
            dy,
            matches: matched.len(),
            residual: matched.iter().map(|m| m.plan_diff).sum(),
        }
    }
}

/// Registers plots with validated parameters.
#[derive(Debug, Clone, Copy)]
pub struct PlotAligner {
    params: AlignParams,
    offsets: usize,
}

impl PlotAligner {
    pub fn new(params: AlignParams) -> Result<Self, ParameterError> {
        params.validate()?;
        let offsets = (params.max_shift / params.grid_step).floor() as usize;
        Ok(Self { params, offsets })
    }

    pub fn params(&self) -> &AlignParams {
        &self.params
    }

    /// Candidate shifts, `dy` outer and `dx` inner.
    fn grid(&self) -> Vec<(f64, f64)> {
        let n = self.offsets as i64;
        let step = self.params.grid_step;
        let offsets: Vec<f64> = (-n..=n).map(|i| i as f64 * step).collect();
        offsets
            .iter()
            .flat_map(|&dy| offsets.iter().map(move |&dx| (dx, dy)))
            .collect()
    }

    /// Estimate the shift of one plot.
    pub fn align(&self, plot: &Plot) -> Result<Alignment, AlignmentFailure> {
        let params = &self.params;
        let field: Vec<Point3D> = plot
            .field_trees
            .iter()
            .filter_map(|t| Some([t.x, t.y, t.height?]))
            .filter(|t| plot.boundary.contains(&Point::new(t[0], t[1])))
            .collect();
        if field.is_empty() {
            return Err(AlignmentFailure::NoFieldTrees(plot.id.clone()));
        }
        if plot.detected.is_empty() {
            return Err(AlignmentFailure::NoDetectedTrees(plot.id.clone()));
        }

        let scorer = Scorer {
            boundary: &plot.boundary,
            field,
            detected: &plot.detected,
            matching: params.matching,
        };

        let scores: Vec<Shift> = self
            .grid()
            .par_iter()
            .map(|&(dx, dy)| scorer.score(dx, dy))
            .collect();
        // min_by keeps the first of equal elements: grid order breaks ties
        let Some(mut best) = scores.into_iter().min_by(|a, b| a.rank(b)) else {
            return Err(AlignmentFailure::NoViableMatch(plot.id.clone()));
        };
        if best.matches == 0 {
            return Err(AlignmentFailure::NoViableMatch(plot.id.clone()));
        }

        for _ in 0..params.refine_iterations {
            let (lr, ld, matched) = scorer.matched(best.dx, best.dy);
            let k = matched.len() as f64;
            let ox = matched.iter().map(|m| ld[m.d_idx][0] - lr[m.r_idx][0]).sum::<f64>() / k;
            let oy = matched.iter().map(|m| ld[m.d_idx][1] - lr[m.r_idx][1]).sum::<f64>() / k;
            if ox.hypot(oy) < 1e-9 {
                break;
            }
            let candidate = scorer.score(best.dx + ox, best.dy + oy);
            if candidate.rank(&best) == Ordering::Greater {
                break;
            }
            best = candidate;
        }

        let (lr, ld, matched) = scorer.matched(best.dx, best.dy);
        let stats = hist_detection(&lr, &ld, &matched);
        let regression = height_regression(&lr, &ld, &matched);
        let shifted_field_trees = plot
            .field_trees
            .iter()
            .map(|t| FieldTree {
                x: t.x + best.dx,
                y: t.y + best.dy,
                ..t.clone()
            })
            .collect();

        info!(
            "plot {}: shift ({:.2}, {:.2}), {} matches, residual {:.2}",
            plot.id, best.dx, best.dy, best.matches, best.residual
        );
        Ok(Alignment {
            plot_id: plot.id.clone(),
            shift: best,
            shifted_field_trees,
            stats,
            regression,
        })
    }

    /// Align every plot independently (in parallel). Failed plots are logged
    /// and collected; results keep the input order.
    pub fn align_all(&self, plots: &[Plot]) -> BatchAlignment {
        let results: Vec<Result<Alignment, AlignmentFailure>> =
            plots.par_iter().map(|p| self.align(p)).collect();
        let mut batch = BatchAlignment::default();
        for r in results {
            match r {
                Ok(a) => batch.aligned.push(a),
                Err(e) => {
                    warn!("skipping plot: {e}");
                    batch.failed.push(e);
                }
            }
        }
        batch
    }
}

/// Results of a batch of plots.
#[derive(Debug, Clone, Default)]
pub struct BatchAlignment {
    pub aligned: Vec<Alignment>,
    pub failed: Vec<AlignmentFailure>,
}

/// Validate `params` and align every plot.
pub fn align_plots(plots: &[Plot], params: &AlignParams) -> Result<BatchAlignment, ParameterError> {
    Ok(PlotAligner::new(*params)?.align_all(plots))
}
