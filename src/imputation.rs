//! Field-tree preparation before plot registration: dead trees are removed
//! and missing heights are filled in.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Breast height in metres; the height-diameter curve starts there.
const BREAST_HEIGHT: f64 = 1.3;

/// A field-surveyed tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTree {
    pub plot_id: String,
    pub x: f64,
    pub y: f64,
    pub height: Option<f64>,
    /// Diameter at breast height.
    pub dbh: Option<f64>,
    /// `"L"` or `"D"`.
    #[serde(default)]
    pub live_dead: Option<String>,
    /// Pre-computed allometric height, used when `height` is missing.
    #[serde(default)]
    pub height_allometric: Option<f64>,
}

impl FieldTree {
    pub fn is_dead(&self) -> bool {
        self.live_dead.as_deref() == Some("D")
    }
}

/// `height = 1.3 + exp(k0 + k1 · ln(dbh))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightDiameterModel {
    pub k0: f64,
    pub k1: f64,
}

impl Default for HeightDiameterModel {
    fn default() -> Self {
        Self {
            k0: -0.3136489123372108,
            k1: 0.84623571,
        }
    }
}

impl HeightDiameterModel {
    /// Predicted height, `None` for a non-positive diameter.
    pub fn predict(&self, dbh: f64) -> Option<f64> {
        if dbh > 0.0 && dbh.is_finite() {
            Some(BREAST_HEIGHT + (self.k0 + self.k1 * dbh.ln()).exp())
        } else {
            None
        }
    }

    /// Least-squares fit of `ln(h − 1.3)` on `ln(dbh)` over `(dbh, height)`
    /// pairs. Pairs with `dbh <= 0` or `height <= 1.3` are ignored; `None`
    /// when fewer than two distinct diameters remain.
    pub fn fit(pairs: &[(f64, f64)]) -> Option<Self> {
        let pts: Vec<(f64, f64)> = pairs
            .iter()
            .filter(|(d, h)| *d > 0.0 && *h > BREAST_HEIGHT && d.is_finite() && h.is_finite())
            .map(|(d, h)| (d.ln(), (h - BREAST_HEIGHT).ln()))
            .collect();
        if pts.len() < 2 {
            return None;
        }
        let n = pts.len() as f64;
        let mx = pts.iter().map(|p| p.0).sum::<f64>() / n;
        let my = pts.iter().map(|p| p.1).sum::<f64>() / n;
        let sxx: f64 = pts.iter().map(|p| (p.0 - mx).powi(2)).sum();
        let sxy: f64 = pts.iter().map(|p| (p.0 - mx) * (p.1 - my)).sum();
        if sxx <= 1e-15 {
            return None;
        }
        let k1 = sxy / sxx;
        Some(Self { k0: my - k1 * mx, k1 })
    }
}

/// Options of [`impute_heights`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationParams {
    pub drop_dead: bool,
    /// Fit the diameter model on the trees that carry both a measured height
    /// and a diameter; `model` is the fallback when the fit fails.
    pub fit_model: bool,
    pub model: HeightDiameterModel,
}

impl Default for ImputationParams {
    fn default() -> Self {
        Self {
            drop_dead: true,
            fit_model: false,
            model: HeightDiameterModel::default(),
        }
    }
}

/// Prepared trees plus where their heights came from.
#[derive(Debug, Clone, Default)]
pub struct ImputationOutcome {
    /// Trees that all carry a height.
    pub trees: Vec<FieldTree>,
    /// Diameter model applied to trees without a height.
    pub model: HeightDiameterModel,
    pub measured: usize,
    pub from_allometric: usize,
    pub from_dbh: usize,
    pub excluded_dead: usize,
    pub excluded_missing: usize,
}

/// Drop dead trees (if requested) and fill missing heights: measured height
/// first, then the pre-computed allometric height, then the diameter model.
/// Trees left without a height are excluded.
pub fn impute_heights(trees: Vec<FieldTree>, params: &ImputationParams) -> ImputationOutcome {
    let mut out = ImputationOutcome::default();
    let (trees, dead): (Vec<_>, Vec<_>) = trees
        .into_iter()
        .partition(|t| !(params.drop_dead && t.is_dead()));
    out.excluded_dead = dead.len();
    out.model = if params.fit_model {
        fitted_model(&trees).unwrap_or_else(|| {
            warn!("height-diameter fit failed, using k0={} k1={}", params.model.k0, params.model.k1);
            params.model
        })
    } else {
        params.model
    };

    for mut tree in trees {
        if valid(tree.height).is_some() {
            out.measured += 1;
        } else if let Some(h) = valid(tree.height_allometric) {
            tree.height = Some(h);
            out.from_allometric += 1;
        } else if let Some(h) = tree.dbh.and_then(|d| out.model.predict(d)) {
            tree.height = Some(h);
            out.from_dbh += 1;
        } else {
            debug!("field tree at ({}, {}) has neither height nor diameter", tree.x, tree.y);
            out.excluded_missing += 1;
            continue;
        }
        out.trees.push(tree);
    }
    info!(
        "field trees: {} measured, {} allometric, {} from dbh, {} dead and {} incomplete excluded",
        out.measured, out.from_allometric, out.from_dbh, out.excluded_dead, out.excluded_missing
    );
    out
}

fn fitted_model(trees: &[FieldTree]) -> Option<HeightDiameterModel> {
    let pairs: Vec<(f64, f64)> = trees
        .iter()
        .filter_map(|t| Some((t.dbh?, valid(t.height)?)))
        .collect();
    let model = HeightDiameterModel::fit(&pairs)?;
    info!("height-diameter model fitted on {} trees: k0={:.4} k1={:.4}", pairs.len(), model.k0, model.k1);
    Some(model)
}

fn valid(v: Option<f64>) -> Option<f64> {
    v.filter(|h| h.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tree(height: Option<f64>, dbh: Option<f64>, allometric: Option<f64>, status: &str) -> FieldTree {
        FieldTree {
            plot_id: "0010".into(),
            x: 0.0,
            y: 0.0,
            height,
            dbh,
            live_dead: Some(status.into()),
            height_allometric: allometric,
        }
    }

    #[test]
    fn test_default_model_prediction() {
        let m = HeightDiameterModel::default();
        let expected = 1.3 + (-0.3136489123372108f64 + 0.84623571 * 30f64.ln()).exp();
        assert_relative_eq!(m.predict(30.0).unwrap(), expected);
        assert!(m.predict(0.0).is_none());
        assert!(m.predict(-2.0).is_none());
    }

    #[test]
    fn test_fit_recovers_coefficients() {
        let truth = HeightDiameterModel { k0: 0.2, k1: 0.7 };
        let pairs: Vec<(f64, f64)> = [5.0, 12.0, 20.0, 33.0, 60.0]
            .iter()
            .map(|&d| (d, truth.predict(d).unwrap()))
            .collect();
        let fit = HeightDiameterModel::fit(&pairs).unwrap();
        assert_relative_eq!(fit.k0, 0.2, epsilon = 1e-9);
        assert_relative_eq!(fit.k1, 0.7, epsilon = 1e-9);
        assert!(HeightDiameterModel::fit(&pairs[..1]).is_none());
        assert!(HeightDiameterModel::fit(&[(10.0, 12.0), (10.0, 14.0)]).is_none());
    }

    #[test]
    fn test_imputation_order_and_counts() {
        let model = HeightDiameterModel::default();
        let trees = vec![
            tree(Some(20.0), Some(30.0), Some(18.0), "L"),
            tree(None, Some(30.0), Some(18.0), "L"),
            tree(None, Some(30.0), None, "L"),
            tree(None, None, None, "L"),
            tree(Some(25.0), None, None, "D"),
        ];
        let out = impute_heights(trees, &ImputationParams::default());
        let heights: Vec<f64> = out.trees.iter().map(|t| t.height.unwrap()).collect();
        assert_eq!(heights.len(), 3);
        assert_eq!(heights[0], 20.0);
        assert_eq!(heights[1], 18.0);
        assert_relative_eq!(heights[2], model.predict(30.0).unwrap());
        assert_eq!(
            (out.measured, out.from_allometric, out.from_dbh, out.excluded_dead, out.excluded_missing),
            (1, 1, 1, 1, 1)
        );
    }

    #[test]
    fn test_dead_trees_kept_on_request() {
        let params = ImputationParams {
            drop_dead: false,
            ..ImputationParams::default()
        };
        let out = impute_heights(vec![tree(Some(25.0), None, None, "D")], &params);
        assert_eq!(out.trees.len(), 1);
        assert_eq!(out.excluded_dead, 0);
    }

    #[test]
    fn test_fitted_model_fills_missing_heights() {
        let truth = HeightDiameterModel { k0: 0.5, k1: 0.6 };
        let mut trees: Vec<FieldTree> = [8.0, 15.0, 27.0, 41.0]
            .iter()
            .map(|&d| tree(truth.predict(d), Some(d), None, "L"))
            .collect();
        // a dead tree far off the curve is dropped before the fit
        trees.push(tree(Some(2.0), Some(80.0), None, "D"));
        trees.push(tree(None, Some(20.0), None, "L"));

        let params = ImputationParams {
            fit_model: true,
            ..ImputationParams::default()
        };
        let out = impute_heights(trees.clone(), &params);
        assert_relative_eq!(out.model.k0, 0.5, epsilon = 1e-9);
        assert_relative_eq!(out.model.k1, 0.6, epsilon = 1e-9);
        assert_eq!((out.measured, out.from_dbh, out.excluded_dead), (4, 1, 1));
        assert_relative_eq!(out.trees[4].height.unwrap(), truth.predict(20.0).unwrap(), epsilon = 1e-9);

        let fixed = impute_heights(trees, &ImputationParams::default());
        assert_eq!(fixed.model, HeightDiameterModel::default());
    }

    #[test]
    fn test_failed_fit_falls_back_to_configured_model() {
        let params = ImputationParams {
            fit_model: true,
            ..ImputationParams::default()
        };
        let trees = vec![tree(Some(20.0), Some(30.0), None, "L"), tree(None, Some(30.0), None, "L")];
        let out = impute_heights(trees, &params);
        assert_eq!(out.model, params.model);
        assert_relative_eq!(out.trees[1].height.unwrap(), params.model.predict(30.0).unwrap());
    }
}
