//! Matching of reference (field) trees with detected trees, and the
//! accuracy statistics computed on the matched pairs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A tree as `[x, y, height]`.
pub type Point3D = [f64; 3];

/// A matched pair of reference and detected trees.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    /// Index into the reference trees.
    pub r_idx: usize,
    /// Index into the detected trees.
    pub d_idx: usize,
    /// Height difference (detected − reference).
    pub h_diff: f64,
    /// Planimetric distance between the pair.
    pub plan_diff: f64,
}

/// Matching tolerance. A reference tree of height `H` matches detections
/// within a 3D distance of `delta_ground + h_prec · H`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchParams {
    pub delta_ground: f64,
    pub h_prec: f64,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            delta_ground: 2.1,
            h_prec: 0.14,
        }
    }
}

/// Detection statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetectionStats {
    pub true_detections: usize,
    pub false_detections: usize,
    pub omissions: usize,
}

/// Linear regression of reference heights on detected heights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightRegressionResult {
    /// Intercept of the fitted line `H_ref = intercept + slope * H_det`.
    pub intercept: f64,
    pub slope: f64,
    pub rmse: f64,
    /// Mean of `H_det − H_ref`.
    pub bias: f64,
    /// Standard deviation of `H_det − H_ref`.
    pub sd: f64,
}

/// 3D greedy matching of detected tree tops with reference trees.
///
/// Each candidate pair gets a matching index: its squared 3D distance over
/// the squared matching radius of the reference tree. Pairs with an index
/// below 1 are associated in increasing index order, each tree at most once.
/// Ties go to the lower detected index, then the lower reference index.
pub fn tree_matching(lr: &[Point3D], ld: &[Point3D], params: &MatchParams) -> Vec<MatchedPair> {
    if lr.is_empty() || ld.is_empty() {
        return Vec::new();
    }

    // rmax² = (delta_ground + h_prec·H)²
    let norm: Vec<f64> = lr
        .iter()
        .map(|r| (params.delta_ground + params.h_prec * r[2]).powi(2))
        .collect();

    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (j, d) in ld.iter().enumerate() {
        for (i, r) in lr.iter().enumerate() {
            let dist2 = (d[0] - r[0]).powi(2) + (d[1] - r[1]).powi(2) + (d[2] - r[2]).powi(2);
            let index = dist2 / norm[i];
            if index < 1.0 {
                candidates.push((index, j, i));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut used_r = vec![false; lr.len()];
    let mut used_d = vec![false; ld.len()];
    let mut matched = Vec::new();
    for (_, j, i) in candidates {
        if used_d[j] || used_r[i] {
            continue;
        }
        used_d[j] = true;
        used_r[i] = true;
        matched.push(MatchedPair {
            r_idx: i,
            d_idx: j,
            h_diff: ld[j][2] - lr[i][2],
            plan_diff: ((ld[j][0] - lr[i][0]).powi(2) + (ld[j][1] - lr[i][1]).powi(2)).sqrt(),
        });
    }
    matched
}

/// True detections, omissions and false detections.
pub fn hist_detection(lr: &[Point3D], ld: &[Point3D], matched: &[MatchedPair]) -> DetectionStats {
    let matched_r: HashSet<usize> = matched.iter().map(|m| m.r_idx).collect();
    let matched_d: HashSet<usize> = matched.iter().map(|m| m.d_idx).collect();
    DetectionStats {
        true_detections: matched.len(),
        false_detections: ld.len() - matched_d.len(),
        omissions: lr.len() - matched_r.len(),
    }
}

/// Fit `H_ref = intercept + slope * H_det` over the matched pairs, with the
/// error statistics of `H_det − H_ref`. `None` without pairs.
pub fn height_regression(
    lr: &[Point3D],
    ld: &[Point3D],
    matched: &[MatchedPair],
) -> Option<HeightRegressionResult> {
    if matched.is_empty() {
        return None;
    }
    let n = matched.len() as f64;
    let h_ref: Vec<f64> = matched.iter().map(|m| lr[m.r_idx][2]).collect();
    let h_det: Vec<f64> = matched.iter().map(|m| ld[m.d_idx][2]).collect();

    let mean_x = h_det.iter().sum::<f64>() / n;
    let mean_y = h_ref.iter().sum::<f64>() / n;
    let (mut ss_xy, mut ss_xx) = (0.0, 0.0);
    for (x, y) in h_det.iter().zip(&h_ref) {
        ss_xy += (x - mean_x) * (y - mean_y);
        ss_xx += (x - mean_x) * (x - mean_x);
    }
    let slope = if ss_xx.abs() > 1e-15 { ss_xy / ss_xx } else { 0.0 };
    let intercept = mean_y - slope * mean_x;

    let diffs: Vec<f64> = h_det.iter().zip(&h_ref).map(|(d, r)| d - r).collect();
    let rmse = (diffs.iter().map(|d| d * d).sum::<f64>() / n).sqrt();
    let bias = diffs.iter().sum::<f64>() / n;
    let sd = if n > 1.0 {
        (diffs.iter().map(|d| (d - bias).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };

    Some(HeightRegressionResult {
        intercept,
        slope,
        rmse,
        bias,
        sd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reference() -> Vec<Point3D> {
        vec![
            [1.0, 1.0, 15.0],
            [4.0, 1.0, 18.0],
            [3.0, 2.0, 20.0],
            [4.0, 3.0, 10.0],
            [2.0, 4.0, 11.0],
        ]
    }

    fn detected() -> Vec<Point3D> {
        vec![
            [2.0, 1.0, 16.0],
            [2.0, 3.0, 19.0],
            [4.0, 4.0, 9.0],
            [4.0, 1.0, 15.0],
        ]
    }

    #[test]
    fn test_counts_are_consistent() {
        let (lr, ld) = (reference(), detected());
        let matched = tree_matching(&lr, &ld, &MatchParams::default());
        assert!(!matched.is_empty());
        let stats = hist_detection(&lr, &ld, &matched);
        assert_eq!(stats.true_detections + stats.omissions, lr.len());
        assert_eq!(stats.true_detections + stats.false_detections, ld.len());
    }

    #[test]
    fn test_each_tree_used_once_and_closest_first() {
        let lr = vec![[0.0, 0.0, 10.0], [1.0, 0.0, 10.0]];
        let ld = vec![[0.9, 0.0, 10.0]];
        let matched = tree_matching(&lr, &ld, &MatchParams::default());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].r_idx, 1);
        assert_relative_eq!(matched[0].plan_diff, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_height_difference_counts_in_distance() {
        let lr = vec![[0.0, 0.0, 10.0]];
        let close = vec![[0.5, 0.0, 10.0]];
        let tall = vec![[0.5, 0.0, 30.0]];
        let params = MatchParams::default();
        assert_eq!(tree_matching(&lr, &close, &params).len(), 1);
        assert!(tree_matching(&lr, &tall, &params).is_empty());
    }

    #[test]
    fn test_far_trees_do_not_match() {
        let lr = vec![[0.0, 0.0, 20.0]];
        let ld = vec![[100.0, 100.0, 20.0]];
        assert!(tree_matching(&lr, &ld, &MatchParams::default()).is_empty());
        assert!(tree_matching(&[], &ld, &MatchParams::default()).is_empty());
    }

    #[test]
    fn test_height_regression_on_offset_heights() {
        let lr = vec![[1.0, 1.0, 15.0], [4.0, 1.0, 18.0], [3.0, 2.0, 20.0]];
        let ld = vec![[1.1, 1.0, 16.0], [4.0, 1.1, 19.0], [3.0, 2.1, 21.0]];
        let matched = tree_matching(&lr, &ld, &MatchParams::default());
        assert_eq!(matched.len(), 3);
        let reg = height_regression(&lr, &ld, &matched).unwrap();
        assert_relative_eq!(reg.bias, 1.0, epsilon = 1e-12);
        assert_relative_eq!(reg.slope, 1.0, epsilon = 1e-12);
        assert_relative_eq!(reg.intercept, -1.0, epsilon = 1e-9);
        assert_relative_eq!(reg.rmse, 1.0, epsilon = 1e-12);
        assert!(reg.sd.abs() < 1e-12);
        assert!(height_regression(&lr, &ld, &[]).is_none());
    }
}
