//! Cross-tile crown deduplication (greedy non-maximum suppression).
//!
//! Crowns from overlapping tiles are ranked by score and accepted one by one;
//! a candidate is rejected when it overlaps an accepted crown by at least the
//! threshold. Accepted bounding boxes live in an R-tree so only nearby crowns
//! are intersected exactly.

use crate::crowns::CrownPolygon;
use crate::error::ParameterError;
use geo::{Area, BooleanOps, BoundingRect};
use log::debug;
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the overlap of two crowns is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum OverlapMetric {
    /// Intersection area over the smaller crown's area.
    #[default]
    #[serde(rename = "ios")]
    #[value(name = "ios")]
    IntersectionOverSmaller,
    /// Intersection area over union area.
    #[serde(rename = "iou")]
    #[value(name = "iou")]
    IntersectionOverUnion,
}

impl OverlapMetric {
    /// Overlap of two polygons in `[0, 1]`.
    pub fn overlap(&self, a: &CrownPolygon, b: &CrownPolygon) -> f64 {
        // fixed argument order so that overlap(a, b) == overlap(b, a) bit for bit
        let (a, b) = if (a.seed, a.tile) <= (b.seed, b.tile) {
            (a, b)
        } else {
            (b, a)
        };
        let inter = a.polygon.intersection(&b.polygon).unsigned_area();
        if inter <= 0.0 {
            return 0.0;
        }
        let (area_a, area_b) = (a.area(), b.area());
        let denom = match self {
            OverlapMetric::IntersectionOverSmaller => area_a.min(area_b),
            OverlapMetric::IntersectionOverUnion => area_a + area_b - inter,
        };
        if denom > 0.0 {
            (inter / denom).min(1.0)
        } else {
            0.0
        }
    }
}

/// Parameters of [`merge_crowns`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeParams {
    pub overlap_metric: OverlapMetric,
    /// Crowns overlapping an accepted crown by this much or more are dropped.
    pub overlap_threshold: f64,
    /// Deduplicate within each tile (in parallel) before the global pass.
    pub run_per_region_pass: bool,
}

impl Default for MergeParams {
    fn default() -> Self {
        Self {
            overlap_metric: OverlapMetric::IntersectionOverSmaller,
            overlap_threshold: 0.3,
            run_per_region_pass: false,
        }
    }
}

impl MergeParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(ParameterError::OutOfUnitRange {
                name: "overlap_threshold",
                value: self.overlap_threshold,
            });
        }
        Ok(())
    }
}

/// Result of a merge.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Accepted crowns, in acceptance order (score descending).
    pub kept: Vec<CrownPolygon>,
    pub suppressed: usize,
}

// ---------------------------------------------------------------------------
// Greedy merge
// ---------------------------------------------------------------------------

/// Bounding box of an accepted crown in the R-tree.
#[derive(Debug, Clone)]
struct CrownBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for CrownBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// Deduplicate crowns across tiles.
///
/// Candidates are ranked by score (descending, ties by input order). A
/// candidate is accepted iff its overlap with every accepted crown is below
/// `overlap_threshold`; crowns whose intersection has zero area never
/// conflict. Re-running on the output returns it unchanged.
pub fn merge_crowns(crowns: Vec<CrownPolygon>, params: &MergeParams) -> Result<MergeOutcome, ParameterError> {
    params.validate()?;
    let total = crowns.len();
    let mut candidates: Vec<(usize, CrownPolygon)> = crowns.into_iter().enumerate().collect();

    if params.run_per_region_pass {
        let mut regions: BTreeMap<usize, Vec<(usize, CrownPolygon)>> = BTreeMap::new();
        for (i, c) in candidates {
            regions.entry(c.tile.index).or_default().push((i, c));
        }
        let regions: Vec<Vec<(usize, CrownPolygon)>> = regions.into_values().collect();
        candidates = regions
            .into_par_iter()
            .flat_map_iter(|region| greedy(region, params))
            .collect();
        // back to input order so that ties resolve as in the single pass
        candidates.sort_by_key(|(i, _)| *i);
        debug!(
            "per-region pass kept {} of {} crowns",
            candidates.len(),
            total
        );
    }

    let kept: Vec<CrownPolygon> = greedy(candidates, params)
        .into_iter()
        .map(|(_, c)| c)
        .collect();
    Ok(MergeOutcome {
        suppressed: total - kept.len(),
        kept,
    })
}

/// One greedy pass. Items keep their input index.
fn greedy(mut candidates: Vec<(usize, CrownPolygon)>, params: &MergeParams) -> Vec<(usize, CrownPolygon)> {
    // stable: equal scores keep input order
    candidates.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));

    let mut index: RTree<CrownBox> = RTree::new();
    let mut kept: Vec<(usize, CrownPolygon)> = Vec::with_capacity(candidates.len());
    for (i, crown) in candidates {
        let Some(rect) = crown.polygon.bounding_rect() else {
            continue;
        };
        let env = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
        let conflict = index.locate_in_envelope_intersecting(&env).any(|b| {
            let other = &kept[b.idx].1;
            let overlap = params.overlap_metric.overlap(&crown, other);
            overlap > 0.0 && overlap >= params.overlap_threshold
        });
        if conflict {
            continue;
        }
        index.insert(CrownBox {
            idx: kept.len(),
            env,
        });
        kept.push((i, crown));
    }
    kept
}
