//! Crown growing: seeded watershed inside one tile.
//!
//! Every seed (a tree top inside the tile window) claims its own pixel and
//! grows through 4-connected neighbours in decreasing height order. A pixel
//! joins the crown that reaches it first, so growth stops at height minima
//! and where neighbouring crowns meet. The claimed pixels of each seed are
//! traced into an outer ring and georeferenced as a polygon.

use crate::error::{GeometryError, ParameterError};
use crate::outline::{ring_area, trace_outline};
use crate::raster::Raster;
use crate::tiling::{Tile, TileId};
use crate::treetops::{ConfidenceFeature, Detection};
use geo::{Area, LineString, Polygon};
use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Parameters of [`CrownGrower`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrownParams {
    pub confidence: ConfidenceFeature,
    /// Pixels at or above this height can join a crown.
    pub min_height: f64,
    /// Minimum crown base height as a proportion of the seed height.
    pub crown_prop: Option<f64>,
    /// Maximum ground distance between a crown pixel centre and its seed.
    pub max_radius: Option<f64>,
}

impl Default for CrownParams {
    fn default() -> Self {
        Self {
            confidence: ConfidenceFeature::Distance,
            min_height: 2.0,
            crown_prop: None,
            max_radius: None,
        }
    }
}

impl CrownParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        if !self.min_height.is_finite() {
            return Err(ParameterError::Negative {
                name: "crown min_height",
                value: self.min_height,
            });
        }
        if let Some(p) = self.crown_prop {
            if !(0.0..=1.0).contains(&p) {
                return Err(ParameterError::OutOfUnitRange {
                    name: "crown_prop",
                    value: p,
                });
            }
        }
        if let Some(r) = self.max_radius {
            if !(r.is_finite() && r > 0.0) {
                return Err(ParameterError::NonPositive {
                    name: "max_radius",
                    value: r,
                });
            }
        }
        Ok(())
    }
}

/// A crown outline tied to the tree top it grew from.
#[derive(Debug, Clone, PartialEq)]
pub struct CrownPolygon {
    pub polygon: Polygon<f64>,
    /// Index of the seed in the tree-top collection.
    pub seed: usize,
    pub score: f64,
    /// Height of the seed cell.
    pub height: f64,
    /// Tile the crown was grown in.
    pub tile: TileId,
}

impl CrownPolygon {
    pub fn area(&self) -> f64 {
        self.polygon.unsigned_area()
    }
}

/// Crowns of one tile plus the seeds that failed.
#[derive(Debug, Clone, Default)]
pub struct GrowOutcome {
    pub crowns: Vec<CrownPolygon>,
    pub dropped: Vec<GeometryError>,
}

// ---------------------------------------------------------------------------
// Watershed
// ---------------------------------------------------------------------------

/// Priority queue item for the watershed.
#[derive(Debug)]
struct WatershedItem {
    row: usize,
    col: usize,
    height: f64,
    /// Insertion counter; earlier items win height ties.
    seq: u64,
}

impl PartialEq for WatershedItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for WatershedItem {}

impl PartialOrd for WatershedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WatershedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap on height, then FIFO on insertion
        self.height
            .total_cmp(&other.height)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

const NEIGHBOURS: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// Seeded crown grower for one tile.
#[derive(Debug, Clone)]
pub struct CrownGrower {
    params: CrownParams,
}

impl CrownGrower {
    pub fn new(params: CrownParams) -> Result<Self, ParameterError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &CrownParams {
        &self.params
    }

    /// Grow one crown per seed in `cells`, the raster window of `tile`.
    ///
    /// `seeds` pairs each tree top with its index in the global collection.
    /// Seeds off the window, on no-data or below the minimum height, and
    /// seeds whose region cannot be outlined, are reported in `dropped`.
    pub fn grow(&self, tile: &Tile, cells: &Raster, seeds: &[(usize, &Detection)]) -> GrowOutcome {
        let (nrow, ncol) = (cells.nrow, cells.ncol);
        let mut labels: Vec<Option<usize>> = vec![None; nrow * ncol];
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;
        let mut outcome = GrowOutcome::default();

        // (seed index, pixel, seed height) of every seed that claimed a cell
        let mut placed: Vec<(usize, (usize, usize), f64)> = Vec::with_capacity(seeds.len());
        for &(seed, det) in seeds {
            let Some((r, c)) = seed_pixel(cells, det) else {
                outcome.dropped.push(GeometryError::InvalidSeedCell { seed });
                continue;
            };
            let h = cells.get(r, c);
            if h.is_nan() || h < self.params.min_height {
                outcome.dropped.push(GeometryError::InvalidSeedCell { seed });
                continue;
            }
            let idx = r * ncol + c;
            if labels[idx].is_some() {
                // another seed already sits on this cell
                outcome.dropped.push(GeometryError::EmptyRegion { seed });
                continue;
            }
            labels[idx] = Some(placed.len());
            heap.push(WatershedItem {
                row: r,
                col: c,
                height: h,
                seq,
            });
            seq += 1;
            placed.push((seed, (r, c), h));
        }

        let max_r2 = self.params.max_radius.map(|r| r * r);
        while let Some(item) = heap.pop() {
            let Some(label) = labels[item.row * ncol + item.col] else {
                continue;
            };
            let (_, (sr, sc), seed_h) = placed[label];
            let floor = self
                .params
                .crown_prop
                .map_or(self.params.min_height, |p| self.params.min_height.max(p * seed_h));
            for &(dr, dc) in &NEIGHBOURS {
                let Some(h) = cells.get_opt(item.row as isize + dr, item.col as isize + dc) else {
                    continue;
                };
                let nr = (item.row as isize + dr) as usize;
                let nc = (item.col as isize + dc) as usize;
                let idx = nr * ncol + nc;
                if labels[idx].is_some() || h > item.height || h < floor {
                    continue;
                }
                if let Some(max_r2) = max_r2 {
                    let gx = (nc as f64 - sc as f64) * cells.res_x;
                    let gy = (nr as f64 - sr as f64) * cells.res_y;
                    if gx * gx + gy * gy > max_r2 {
                        continue;
                    }
                }
                labels[idx] = Some(label);
                heap.push(WatershedItem {
                    row: nr,
                    col: nc,
                    height: h,
                    seq,
                });
                seq += 1;
            }
        }

        let mut regions: Vec<Vec<(usize, usize)>> = vec![Vec::new(); placed.len()];
        for r in 0..nrow {
            for c in 0..ncol {
                if let Some(label) = labels[r * ncol + c] {
                    regions[label].push((r, c));
                }
            }
        }

        for ((seed, (sr, sc), seed_h), pixels) in placed.into_iter().zip(regions) {
            match outline_polygon(cells, seed, &pixels) {
                Ok(polygon) => {
                    let row_f = (tile.rows.start + sr) as f64 + 0.5;
                    let col_f = (tile.cols.start + sc) as f64 + 0.5;
                    let edge = tile.edge_distance(row_f, col_f);
                    outcome.crowns.push(CrownPolygon {
                        polygon,
                        seed,
                        score: self.params.confidence.score(seed_h, edge),
                        height: seed_h,
                        tile: tile.id,
                    });
                }
                Err(e) => outcome.dropped.push(e),
            }
        }

        if !outcome.dropped.is_empty() {
            debug!(
                "tile {}: {} crowns grown, {} seeds dropped",
                tile.id,
                outcome.crowns.len(),
                outcome.dropped.len()
            );
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Outlines
// ---------------------------------------------------------------------------

/// Window cell holding the seed location, if inside the window.
fn seed_pixel(cells: &Raster, det: &Detection) -> Option<(usize, usize)> {
    let (row, col) = cells.xy_to_pixel(det.x, det.y);
    if row < 0.0 || col < 0.0 || row >= cells.nrow as f64 || col >= cells.ncol as f64 {
        return None;
    }
    Some((row.floor() as usize, col.floor() as usize))
}

/// Ground polygon of a pixel region. Pixel corner `(col, row)` maps to
/// `(xmin + col·res_x, ymax − row·res_y)`.
fn outline_polygon(
    cells: &Raster,
    seed: usize,
    pixels: &[(usize, usize)],
) -> Result<Polygon<f64>, GeometryError> {
    if pixels.is_empty() {
        return Err(GeometryError::EmptyRegion { seed });
    }
    let ring = trace_outline(pixels);
    let area = ring_area(&ring).abs();
    if ring.len() < 4 || area == 0.0 {
        return Err(GeometryError::Degenerate {
            seed,
            vertices: ring.len(),
            area,
        });
    }
    let coords: Vec<(f64, f64)> = ring
        .iter()
        .map(|&(c, r)| {
            (
                cells.xmin + c as f64 * cells.res_x,
                cells.ymax - r as f64 * cells.res_y,
            )
        })
        .collect();
    Ok(Polygon::new(LineString::from(coords), vec![]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::bumps;
    use crate::tiling::{TileGrid, TilingParams};
    use approx::assert_relative_eq;

    fn single_tile(r: &Raster) -> Tile {
        let n = r.nrow.max(r.ncol);
        let grid = TileGrid::new(
            r.nrow,
            r.ncol,
            TilingParams {
                chip_size: n,
                chip_stride: n,
                resolution: 1.0,
            },
        )
        .unwrap();
        grid.tile(0).unwrap()
    }

    fn seed_at(r: &Raster, row: usize, col: usize) -> Detection {
        let (x, y) = r.rc_to_xy(row, col);
        Detection {
            x,
            y,
            height: r.get(row, col),
            score: 0.0,
            radius: 1.0,
            tile: single_tile(r).id,
        }
    }

    fn grower(params: CrownParams) -> CrownGrower {
        CrownGrower::new(params).unwrap()
    }

    #[test]
    fn test_single_seed_claims_connected_canopy() {
        let mut r = Raster::new(10, 10, 0.0);
        for row in 2..6 {
            for col in 3..8 {
                r.set(row, col, 10.0 - (row as f64 - 3.0).abs() - (col as f64 - 5.0).abs());
            }
        }
        let tile = single_tile(&r);
        let seed = seed_at(&r, 3, 5);
        let out = grower(CrownParams::default()).grow(&tile, &r, &[(7, &seed)]);
        assert!(out.dropped.is_empty());
        assert_eq!(out.crowns.len(), 1);
        let crown = &out.crowns[0];
        assert_eq!(crown.seed, 7);
        assert_relative_eq!(crown.area(), 20.0);
        assert_eq!(crown.height, 10.0);
    }

    #[test]
    fn test_neighbouring_seeds_split_at_the_valley() {
        let r = bumps(20, 30, &[(10.0, 8.0, 20.0, 3.0), (10.0, 21.0, 18.0, 3.0)]);
        let tile = single_tile(&r);
        let a = seed_at(&r, 10, 8);
        let b = seed_at(&r, 10, 21);
        let params = CrownParams {
            confidence: ConfidenceFeature::Height,
            ..CrownParams::default()
        };
        let out = grower(params).grow(&tile, &r, &[(0, &a), (1, &b)]);
        assert_eq!(out.crowns.len(), 2);
        assert_eq!(out.crowns[0].score, 20.0);
        // each crown stays on its side of the valley near column 14.5
        let x_split = 14.5;
        for (crown, left) in out.crowns.iter().zip([true, false]) {
            for p in crown.polygon.exterior().points() {
                if left {
                    assert!(p.x() <= x_split + 1.0);
                } else {
                    assert!(p.x() >= x_split - 1.0);
                }
            }
        }
    }

    #[test]
    fn test_crown_prop_and_max_radius_shrink_crowns() {
        let r = bumps(31, 31, &[(15.0, 15.0, 20.0, 5.0)]);
        let tile = single_tile(&r);
        let seed = seed_at(&r, 15, 15);
        let full = grower(CrownParams::default()).grow(&tile, &r, &[(0, &seed)]);
        let prop = grower(CrownParams {
            crown_prop: Some(0.5),
            ..CrownParams::default()
        })
        .grow(&tile, &r, &[(0, &seed)]);
        let radius = grower(CrownParams {
            max_radius: Some(3.0),
            ..CrownParams::default()
        })
        .grow(&tile, &r, &[(0, &seed)]);
        let a_full = full.crowns[0].area();
        assert!(prop.crowns[0].area() < a_full);
        assert!(radius.crowns[0].area() < a_full);
        // disc of radius 3 px: 29 cell centres
        assert_relative_eq!(radius.crowns[0].area(), 29.0);
    }

    #[test]
    fn test_bad_seeds_are_dropped_not_fatal() {
        let mut r = bumps(20, 20, &[(10.0, 10.0, 15.0, 3.0)]);
        r.set(2, 2, f64::NAN);
        let tile = single_tile(&r);
        let good = seed_at(&r, 10, 10);
        let on_nodata = seed_at(&r, 2, 2);
        let duplicate = good.clone();
        let mut outside = good.clone();
        outside.x += 100.0;
        let out = grower(CrownParams::default()).grow(
            &tile,
            &r,
            &[(0, &good), (1, &on_nodata), (2, &duplicate), (3, &outside)],
        );
        assert_eq!(out.crowns.len(), 1);
        assert_eq!(out.crowns[0].seed, 0);
        assert_eq!(
            out.dropped,
            vec![
                GeometryError::InvalidSeedCell { seed: 1 },
                GeometryError::EmptyRegion { seed: 2 },
                GeometryError::InvalidSeedCell { seed: 3 },
            ]
        );
    }

    #[test]
    fn test_distance_score_and_georeference() {
        let r = bumps(12, 12, &[(3.0, 4.0, 10.0, 1.0)]).with_origin(1000.0, 2000.0, 0.5);
        let grid = TileGrid::new(
            12,
            12,
            TilingParams {
                chip_size: 12,
                chip_stride: 12,
                resolution: 0.5,
            },
        )
        .unwrap();
        let tile = grid.tile(0).unwrap();
        let seed = seed_at(&r, 3, 4);
        let out = grower(CrownParams::default()).grow(&tile, &r, &[(0, &seed)]);
        let crown = &out.crowns[0];
        // 3.5 px to the top edge at 0.5 m per pixel
        assert_relative_eq!(crown.score, 1.75);
        for p in crown.polygon.exterior().points() {
            assert!(p.x() >= 1000.0 && p.x() <= 1006.0);
            assert!(p.y() <= 2000.0 && p.y() >= 1994.0);
        }
    }

    #[test]
    fn test_invalid_params() {
        assert!(CrownGrower::new(CrownParams {
            crown_prop: Some(1.5),
            ..CrownParams::default()
        })
        .is_err());
        assert!(CrownGrower::new(CrownParams {
            max_radius: Some(0.0),
            ..CrownParams::default()
        })
        .is_err());
    }
}
