//! Edge suppression of duplicated tree tops.
//!
//! A tree standing in a tile overlap is found once per tile covering it. With
//! the suppression distance set to half the overlap margin, keeping only the
//! detections at least that far from every edge shared with another tile
//! keeps exactly the ones inside their tile's core. Cores partition the
//! raster, so each tree survives once. Edges on the raster border never
//! suppress anything.

use crate::tiling::{Tile, TileGrid};
use crate::treetops::Detection;

/// Tolerance in pixels for ground → pixel round trips.
const PIXEL_EPS: f64 = 1e-6;

/// Result of a suppression pass.
#[derive(Debug, Clone, Default)]
pub struct SuppressionOutcome {
    pub kept: Vec<Detection>,
    pub removed: usize,
}

/// Retains detections far enough from shared tile edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeSuppressor {
    distance: f64,
}

impl EdgeSuppressor {
    /// Suppressor with an explicit distance in ground units.
    pub fn new(distance: f64) -> Self {
        Self {
            distance: distance.max(0.0),
        }
    }

    /// Suppressor using the grid's own suppression distance (0 for a single
    /// tile).
    pub fn for_grid(grid: &TileGrid) -> Self {
        Self::new(grid.suppression_distance())
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    /// Whether `det`, produced in `tile`, is kept.
    ///
    /// Low edges (top, left) are inclusive and high edges (bottom, right)
    /// exclusive, matching the half-open cores.
    pub fn keeps(&self, grid: &TileGrid, tile: &Tile, det: &Detection) -> bool {
        if self.distance == 0.0 {
            return true;
        }
        let (res_x, res_y) = tile.resolution();
        let (row, col) = grid.ground_to_pixel(det.x, det.y);
        let d_row = self.distance / res_y;
        let d_col = self.distance / res_x;

        let top = row - tile.rows.start as f64;
        let bottom = tile.rows.end as f64 - row;
        let left = col - tile.cols.start as f64;
        let right = tile.cols.end as f64 - col;

        (!tile.shared.top || top >= d_row - PIXEL_EPS)
            && (!tile.shared.bottom || bottom > d_row + PIXEL_EPS)
            && (!tile.shared.left || left >= d_col - PIXEL_EPS)
            && (!tile.shared.right || right > d_col + PIXEL_EPS)
    }

    /// Filter the detections of a single tile.
    pub fn suppress_tile(&self, grid: &TileGrid, tile: &Tile, detections: Vec<Detection>) -> SuppressionOutcome {
        let total = detections.len();
        let kept: Vec<Detection> = detections
            .into_iter()
            .filter(|d| self.keeps(grid, tile, d))
            .collect();
        SuppressionOutcome {
            removed: total - kept.len(),
            kept,
        }
    }

    /// Filter detections from any number of tiles. Order is preserved.
    pub fn suppress(&self, grid: &TileGrid, detections: Vec<Detection>) -> SuppressionOutcome {
        let total = detections.len();
        let kept: Vec<Detection> = detections
            .into_iter()
            .filter(|d| match grid.tile(d.tile.index) {
                Some(tile) => self.keeps(grid, &tile, d),
                None => false,
            })
            .collect();
        SuppressionOutcome {
            removed: total - kept.len(),
            kept,
        }
    }
}
