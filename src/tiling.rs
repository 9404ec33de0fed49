//! Overlapping tile grid over a raster (the "chips" of the detection run).
//!
//! Windows of `chip_size` pixels advance by `chip_stride` pixels along each
//! axis. Each tile also owns a *core*: the window shrunk by half the overlap
//! margin on every side shared with a neighbouring tile. Cores are half-open
//! intervals in continuous pixel coordinates and partition the raster
//! exactly, which is what lets [`crate::suppression`] keep each tree once.

use crate::error::ParameterError;
use crate::raster::RasterSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Tiling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingParams {
    /// Window size in pixels.
    pub chip_size: usize,
    /// Step between consecutive window origins in pixels (`0 < stride <= size`).
    pub chip_stride: usize,
    /// Output resolution in ground units per pixel.
    pub resolution: f64,
}

impl Default for TilingParams {
    fn default() -> Self {
        Self {
            chip_size: 2000,
            chip_stride: 1900,
            resolution: 0.2,
        }
    }
}

impl TilingParams {
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.chip_size == 0 {
            return Err(ParameterError::ZeroChipSize);
        }
        if self.chip_stride == 0 || self.chip_stride > self.chip_size {
            return Err(ParameterError::StrideOutOfRange {
                stride: self.chip_stride,
                size: self.chip_size,
            });
        }
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(ParameterError::NonPositiveResolution(self.resolution));
        }
        Ok(())
    }

    /// Overlap between neighbouring windows in pixels.
    pub fn margin(&self) -> usize {
        self.chip_size - self.chip_stride
    }
}

/// Identifier of a tile: raster-scan index plus grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub index: usize,
    pub row: usize,
    pub col: usize,
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} (r{}, c{})", self.index, self.row, self.col)
    }
}

// ---------------------------------------------------------------------------
// Axis spans
// ---------------------------------------------------------------------------

/// One window along one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AxisSpan {
    start: usize,
    end: usize,
    core_start: f64,
    core_end: f64,
    shared_low: bool,
    shared_high: bool,
}

fn axis_spans(len: usize, size: usize, stride: usize) -> Vec<AxisSpan> {
    let mut windows: Vec<(usize, usize)> = Vec::new();
    if len <= size {
        windows.push((0, len));
    } else {
        let n = 1 + (len - size) / stride;
        windows.extend((0..n).map(|i| (i * stride, i * stride + size)));
        let rest = len - ((n - 1) * stride + size);
        if rest > 0 {
            if rest <= size - stride {
                // a strip no wider than the overlap is absorbed by the last window
                if let Some(last) = windows.last_mut() {
                    last.1 = len;
                }
            } else {
                windows.push((n * stride, len));
            }
        }
    }

    let half_margin = (size - stride) as f64 / 2.0;
    let count = windows.len();
    windows
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| {
            let shared_low = i > 0;
            let shared_high = i + 1 < count;
            AxisSpan {
                start,
                end,
                core_start: if shared_low { start as f64 + half_margin } else { 0.0 },
                core_end: if shared_high { end as f64 - half_margin } else { len as f64 },
                shared_low,
                shared_high,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tiles
// ---------------------------------------------------------------------------

/// Which sides of a tile border another tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedSides {
    pub top: bool,
    pub bottom: bool,
    pub left: bool,
    pub right: bool,
}

/// A rectangular raster window with its core region.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub id: TileId,
    /// Pixel rows of the window (half-open).
    pub rows: Range<usize>,
    /// Pixel columns of the window (half-open).
    pub cols: Range<usize>,
    /// Core rows in continuous pixel coordinates, `[start, end)`.
    pub core_rows: (f64, f64),
    /// Core columns in continuous pixel coordinates, `[start, end)`.
    pub core_cols: (f64, f64),
    pub shared: SharedSides,
    res_x: f64,
    res_y: f64,
}

impl Tile {
    /// Whether continuous pixel position `(row, col)` lies in the window.
    pub fn contains(&self, row: f64, col: f64) -> bool {
        row >= self.rows.start as f64
            && row < self.rows.end as f64
            && col >= self.cols.start as f64
            && col < self.cols.end as f64
    }

    /// Whether continuous pixel position `(row, col)` lies in the core.
    pub fn core_contains(&self, row: f64, col: f64) -> bool {
        row >= self.core_rows.0
            && row < self.core_rows.1
            && col >= self.core_cols.0
            && col < self.core_cols.1
    }

    /// Ground distances from `(row, col)` to the top, bottom, left and right
    /// window edges.
    pub fn edge_distances(&self, row: f64, col: f64) -> [f64; 4] {
        [
            (row - self.rows.start as f64) * self.res_y,
            (self.rows.end as f64 - row) * self.res_y,
            (col - self.cols.start as f64) * self.res_x,
            (self.cols.end as f64 - col) * self.res_x,
        ]
    }

    /// Planar ground distance from `(row, col)` to the nearest window edge.
    pub fn edge_distance(&self, row: f64, col: f64) -> f64 {
        self.edge_distances(row, col)
            .into_iter()
            .fold(f64::INFINITY, f64::min)
    }

    /// Cell size of the tile in ground units.
    pub fn resolution(&self) -> (f64, f64) {
        (self.res_x, self.res_y)
    }

    pub fn nrow(&self) -> usize {
        self.rows.len()
    }

    pub fn ncol(&self) -> usize {
        self.cols.len()
    }
}

/// Anything with a ground location that can seed a tile.
pub trait Located {
    fn xy(&self) -> (f64, f64);
}

impl Located for (f64, f64) {
    fn xy(&self) -> (f64, f64) {
        *self
    }
}

// ---------------------------------------------------------------------------
// Tile grid
// ---------------------------------------------------------------------------

/// The tile grid of one raster. Iteration is lazy and restartable.
#[derive(Debug, Clone)]
pub struct TileGrid {
    params: TilingParams,
    row_spans: Vec<AxisSpan>,
    col_spans: Vec<AxisSpan>,
    res_x: f64,
    res_y: f64,
    xmin: f64,
    ymax: f64,
}

impl TileGrid {
    /// Grid over an `nrow × ncol` raster with square cells of
    /// `params.resolution`, anchored at ground origin `(0, nrow * resolution)`.
    pub fn new(nrow: usize, ncol: usize, params: TilingParams) -> Result<Self, ParameterError> {
        params.validate()?;
        if nrow == 0 || ncol == 0 {
            return Err(ParameterError::EmptyRaster);
        }
        let row_spans = axis_spans(nrow, params.chip_size, params.chip_stride);
        let col_spans = axis_spans(ncol, params.chip_size, params.chip_stride);
        Ok(Self {
            params,
            row_spans,
            col_spans,
            res_x: params.resolution,
            res_y: params.resolution,
            xmin: 0.0,
            ymax: nrow as f64 * params.resolution,
        })
    }

    /// Grid over a raster source. The source must already be at the tiling
    /// resolution.
    pub fn for_source<S: RasterSource + ?Sized>(
        source: &S,
        params: TilingParams,
    ) -> Result<Self, ParameterError> {
        params.validate()?;
        let (res_x, res_y) = source.resolution();
        let tol = params.resolution * 1e-6;
        for res in [res_x, res_y] {
            if (res - params.resolution).abs() > tol {
                return Err(ParameterError::ResolutionMismatch {
                    raster: res,
                    tiling: params.resolution,
                });
            }
        }
        let (nrow, ncol) = source.shape();
        let (xmin, ymax) = source.origin();
        let mut grid = Self::new(nrow, ncol, params)?;
        grid.res_x = res_x;
        grid.res_y = res_y;
        grid.xmin = xmin;
        grid.ymax = ymax;
        Ok(grid)
    }

    pub fn params(&self) -> &TilingParams {
        &self.params
    }

    /// Number of tiles; known before any tile is produced.
    pub fn len(&self) -> usize {
        self.row_spans.len() * self.col_spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(tile rows, tile columns)`.
    pub fn dims(&self) -> (usize, usize) {
        (self.row_spans.len(), self.col_spans.len())
    }

    /// Half the overlap margin in ground units, or 0 when a single tile
    /// covers the raster.
    pub fn suppression_distance(&self) -> f64 {
        if self.len() == 1 {
            0.0
        } else {
            self.params.margin() as f64 * self.params.resolution / 2.0
        }
    }

    /// Tile at raster-scan `index`.
    pub fn tile(&self, index: usize) -> Option<Tile> {
        if index >= self.len() {
            return None;
        }
        let ncols = self.col_spans.len();
        let (tr, tc) = (index / ncols, index % ncols);
        let rs = self.row_spans[tr];
        let cs = self.col_spans[tc];
        Some(Tile {
            id: TileId {
                index,
                row: tr,
                col: tc,
            },
            rows: rs.start..rs.end,
            cols: cs.start..cs.end,
            core_rows: (rs.core_start, rs.core_end),
            core_cols: (cs.core_start, cs.core_end),
            shared: SharedSides {
                top: rs.shared_low,
                bottom: rs.shared_high,
                left: cs.shared_low,
                right: cs.shared_high,
            },
            res_x: self.res_x,
            res_y: self.res_y,
        })
    }

    /// Tiles in raster-scan order. Each call starts over.
    pub fn iter(&self) -> Tiles<'_> {
        Tiles {
            grid: self,
            next: 0,
        }
    }

    /// Continuous pixel coordinates `(row, col)` of a ground position.
    pub fn ground_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        ((self.ymax - y) / self.res_y, (x - self.xmin) / self.res_x)
    }

    /// Ground position of continuous pixel coordinates `(row, col)`.
    pub fn pixel_to_ground(&self, row: f64, col: f64) -> (f64, f64) {
        (self.xmin + col * self.res_x, self.ymax - row * self.res_y)
    }

    /// Raster-scan indices of every window containing `(row, col)`.
    pub fn windows_containing(&self, row: f64, col: f64) -> Vec<usize> {
        let ncols = self.col_spans.len();
        let rows = self
            .row_spans
            .iter()
            .enumerate()
            .filter(|(_, s)| row >= s.start as f64 && row < s.end as f64)
            .map(|(i, _)| i);
        let mut out = Vec::new();
        for tr in rows {
            for (tc, s) in self.col_spans.iter().enumerate() {
                if col >= s.start as f64 && col < s.end as f64 {
                    out.push(tr * ncols + tc);
                }
            }
        }
        out
    }

    /// Pair every tile with the features whose location falls in its window.
    ///
    /// Features in an overlap belong to every window covering them; window
    /// bounds are half-open so a feature on a shared boundary is assigned
    /// consistently.
    pub fn seeded<'a, F: Located>(&'a self, features: &'a [F]) -> SeededTiles<'a, F> {
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); self.len()];
        for (i, f) in features.iter().enumerate() {
            let (x, y) = f.xy();
            let (row, col) = self.ground_to_pixel(x, y);
            for t in self.windows_containing(row, col) {
                buckets[t].push(i);
            }
        }
        SeededTiles {
            grid: self,
            features,
            buckets,
            next: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Iterators
// ---------------------------------------------------------------------------

/// Lazy iterator over the tiles of a [`TileGrid`].
#[derive(Debug, Clone)]
pub struct Tiles<'a> {
    grid: &'a TileGrid,
    next: usize,
}

impl Iterator for Tiles<'_> {
    type Item = Tile;

    fn next(&mut self) -> Option<Tile> {
        let tile = self.grid.tile(self.next)?;
        self.next += 1;
        Some(tile)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.grid.len().saturating_sub(self.next);
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for Tiles<'_> {}

/// A tile paired with the indices and references of its seed features.
#[derive(Debug, Clone)]
pub struct SeededTile<'a, F> {
    pub tile: Tile,
    pub features: Vec<(usize, &'a F)>,
}

/// Lazy iterator produced by [`TileGrid::seeded`].
#[derive(Debug, Clone)]
pub struct SeededTiles<'a, F> {
    grid: &'a TileGrid,
    features: &'a [F],
    buckets: Vec<Vec<usize>>,
    next: usize,
}

impl<'a, F> SeededTiles<'a, F> {
    /// The seeded tile at raster-scan `index`, independent of iteration state.
    pub fn get(&self, index: usize) -> Option<SeededTile<'a, F>> {
        let tile = self.grid.tile(index)?;
        let features = self.buckets[index]
            .iter()
            .map(|&i| (i, &self.features[i]))
            .collect();
        Some(SeededTile { tile, features })
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }
}

impl<'a, F> Iterator for SeededTiles<'a, F> {
    type Item = SeededTile<'a, F>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.get(self.next)?;
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.grid.len().saturating_sub(self.next);
        (rest, Some(rest))
    }
}

impl<F> ExactSizeIterator for SeededTiles<'_, F> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(size: usize, stride: usize, res: f64) -> TilingParams {
        TilingParams {
            chip_size: size,
            chip_stride: stride,
            resolution: res,
        }
    }

    #[test]
    fn test_reference_scenario_four_tiles() {
        let grid = TileGrid::new(4000, 4000, params(2000, 1900, 0.2)).unwrap();
        assert_eq!(grid.len(), 4);
        assert_eq!(grid.dims(), (2, 2));
        assert!((grid.suppression_distance() - 10.0).abs() < 1e-9);
        let last = grid.tile(3).unwrap();
        assert_eq!(last.rows, 1900..4000);
        assert_eq!(last.cols, 1900..4000);
        assert_eq!(last.core_rows, (1950.0, 4000.0));
    }

    #[test]
    fn test_single_tile_has_no_suppression() {
        let grid = TileGrid::new(300, 500, params(600, 500, 0.5)).unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.suppression_distance(), 0.0);
        let t = grid.tile(0).unwrap();
        assert_eq!(t.core_rows, (0.0, 300.0));
        assert_eq!(t.core_cols, (0.0, 500.0));
        assert_eq!(t.shared, SharedSides::default());
    }

    #[test]
    fn test_wide_remainder_gets_clipped_tile() {
        let grid = TileGrid::new(10, 250, params(100, 90, 1.0)).unwrap();
        let cols: Vec<_> = grid.iter().map(|t| t.cols).collect();
        assert_eq!(cols, vec![0..100, 90..190, 180..250]);
    }

    #[test]
    fn test_cores_partition_every_pixel() {
        for &(len, size, stride) in &[
            (97usize, 20usize, 20usize),
            (97, 20, 15),
            (97, 20, 7),
            (97, 21, 8),
            (40, 20, 19),
            (20, 20, 1),
            (13, 50, 10),
            (101, 10, 1),
        ] {
            let grid = TileGrid::new(len, len, params(size, stride, 1.0)).unwrap();
            let mut hits = vec![0u32; len * len];
            for tile in grid.iter() {
                for r in tile.rows.clone() {
                    for c in tile.cols.clone() {
                        if tile.core_contains(r as f64 + 0.5, c as f64 + 0.5) {
                            hits[r * len + c] += 1;
                        }
                    }
                }
            }
            assert!(
                hits.iter().all(|&h| h == 1),
                "cores do not partition for len={len} size={size} stride={stride}"
            );
        }
    }

    #[test]
    fn test_windows_cover_raster() {
        let grid = TileGrid::new(55, 31, params(12, 5, 1.0)).unwrap();
        for r in 0..55 {
            for c in 0..31 {
                let (rf, cf) = (r as f64 + 0.5, c as f64 + 0.5);
                assert!(!grid.windows_containing(rf, cf).is_empty());
                let owners: Vec<Tile> = grid.iter().filter(|t| t.core_contains(rf, cf)).collect();
                assert_eq!(owners.len(), 1);
                assert!(owners[0].contains(rf, cf));
            }
        }
    }

    #[test]
    fn test_iteration_is_restartable_and_ordered() {
        let grid = TileGrid::new(50, 50, params(20, 15, 1.0)).unwrap();
        let first: Vec<_> = grid.iter().map(|t| t.id).collect();
        let second: Vec<_> = grid.iter().map(|t| t.id).collect();
        assert_eq!(first, second);
        assert_eq!(grid.iter().len(), grid.len());
        for (i, id) in first.iter().enumerate() {
            assert_eq!(id.index, i);
        }
        assert!(first.windows(2).all(|w| (w[0].row, w[0].col) < (w[1].row, w[1].col)));
    }

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(
            TileGrid::new(10, 10, params(0, 0, 1.0)).unwrap_err(),
            ParameterError::ZeroChipSize
        );
        assert!(matches!(
            TileGrid::new(10, 10, params(10, 11, 1.0)),
            Err(ParameterError::StrideOutOfRange { .. })
        ));
        assert!(matches!(
            TileGrid::new(10, 10, params(10, 0, 1.0)),
            Err(ParameterError::StrideOutOfRange { .. })
        ));
        assert!(matches!(
            TileGrid::new(10, 10, params(10, 5, -1.0)),
            Err(ParameterError::NonPositiveResolution(_))
        ));
    }

    #[test]
    fn test_seeded_boundary_features_assigned_once() {
        // windows along x: [0,10), [10,20); point exactly on x = 10
        let grid = TileGrid::new(10, 20, params(10, 10, 1.0)).unwrap();
        let features = vec![(10.0, 5.0), (9.999, 5.0), (0.0, 10.0)];
        let seeded: Vec<_> = grid.seeded(&features).collect();
        assert_eq!(seeded.len(), 2);
        let ids0: Vec<usize> = seeded[0].features.iter().map(|(i, _)| *i).collect();
        let ids1: Vec<usize> = seeded[1].features.iter().map(|(i, _)| *i).collect();
        assert_eq!(ids0, vec![1, 2]);
        assert_eq!(ids1, vec![0]);
    }

    #[test]
    fn test_seeded_overlap_features_in_every_window() {
        let grid = TileGrid::new(10, 30, params(20, 10, 1.0)).unwrap();
        assert_eq!(grid.len(), 2);
        let features = vec![(15.0, 5.0)];
        let counts: Vec<usize> = grid.seeded(&features).map(|s| s.features.len()).collect();
        assert_eq!(counts, vec![1, 1]);
    }
}
