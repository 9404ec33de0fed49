//! Georeferenced 2D height grid and the windowed-read seam used by the pipeline.

use crate::error::InputError;
use std::ops::Range;

/// A 2D raster (row-major). Origin is top-left.
///
/// Geo-referencing: pixel (r, c) maps to world coordinates:
///   x = xmin + (c + 0.5) * res_x
///   y = ymax - (r + 0.5) * res_y
///
/// No-data cells are stored as NaN; `nodata` keeps the value the source file
/// used so that it can be written back.
#[derive(Debug, Clone)]
pub struct Raster {
    pub nrow: usize,
    pub ncol: usize,
    pub data: Vec<f64>,
    /// Resolution in X direction (cell width)
    pub res_x: f64,
    /// Resolution in Y direction (cell height)
    pub res_y: f64,
    /// Geographic extent
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    /// No-data sentinel of the source, if any.
    pub nodata: Option<f64>,
    /// EPSG code of the coordinate reference, if known.
    pub crs: Option<u32>,
}

impl Raster {
    /// Create a new raster filled with a constant value.
    pub fn new(nrow: usize, ncol: usize, fill: f64) -> Self {
        Self::from_vec(nrow, ncol, vec![fill; nrow * ncol])
    }

    /// Create a raster from an existing Vec (row-major).
    pub fn from_vec(nrow: usize, ncol: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), nrow * ncol);
        Self {
            nrow,
            ncol,
            data,
            res_x: 1.0,
            res_y: 1.0,
            xmin: 0.0,
            xmax: ncol as f64,
            ymin: 0.0,
            ymax: nrow as f64,
            nodata: None,
            crs: None,
        }
    }

    /// Create a raster with geographic extent.
    pub fn with_extent(mut self, xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Self {
        self.xmin = xmin;
        self.xmax = xmax;
        self.ymin = ymin;
        self.ymax = ymax;
        self.res_x = (xmax - xmin) / self.ncol as f64;
        self.res_y = (ymax - ymin) / self.nrow as f64;
        self
    }

    /// Place the raster at `(xmin, ymax)` with square cells of `res`.
    pub fn with_origin(self, xmin: f64, ymax: f64, res: f64) -> Self {
        let xmax = xmin + self.ncol as f64 * res;
        let ymin = ymax - self.nrow as f64 * res;
        self.with_extent(xmin, xmax, ymin, ymax)
    }

    pub fn with_crs(mut self, epsg: Option<u32>) -> Self {
        self.crs = epsg;
        self
    }

    /// Replace every cell equal to `nodata` by NaN and remember the sentinel.
    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        if let Some(nd) = nodata {
            for v in self.data.iter_mut() {
                if *v == nd || (nd.is_nan() && v.is_nan()) {
                    *v = f64::NAN;
                }
            }
        }
        self.nodata = nodata;
        self
    }

    /// Get value at (row, col), returns NaN if out of bounds.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        if row < self.nrow && col < self.ncol {
            self.data[row * self.ncol + col]
        } else {
            f64::NAN
        }
    }

    /// Get value at (row, col) as Option; `None` outside the grid or on no-data.
    #[inline]
    pub fn get_opt(&self, row: isize, col: isize) -> Option<f64> {
        if row >= 0 && col >= 0 && (row as usize) < self.nrow && (col as usize) < self.ncol {
            let v = self.data[row as usize * self.ncol + col as usize];
            if v.is_nan() {
                None
            } else {
                Some(v)
            }
        } else {
            None
        }
    }

    /// Set value at (row, col).
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        if row < self.nrow && col < self.ncol {
            self.data[row * self.ncol + col] = val;
        }
    }

    /// Convert world X,Y to continuous pixel coordinates `(row, col)`.
    ///
    /// The centre of cell (r, c) maps to `(r + 0.5, c + 0.5)`.
    pub fn xy_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        ((self.ymax - y) / self.res_y, (x - self.xmin) / self.res_x)
    }

    /// Convert world X,Y to row,col.
    pub fn xy_to_rc(&self, x: f64, y: f64) -> (usize, usize) {
        let (row, col) = self.xy_to_pixel(x, y);
        let row = row.floor().max(0.0) as usize;
        let col = col.floor().max(0.0) as usize;
        (row.min(self.nrow.saturating_sub(1)), col.min(self.ncol.saturating_sub(1)))
    }

    /// Convert row,col to world X,Y (cell centre).
    pub fn rc_to_xy(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.xmin + (col as f64 + 0.5) * self.res_x;
        let y = self.ymax - (row as f64 + 0.5) * self.res_y;
        (x, y)
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cells holding data.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// Copy the cells of `rows × cols` into a new raster georeferenced at
    /// the window's position.
    pub fn window(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Raster, InputError> {
        if rows.start > rows.end || cols.start > cols.end || rows.end > self.nrow || cols.end > self.ncol
        {
            return Err(InputError::WindowOutOfBounds {
                row0: rows.start,
                row1: rows.end,
                col0: cols.start,
                col1: cols.end,
                nrow: self.nrow,
                ncol: self.ncol,
            });
        }
        let nrow = rows.len();
        let ncol = cols.len();
        let mut data = Vec::with_capacity(nrow * ncol);
        for r in rows.clone() {
            let start = r * self.ncol;
            data.extend_from_slice(&self.data[start + cols.start..start + cols.end]);
        }
        let xmin = self.xmin + cols.start as f64 * self.res_x;
        let ymax = self.ymax - rows.start as f64 * self.res_y;
        let mut out = Raster::from_vec(nrow, ncol, data).placed(xmin, ymax, self.res_x, self.res_y);
        out.nodata = self.nodata;
        out.crs = self.crs;
        Ok(out)
    }

    /// Put the top-left corner at `(xmin, ymax)` with cells of
    /// `res_x × res_y`. Unlike [`Raster::with_extent`] this also works for
    /// empty grids.
    pub fn placed(mut self, xmin: f64, ymax: f64, res_x: f64, res_y: f64) -> Self {
        self.res_x = res_x;
        self.res_y = res_y;
        self.xmin = xmin;
        self.xmax = xmin + self.ncol as f64 * res_x;
        self.ymax = ymax;
        self.ymin = ymax - self.nrow as f64 * res_y;
        self
    }
}

// ---------------------------------------------------------------------------
// Windowed sources
// ---------------------------------------------------------------------------

/// Source of height windows.
///
/// The pipeline never touches the whole grid: it asks for one tile window at
/// a time, so a source backed by a chunked file reader can stream large
/// rasters. [`Raster`] implements it for in-memory data.
pub trait RasterSource {
    /// `(nrow, ncol)` of the full grid.
    fn shape(&self) -> (usize, usize);
    /// `(res_x, res_y)` cell size in ground units.
    fn resolution(&self) -> (f64, f64);
    /// `(xmin, ymax)` of the top-left corner.
    fn origin(&self) -> (f64, f64);
    /// EPSG code, if known.
    fn crs(&self) -> Option<u32>;
    /// Read a georeferenced window of the grid.
    fn read_window(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Raster, InputError>;
}

impl RasterSource for Raster {
    fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    fn resolution(&self) -> (f64, f64) {
        (self.res_x, self.res_y)
    }

    fn origin(&self) -> (f64, f64) {
        (self.xmin, self.ymax)
    }

    fn crs(&self) -> Option<u32> {
        self.crs
    }

    fn read_window(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Raster, InputError> {
        self.window(rows, cols)
    }
}

/// Nearest-neighbour view of a source at square cells of `resolution`.
///
/// Each output cell centre samples the source cell containing it. Windows
/// are resampled on demand from a single read of the source cells they
/// cover, so wrapping a streaming source keeps it streaming.
#[derive(Debug, Clone)]
pub struct Resampled<S> {
    inner: S,
    resolution: f64,
    nrow: usize,
    ncol: usize,
}

impl<S: RasterSource> Resampled<S> {
    pub fn new(inner: S, resolution: f64) -> Self {
        let (nrow, ncol) = inner.shape();
        let (res_x, res_y) = inner.resolution();
        Self {
            nrow: ((nrow as f64 * res_y / resolution).round() as usize).max(1),
            ncol: ((ncol as f64 * res_x / resolution).round() as usize).max(1),
            inner,
            resolution,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Source index sampled by output index `i` along an axis of source
    /// cell size `src_res`.
    fn source_index(&self, i: usize, src_res: f64) -> usize {
        ((i as f64 + 0.5) * self.resolution / src_res).floor() as usize
    }
}

impl<S: RasterSource> RasterSource for Resampled<S> {
    fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    fn resolution(&self) -> (f64, f64) {
        (self.resolution, self.resolution)
    }

    fn origin(&self) -> (f64, f64) {
        self.inner.origin()
    }

    fn crs(&self) -> Option<u32> {
        self.inner.crs()
    }

    fn read_window(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Raster, InputError> {
        if rows.start > rows.end || cols.start > cols.end || rows.end > self.nrow || cols.end > self.ncol {
            return Err(InputError::WindowOutOfBounds {
                row0: rows.start,
                row1: rows.end,
                col0: cols.start,
                col1: cols.end,
                nrow: self.nrow,
                ncol: self.ncol,
            });
        }
        let (xmin, ymax) = self.inner.origin();
        let xmin = xmin + cols.start as f64 * self.resolution;
        let ymax = ymax - rows.start as f64 * self.resolution;
        let (nrow, ncol) = (rows.len(), cols.len());
        if nrow == 0 || ncol == 0 {
            return Ok(Raster::from_vec(nrow, ncol, Vec::new())
                .placed(xmin, ymax, self.resolution, self.resolution)
                .with_crs(self.inner.crs()));
        }

        let (src_nrow, src_ncol) = self.inner.shape();
        let (src_res_x, src_res_y) = self.inner.resolution();
        let src_rows: Vec<usize> = rows.clone().map(|r| self.source_index(r, src_res_y)).collect();
        let src_cols: Vec<usize> = cols.clone().map(|c| self.source_index(c, src_res_x)).collect();
        // output cells past the source edge stay no-data
        let row0 = src_rows[0].min(src_nrow);
        let row1 = (src_rows[nrow - 1] + 1).min(src_nrow);
        let col0 = src_cols[0].min(src_ncol);
        let col1 = (src_cols[ncol - 1] + 1).min(src_ncol);
        let src = self.inner.read_window(row0..row1, col0..col1)?;

        let mut data = Vec::with_capacity(nrow * ncol);
        for &sr in &src_rows {
            for &sc in &src_cols {
                data.push(if sr < row1 && sc < col1 {
                    src.get(sr - row0, sc - col0)
                } else {
                    f64::NAN
                });
            }
        }
        let mut out = Raster::from_vec(nrow, ncol, data)
            .placed(xmin, ymax, self.resolution, self.resolution)
            .with_crs(self.inner.crs());
        out.nodata = src.nodata;
        Ok(out)
    }
}
