//! Error taxonomy.
//!
//! Fatal errors ([`InputError`], [`ParameterError`]) abort a run before any
//! tile is processed and are wrapped by [`Error`]. The remaining families are
//! per-tile, per-seed or per-plot outcomes: they are logged, recorded in the
//! run summaries and never abort the batch.

use crate::tiling::TileId;

/// Unreadable or inconsistent input data.
#[derive(thiserror::Error, Debug)]
pub enum InputError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unsupported pixel format in {path}")]
    UnsupportedPixelFormat { path: String },
    #[error("invalid vector data in {path}: {reason}")]
    InvalidVector { path: String, reason: String },
    #[error("coordinate reference mismatch: raster EPSG:{raster}, vector EPSG:{vector}")]
    CrsMismatch { raster: u32, vector: u32 },
    #[error("window rows {row0}..{row1}, cols {col0}..{col1} outside raster {nrow}x{ncol}")]
    WindowOutOfBounds {
        row0: usize,
        row1: usize,
        col0: usize,
        col1: usize,
        nrow: usize,
        ncol: usize,
    },
}

/// Non-positive or inconsistent run parameters.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("chip_size must be positive")]
    ZeroChipSize,
    #[error("chip_stride must satisfy 0 < stride <= size (stride={stride}, size={size})")]
    StrideOutOfRange { stride: usize, size: usize },
    #[error("resolution must be positive and finite (got {0})")]
    NonPositiveResolution(f64),
    #[error("raster resolution {raster} does not match tiling resolution {tiling}")]
    ResolutionMismatch { raster: f64, tiling: f64 },
    #[error("{name} must lie in [0, 1] (got {value})")]
    OutOfUnitRange { name: &'static str, value: f64 },
    #[error("{name} must be non-negative and finite (got {value})")]
    Negative { name: &'static str, value: f64 },
    #[error("{name} must be positive and finite (got {value})")]
    NonPositive { name: &'static str, value: f64 },
    #[error("{name} is {value}, above the limit of {max}")]
    TooLarge { name: &'static str, value: f64, max: f64 },
    #[error("radius model is not non-decreasing in height (a={a}, b={b})")]
    NonMonotonicRadius { a: f64, b: f64 },
    #[error("median filter size must be odd (got {0})")]
    EvenMedianSize(usize),
    #[error("raster is empty")]
    EmptyRaster,
}

/// A tile that contributes no tree tops.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionFailure {
    #[error("tile {0} has no valid cells")]
    NoData(TileId),
    #[error("tile {0} has no local maxima above the minimum height")]
    NoMaxima(TileId),
}

/// A seed whose crown could not be turned into a polygon.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("seed {seed} lies on a no-data or below-threshold cell")]
    InvalidSeedCell { seed: usize },
    #[error("seed {seed} grew an empty region")]
    EmptyRegion { seed: usize },
    #[error("seed {seed} produced a degenerate outline ({vertices} vertices, area {area})")]
    Degenerate {
        seed: usize,
        vertices: usize,
        area: f64,
    },
}

/// A plot that cannot be registered.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AlignmentFailure {
    #[error("plot {0} has no field trees inside its boundary")]
    NoFieldTrees(String),
    #[error("plot {0} has no detected trees")]
    NoDetectedTrees(String),
    #[error("plot {0}: no shift produced a single match")]
    NoViableMatch(String),
}

/// Fatal errors that abort a run before processing begins.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
