//! # chmtrees: tree detection on canopy height models
//!
//! Individual trees are found on large canopy height rasters by processing
//! overlapping tiles independently and reconciling the tile overlaps:
//!
//! - **Tiling** ([`tiling`]): overlapping windows with cores that partition
//!   the raster.
//! - **Tree tops** ([`treetops`], [`suppression`]): variable-window local
//!   maxima per tile, then removal of the copies found in tile overlaps.
//! - **Crowns** ([`crowns`], [`merge`]): seeded watershed per tile, then
//!   greedy overlap suppression across tiles.
//! - **Plot registration** ([`alignment`], [`tree_matching`],
//!   [`imputation`]): the shift aligning field-surveyed plots with the
//!   detected trees, and the detection accuracy after alignment.
//!
//! [`pipeline`] runs the tiled stages in parallel; [`io`] reads GeoTIFF
//! rasters and reads/writes CSV and GeoJSON vectors.

pub mod alignment;
pub mod config;
pub mod crowns;
pub mod error;
pub mod filters;
pub mod imputation;
pub mod io;
pub mod merge;
pub mod outline;
pub mod pipeline;
pub mod raster;
pub mod suppression;
pub mod tiling;
pub mod tree_matching;
pub mod treetops;

#[cfg(test)]
mod testutil;

pub use alignment::{align_plots, AlignParams, Alignment, Plot, PlotAligner, Shift};
pub use config::{AlignConfig, DetectionConfig};
pub use crowns::{CrownGrower, CrownParams, CrownPolygon};
pub use error::{AlignmentFailure, DetectionFailure, Error, GeometryError, InputError, ParameterError};
pub use merge::{merge_crowns, MergeParams, OverlapMetric};
pub use pipeline::{detect_crowns, detect_treetops, detect_trees, CancelToken};
pub use raster::{Raster, RasterSource, Resampled};
pub use suppression::EdgeSuppressor;
pub use tiling::{Tile, TileGrid, TileId, TilingParams};
pub use treetops::{ConfidenceFeature, Detection, RadiusFunction, RadiusModel, TreeTopDetector, TreeTopParams};
