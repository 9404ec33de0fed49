//! Tiled detection runs.
//!
//! Tiles are read one window at a time from a [`RasterSource`] and processed
//! in parallel; results are gathered in tile order so a run is reproducible
//! regardless of scheduling. Tree tops are edge-suppressed per tile as they
//! are found. Crowns are grown per seeded tile and merged in one global
//! pass. A [`CancelToken`] stops the run at tile granularity: finished tiles
//! keep their results and the rest are counted as cancelled.

use crate::config::DetectionConfig;
use crate::crowns::{CrownGrower, CrownParams, CrownPolygon, GrowOutcome};
use crate::error::{DetectionFailure, Error, GeometryError, InputError};
use crate::io;
use crate::merge::{merge_crowns, MergeParams};
use crate::raster::RasterSource;
use crate::suppression::EdgeSuppressor;
use crate::tiling::{TileGrid, TilingParams};
use crate::treetops::{Detection, TreeTopDetector, TreeTopParams};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that stops a run before its next tile.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Run reports
// ---------------------------------------------------------------------------

/// Summary of a tree-top run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeTopReport {
    pub tiles_total: usize,
    pub tiles_processed: usize,
    pub tiles_cancelled: usize,
    /// Tiles that produced no tree top, and why.
    pub empty_tiles: Vec<DetectionFailure>,
    pub suppression_distance: f64,
    pub detections_before_suppression: usize,
    pub detections_after_suppression: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TreeTopRun {
    pub treetops: Vec<Detection>,
    pub report: TreeTopReport,
}

/// Summary of a crown run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrownReport {
    pub tiles_total: usize,
    pub tiles_processed: usize,
    pub tiles_cancelled: usize,
    /// Tiles without any seed, never read.
    pub tiles_without_seeds: usize,
    pub crowns_grown: usize,
    /// Seeds that did not yield a polygon.
    pub dropped: Vec<GeometryError>,
    /// Crowns removed by the cross-tile merge.
    pub suppressed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CrownRun {
    pub crowns: Vec<CrownPolygon>,
    pub report: CrownReport,
}

/// Tree tops and crowns of one raster.
#[derive(Debug, Clone, Default)]
pub struct DetectionRun {
    pub treetops: TreeTopRun,
    pub crowns: Option<CrownRun>,
}

enum TileOutcome<T> {
    Cancelled,
    Skipped,
    Done(T),
}

// ---------------------------------------------------------------------------
// Tree tops
// ---------------------------------------------------------------------------

/// Detect tree tops over every tile of `source` and remove the duplicates
/// produced by tile overlap.
pub fn detect_treetops<S>(
    source: &S,
    tiling: &TilingParams,
    params: &TreeTopParams,
    cancel: &CancelToken,
) -> Result<TreeTopRun, Error>
where
    S: RasterSource + Sync + ?Sized,
{
    let grid = TileGrid::for_source(source, *tiling)?;
    let detector = TreeTopDetector::from_params(params)?;
    let suppressor = EdgeSuppressor::for_grid(&grid);
    info!(
        "tree tops: {} tiles ({}x{}), suppression distance {}",
        grid.len(),
        grid.dims().0,
        grid.dims().1,
        suppressor.distance()
    );

    let outcomes: Vec<Result<TileOutcome<_>, InputError>> = (0..grid.len())
        .into_par_iter()
        .map(|index| {
            if cancel.is_cancelled() {
                return Ok(TileOutcome::Cancelled);
            }
            let Some(tile) = grid.tile(index) else {
                return Ok(TileOutcome::Skipped);
            };
            let (cells, surface) = detector
                .smoothing()
                .read_smoothed(source, tile.rows.clone(), tile.cols.clone())?;
            let found = detector
                .detect_on_surface(&tile, &cells, surface.as_ref().unwrap_or(&cells))
                .map(|dets| suppressor.suppress_tile(&grid, &tile, dets));
            Ok(TileOutcome::Done(found))
        })
        .collect();

    let mut run = TreeTopRun {
        treetops: Vec::new(),
        report: TreeTopReport {
            tiles_total: grid.len(),
            suppression_distance: suppressor.distance(),
            ..TreeTopReport::default()
        },
    };
    for outcome in outcomes {
        match outcome? {
            TileOutcome::Cancelled => run.report.tiles_cancelled += 1,
            TileOutcome::Skipped => {}
            TileOutcome::Done(Ok(kept)) => {
                run.report.tiles_processed += 1;
                run.report.detections_before_suppression += kept.kept.len() + kept.removed;
                run.treetops.extend(kept.kept);
            }
            TileOutcome::Done(Err(failure)) => {
                run.report.tiles_processed += 1;
                debug!("{failure}");
                run.report.empty_tiles.push(failure);
            }
        }
    }
    run.report.detections_after_suppression = run.treetops.len();

    if run.report.tiles_cancelled > 0 {
        warn!(
            "tree tops: run cancelled, {} of {} tiles skipped",
            run.report.tiles_cancelled, run.report.tiles_total
        );
    }
    info!(
        "tree tops: {} detections, {} after suppression, {} empty tiles",
        run.report.detections_before_suppression,
        run.report.detections_after_suppression,
        run.report.empty_tiles.len()
    );
    Ok(run)
}

// ---------------------------------------------------------------------------
// Crowns
// ---------------------------------------------------------------------------

/// Grow a crown around every tree top and merge the duplicates from
/// overlapping tiles.
///
/// `seed_crs` is the EPSG code of the tree-top coordinates; it must match
/// the raster's when both are known.
pub fn detect_crowns<S>(
    source: &S,
    tiling: &TilingParams,
    crowns: &CrownParams,
    merge: &MergeParams,
    treetops: &[Detection],
    seed_crs: Option<u32>,
    cancel: &CancelToken,
) -> Result<CrownRun, Error>
where
    S: RasterSource + Sync + ?Sized,
{
    io::ensure_same_crs(source.crs(), seed_crs)?;
    merge.validate()?;
    let grid = TileGrid::for_source(source, *tiling)?;
    let grower = CrownGrower::new(*crowns)?;
    let seeded = grid.seeded(treetops);
    info!("crowns: {} seeds over {} tiles", treetops.len(), grid.len());

    let outcomes: Vec<Result<TileOutcome<GrowOutcome>, InputError>> = (0..grid.len())
        .into_par_iter()
        .map(|index| {
            if cancel.is_cancelled() {
                return Ok(TileOutcome::Cancelled);
            }
            let Some(st) = seeded.get(index) else {
                return Ok(TileOutcome::Skipped);
            };
            if st.features.is_empty() {
                return Ok(TileOutcome::Skipped);
            }
            let cells = source.read_window(st.tile.rows.clone(), st.tile.cols.clone())?;
            Ok(TileOutcome::Done(grower.grow(&st.tile, &cells, &st.features)))
        })
        .collect();

    let mut report = CrownReport {
        tiles_total: grid.len(),
        ..CrownReport::default()
    };
    let mut grown = Vec::new();
    for outcome in outcomes {
        match outcome? {
            TileOutcome::Cancelled => report.tiles_cancelled += 1,
            TileOutcome::Skipped => {
                report.tiles_processed += 1;
                report.tiles_without_seeds += 1;
            }
            TileOutcome::Done(out) => {
                report.tiles_processed += 1;
                for e in &out.dropped {
                    warn!("dropping crown: {e}");
                }
                report.dropped.extend(out.dropped);
                grown.extend(out.crowns);
            }
        }
    }
    report.crowns_grown = grown.len();

    let merged = merge_crowns(grown, merge)?;
    report.suppressed = merged.suppressed;
    if report.tiles_cancelled > 0 {
        warn!(
            "crowns: run cancelled, {} of {} tiles skipped",
            report.tiles_cancelled, report.tiles_total
        );
    }
    info!(
        "crowns: {} grown, {} dropped, {} kept after merge",
        report.crowns_grown,
        report.dropped.len(),
        merged.kept.len()
    );
    Ok(CrownRun {
        crowns: merged.kept,
        report,
    })
}

/// Full detection run: tree tops, then (if enabled) crowns seeded by them.
pub fn detect_trees<S>(
    source: &S,
    config: &DetectionConfig,
    cancel: &CancelToken,
) -> Result<DetectionRun, Error>
where
    S: RasterSource + Sync + ?Sized,
{
    config.validate()?;
    let treetops = detect_treetops(source, &config.tiling, &config.treetops, cancel)?;
    let crowns = if config.grow_crowns {
        Some(detect_crowns(
            source,
            &config.tiling,
            &config.crowns,
            &config.merge,
            &treetops.treetops,
            source.crs(),
            cancel,
        )?)
    } else {
        None
    };
    Ok(DetectionRun { treetops, crowns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParameterError;
    use crate::raster::Raster;
    use crate::testutil::bumps;
    use crate::treetops::RadiusModel;

    fn tiling(size: usize, stride: usize) -> TilingParams {
        TilingParams {
            chip_size: size,
            chip_stride: stride,
            resolution: 1.0,
        }
    }

    fn fixed(radius: f64) -> TreeTopParams {
        TreeTopParams {
            radius: RadiusModel::Fixed { radius },
            ..TreeTopParams::default()
        }
    }

    #[test]
    fn test_cancelled_run_keeps_nothing_and_counts_tiles() {
        let r = bumps(60, 60, &[(30.0, 30.0, 20.0, 3.0)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let run = detect_treetops(&r, &tiling(20, 15), &fixed(3.0), &cancel).unwrap();
        assert!(run.treetops.is_empty());
        assert_eq!(run.report.tiles_cancelled, run.report.tiles_total);
        assert_eq!(run.report.tiles_processed, 0);
    }

    #[test]
    fn test_empty_tiles_are_reported_not_fatal() {
        let mut r = bumps(40, 40, &[(8.0, 8.0, 15.0, 2.0)]);
        for row in 20..40 {
            for col in 0..40 {
                r.set(row, col, f64::NAN);
            }
        }
        let run = detect_treetops(&r, &tiling(20, 20), &fixed(2.0), &CancelToken::new()).unwrap();
        assert_eq!(run.treetops.len(), 1);
        assert_eq!(run.report.tiles_processed, 4);
        assert_eq!(run.report.empty_tiles.len(), 3);
        assert!(run
            .report
            .empty_tiles
            .iter()
            .any(|f| matches!(f, DetectionFailure::NoData(_))));
    }

    #[test]
    fn test_resolution_mismatch_is_fatal() {
        let r = Raster::new(10, 10, 5.0);
        let params = TilingParams {
            resolution: 0.5,
            ..tiling(10, 10)
        };
        let err = detect_treetops(&r, &params, &fixed(1.0), &CancelToken::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::Parameter(ParameterError::ResolutionMismatch { .. })
        ));
    }

    #[test]
    fn test_crs_mismatch_is_fatal() {
        let r = Raster::new(10, 10, 5.0).with_crs(Some(32610));
        let err = detect_crowns(
            &r,
            &tiling(10, 10),
            &CrownParams::default(),
            &MergeParams::default(),
            &[],
            Some(4326),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Input(InputError::CrsMismatch {
                raster: 32610,
                vector: 4326
            })
        ));
    }

    #[test]
    fn test_seedless_tiles_are_not_read() {
        let r = bumps(40, 40, &[(8.0, 8.0, 15.0, 2.0)]);
        let top = detect_treetops(&r, &tiling(20, 20), &fixed(2.0), &CancelToken::new()).unwrap();
        let crowns = detect_crowns(
            &r,
            &tiling(20, 20),
            &CrownParams::default(),
            &MergeParams::default(),
            &top.treetops,
            None,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(crowns.crowns.len(), 1);
        assert_eq!(crowns.report.tiles_without_seeds, 3);
        assert_eq!(crowns.report.suppressed, 0);
    }
}
