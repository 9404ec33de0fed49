use approx::assert_relative_eq;
use chmtrees::{
    detect_trees, detect_treetops, CancelToken, ConfidenceFeature, CrownParams, DetectionConfig, EdgeSuppressor,
    InputError, MergeParams, RadiusModel, Raster, RasterSource, TileGrid, TilingParams, TreeTopDetector,
    TreeTopParams,
};
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Gaussian bumps `(row, col, height, sigma_px)` on a flat ground, unit cells.
fn canopy(nrow: usize, ncol: usize, peaks: &[(usize, usize, f64, f64)]) -> Raster {
    let mut r = Raster::new(nrow, ncol, 0.0);
    for row in 0..nrow {
        for col in 0..ncol {
            let mut v: f64 = 0.0;
            for &(pr, pc, h, s) in peaks {
                let d2 = (row as f64 - pr as f64).powi(2) + (col as f64 - pc as f64).powi(2);
                v = v.max(h * (-d2 / (2.0 * s * s)).exp());
            }
            r.set(row, col, v);
        }
    }
    r
}

/// Flat ground with Gaussian crowns, generated per window so a large grid
/// never exists in memory. Counts the windows read.
struct SyntheticChm {
    nrow: usize,
    ncol: usize,
    res: f64,
    /// `(row, col, height, sigma_px)`
    peaks: Vec<(usize, usize, f64, f64)>,
    reads: AtomicUsize,
    largest_read: AtomicUsize,
}

impl SyntheticChm {
    fn new(nrow: usize, ncol: usize, res: f64, peaks: Vec<(usize, usize, f64, f64)>) -> Self {
        Self {
            nrow,
            ncol,
            res,
            peaks,
            reads: AtomicUsize::new(0),
            largest_read: AtomicUsize::new(0),
        }
    }
}

impl RasterSource for SyntheticChm {
    fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    fn resolution(&self) -> (f64, f64) {
        (self.res, self.res)
    }

    fn origin(&self) -> (f64, f64) {
        (0.0, self.nrow as f64 * self.res)
    }

    fn crs(&self) -> Option<u32> {
        Some(32610)
    }

    fn read_window(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Raster, InputError> {
        assert!(rows.end <= self.nrow && cols.end <= self.ncol);
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.largest_read.fetch_max(rows.len() * cols.len(), Ordering::SeqCst);
        let (nrow, ncol) = (rows.len(), cols.len());
        let mut data = vec![0.0_f64; nrow * ncol];
        for &(pr, pc, h, s) in &self.peaks {
            let reach = (6.0 * s) as usize;
            for r in pr.saturating_sub(reach).max(rows.start)..(pr + reach + 1).min(rows.end) {
                for c in pc.saturating_sub(reach).max(cols.start)..(pc + reach + 1).min(cols.end) {
                    let d2 = (r as f64 - pr as f64).powi(2) + (c as f64 - pc as f64).powi(2);
                    let cell = &mut data[(r - rows.start) * ncol + (c - cols.start)];
                    *cell = cell.max(h * (-d2 / (2.0 * s * s)).exp());
                }
            }
        }
        let xmin = cols.start as f64 * self.res;
        let ymax = (self.nrow - rows.start) as f64 * self.res;
        Ok(Raster::from_vec(nrow, ncol, data)
            .placed(xmin, ymax, self.res, self.res)
            .with_crs(self.crs()))
    }
}

/// 4000 px at 0.2 m in 2000 px tiles every 1900 px: windows [0, 2000) and
/// [1900, 4000), cores [0, 1950) and [1950, 4000) along each axis.
fn large_tiling() -> TilingParams {
    TilingParams {
        chip_size: 2000,
        chip_stride: 1900,
        resolution: 0.2,
    }
}

fn tiling(size: usize, stride: usize) -> TilingParams {
    TilingParams {
        chip_size: size,
        chip_stride: stride,
        resolution: 1.0,
    }
}

fn treetop_params() -> TreeTopParams {
    TreeTopParams {
        radius: RadiusModel::Fixed { radius: 3.0 },
        ..TreeTopParams::default()
    }
}

#[test]
fn test_peak_in_overlaps_survives_once() {
    let tilings = [tiling(30, 20), tiling(40, 30), tiling(25, 15), tiling(36, 32)];
    let peaks = [(20, 20), (25, 44), (45, 45), (60, 35), (10, 78), (85, 5)];
    for t in tilings {
        for &(pr, pc) in &peaks {
            let chm = canopy(90, 90, &[(pr, pc, 15.0, 3.0)]);
            let run = detect_treetops(&chm, &t, &treetop_params(), &CancelToken::new()).unwrap();
            assert_eq!(
                run.treetops.len(),
                1,
                "peak ({pr}, {pc}) with tiling {}/{}",
                t.chip_size,
                t.chip_stride
            );
            let top = &run.treetops[0];
            assert!((top.x - (pc as f64 + 0.5)).abs() < 1e-9);
            assert!((top.y - (90.0 - pr as f64 - 0.5)).abs() < 1e-9);
            assert!((top.height - 15.0).abs() < 1e-9);
        }
    }
}

#[test]
fn test_single_tile_suppresses_nothing() {
    let chm = canopy(50, 60, &[(10, 10, 12.0, 2.0), (40, 45, 18.0, 3.0)]);
    let run = detect_treetops(&chm, &tiling(100, 100), &treetop_params(), &CancelToken::new()).unwrap();
    assert_eq!(run.report.tiles_total, 1);
    assert_eq!(run.report.suppression_distance, 0.0);
    assert_eq!(
        run.report.detections_before_suppression,
        run.report.detections_after_suppression
    );
    assert_eq!(run.treetops.len(), 2);
}

#[test]
fn test_results_do_not_depend_on_tiling() {
    let peaks = [
        (12, 15, 14.0, 2.5),
        (30, 52, 20.0, 3.0),
        (47, 22, 11.0, 2.0),
        (55, 70, 17.0, 3.5),
        (75, 40, 9.0, 2.0),
    ];
    let chm = canopy(90, 90, &peaks);
    let reference = detect_treetops(&chm, &tiling(90, 90), &treetop_params(), &CancelToken::new()).unwrap();
    let key = |run: &chmtrees::pipeline::TreeTopRun| -> BTreeSet<(i64, i64)> {
        run.treetops
            .iter()
            .map(|d| ((d.x * 10.0).round() as i64, (d.y * 10.0).round() as i64))
            .collect()
    };
    assert_eq!(reference.treetops.len(), peaks.len());
    for t in [tiling(30, 20), tiling(45, 30), tiling(28, 17)] {
        let run = detect_treetops(&chm, &t, &treetop_params(), &CancelToken::new()).unwrap();
        assert_eq!(run.treetops.len(), peaks.len());
        assert_eq!(key(&run), key(&reference));
    }
}

#[test]
fn test_crowns_grown_in_several_tiles_are_merged() {
    let chm = canopy(80, 80, &[(35, 35, 20.0, 3.0), (35, 62, 20.0, 3.0)]);
    let cfg = DetectionConfig {
        tiling: tiling(40, 30),
        treetops: treetop_params(),
        grow_crowns: true,
        crowns: CrownParams::default(),
        merge: MergeParams::default(),
    };
    let run = detect_trees(&chm, &cfg, &CancelToken::new()).unwrap();
    assert_eq!(run.treetops.treetops.len(), 2);

    let crowns = run.crowns.unwrap();
    assert!(crowns.report.crowns_grown > 2);
    assert_eq!(crowns.report.suppressed, crowns.report.crowns_grown - 2);
    assert!(crowns.report.dropped.is_empty());
    assert_eq!(crowns.crowns.len(), 2);
    let seeds: BTreeSet<usize> = crowns.crowns.iter().map(|c| c.seed).collect();
    assert_eq!(seeds, BTreeSet::from([0, 1]));
    for c in &crowns.crowns {
        assert!(c.area() > 50.0);
    }
}

#[test]
fn test_height_confidence_scores_by_height() {
    let chm = canopy(60, 60, &[(15, 15, 12.0, 2.0), (40, 40, 25.0, 3.0)]);
    let params = TreeTopParams {
        confidence: ConfidenceFeature::Height,
        ..treetop_params()
    };
    let run = detect_treetops(&chm, &tiling(30, 20), &params, &CancelToken::new()).unwrap();
    assert_eq!(run.treetops.len(), 2);
    for d in &run.treetops {
        assert_eq!(d.score, d.height);
    }
}

#[test]
fn test_disabled_crowns() {
    let chm = canopy(40, 40, &[(20, 20, 15.0, 3.0)]);
    let cfg = DetectionConfig {
        tiling: tiling(40, 40),
        treetops: treetop_params(),
        grow_crowns: false,
        ..DetectionConfig::default()
    };
    let run = detect_trees(&chm, &cfg, &CancelToken::new()).unwrap();
    assert_eq!(run.treetops.treetops.len(), 1);
    assert!(run.crowns.is_none());
}

#[test]
fn test_large_raster_detections_belong_to_core_owner() {
    // (row, col, expected owning tile)
    let expected = [
        (1000, 1940, 0),
        (500, 3500, 1),
        (1945, 700, 0),
        (1955, 600, 2),
        (3000, 1960, 3),
    ];
    let chm = SyntheticChm::new(
        4000,
        4000,
        0.2,
        expected.iter().map(|&(r, c, _)| (r, c, 20.0, 10.0)).collect(),
    );
    let cfg = DetectionConfig {
        tiling: large_tiling(),
        treetops: treetop_params(),
        grow_crowns: false,
        ..DetectionConfig::default()
    };
    let run = detect_trees(&chm, &cfg, &CancelToken::new()).unwrap();

    let report = &run.treetops.report;
    assert_eq!(report.tiles_total, 4);
    assert_relative_eq!(report.suppression_distance, 10.0, epsilon = 1e-9);
    // every peak but the one at (500, 3500) lies in two windows
    assert_eq!(report.detections_before_suppression, 9);
    assert_eq!(report.detections_after_suppression, 5);
    assert_eq!(chm.reads.load(Ordering::SeqCst), 4);
    assert_eq!(chm.largest_read.load(Ordering::SeqCst), 2100 * 2100);

    let tops = &run.treetops.treetops;
    assert_eq!(tops.len(), expected.len());
    for &(row, col, owner) in &expected {
        let x = (col as f64 + 0.5) * 0.2;
        let y = (4000.0 - row as f64 - 0.5) * 0.2;
        let found: Vec<_> = tops
            .iter()
            .filter(|d| (d.x - x).abs() < 1e-6 && (d.y - y).abs() < 1e-6)
            .collect();
        assert_eq!(found.len(), 1, "peak ({row}, {col})");
        assert_eq!(found[0].tile.index, owner, "peak ({row}, {col})");
        assert_relative_eq!(found[0].height, 20.0);
    }
}

#[test]
fn test_suppression_band_drops_in_one_tile_and_keeps_in_neighbour() {
    // 39.5 px from the right edge of tile 2, 60.5 px from the left edge of
    // tile 3; the band is 50 px wide
    let chm = SyntheticChm::new(4000, 4000, 0.2, vec![(3000, 1960, 20.0, 10.0)]);
    let grid = TileGrid::for_source(&chm, large_tiling()).unwrap();
    let suppressor = EdgeSuppressor::for_grid(&grid);
    let detector = TreeTopDetector::from_params(&treetop_params()).unwrap();

    let left = grid.tile(2).unwrap();
    let right = grid.tile(3).unwrap();
    assert_eq!((left.id.row, left.id.col, right.id.row, right.id.col), (1, 0, 1, 1));

    let cells = chm.read_window(left.rows.clone(), left.cols.clone()).unwrap();
    let in_left = detector.detect(&left, &cells).unwrap();
    assert_eq!(in_left.len(), 1);
    assert!(!suppressor.keeps(&grid, &left, &in_left[0]));

    let cells = chm.read_window(right.rows.clone(), right.cols.clone()).unwrap();
    let in_right = detector.detect(&right, &cells).unwrap();
    assert_eq!(in_right.len(), 1);
    assert!(suppressor.keeps(&grid, &right, &in_right[0]));
    assert_relative_eq!(in_left[0].x, in_right[0].x, epsilon = 1e-6);
    assert_relative_eq!(in_left[0].y, in_right[0].y, epsilon = 1e-6);
}
