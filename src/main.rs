//! Tree detection on canopy height GeoTIFFs and field-plot registration.
//!
//! Usage:
//!   chmtrees detect CHM.tif [CHM2.tif ...] --output-dir out -a 0 -b 0.0325 -c 0.25
//!   chmtrees align --field-trees trees.csv --plots plots.geojson --detected-dir out/a0.0_b0.0325_c0.25
//!
//! `detect` writes `<stem>_tree_tops.csv`, `<stem>_tree_tops.geojson` and
//! `<stem>_tree_crowns.geojson` into an `a{a}_b{b}_c{c}` folder.
//! `align` writes the per-plot shifts and the shifted field trees.

use chmtrees::{
    alignment::{align_plots, Plot},
    config::{AlignConfig, DetectionConfig},
    error::{Error, InputError},
    imputation::impute_heights,
    io,
    merge::OverlapMetric,
    pipeline::{detect_trees, CancelToken},
    treetops::{ConfidenceFeature, RadiusModel},
    RasterSource, Resampled,
};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(Parser, Debug)]
#[command(
    name = "chmtrees",
    about = "Tiled tree-top and crown detection on canopy height models"
)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect tree tops and crowns on one or more CHM GeoTIFFs
    Detect(DetectArgs),
    /// Register field plots against detected tree tops
    Align(AlignArgs),
}

#[derive(Args, Debug)]
struct DetectArgs {
    /// Input CHM GeoTIFF(s)
    #[arg(value_name = "CHM.tif", num_args = 1.., required = true)]
    tif_paths: Vec<PathBuf>,

    /// JSON run configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root folder of the outputs
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Tile size in pixels
    #[arg(long)]
    chip_size: Option<usize>,

    /// Tile stride in pixels
    #[arg(long)]
    chip_stride: Option<usize>,

    /// Working resolution (ground units per pixel); rasters are resampled to it
    #[arg(long)]
    resolution: Option<f64>,

    /// Quadratic coefficient of the search radius
    #[arg(short = 'a', allow_negative_numbers = true)]
    a: Option<f64>,

    /// Linear coefficient of the search radius
    #[arg(short = 'b', allow_negative_numbers = true)]
    b: Option<f64>,

    /// Constant term of the search radius
    #[arg(short = 'c', allow_negative_numbers = true)]
    c: Option<f64>,

    /// Minimum tree-top height
    #[arg(long)]
    min_height: Option<f64>,

    /// Confidence of tree tops and crowns
    #[arg(long, value_enum)]
    confidence: Option<ConfidenceFeature>,

    /// Crown overlap metric
    #[arg(long, value_enum)]
    overlap_metric: Option<OverlapMetric>,

    /// Crowns overlapping a better crown by this much are dropped
    #[arg(long)]
    overlap_threshold: Option<f64>,

    /// Deduplicate crowns per tile before the global merge
    #[arg(long)]
    per_region_pass: bool,

    /// Only detect tree tops
    #[arg(long)]
    no_crowns: bool,
}

#[derive(Args, Debug)]
struct AlignArgs {
    /// Field trees CSV (plot_id, x, y, height, dbh, live_dead, height_allometric)
    #[arg(long)]
    field_trees: PathBuf,

    /// Plot boundaries GeoJSON with a plot_id property
    #[arg(long)]
    plots: PathBuf,

    /// Folder holding `<plot_id>_..._tree_tops.csv` files
    #[arg(long)]
    detected_dir: PathBuf,

    /// JSON registration configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Largest shift tried along each axis
    #[arg(long)]
    max_shift: Option<f64>,

    /// Spacing of the shift grid
    #[arg(long)]
    grid_step: Option<f64>,

    /// Keep dead trees
    #[arg(long)]
    keep_dead: bool,

    /// Fit the height-diameter model on the measured field trees
    #[arg(long)]
    fit_height_model: bool,

    /// Per-plot shifts CSV
    #[arg(long, default_value = "plot_shifts.csv")]
    output: PathBuf,

    /// Shifted field trees CSV
    #[arg(long, default_value = "shifted_field_trees.csv")]
    shifted: PathBuf,
}

// ==========================================================================
// detect
// ==========================================================================

fn detection_config(args: &DetectArgs) -> Result<DetectionConfig, Error> {
    let mut cfg = match &args.config {
        Some(p) => DetectionConfig::load_json(p)?,
        None => DetectionConfig::default(),
    };
    if let Some(v) = args.chip_size {
        cfg.tiling.chip_size = v;
    }
    if let Some(v) = args.chip_stride {
        cfg.tiling.chip_stride = v;
    }
    if let Some(v) = args.resolution {
        cfg.tiling.resolution = v;
    }
    if args.a.is_some() || args.b.is_some() || args.c.is_some() {
        let (a0, b0, c0) = match cfg.treetops.radius {
            RadiusModel::Allometric { a, b, c } => (a, b, c),
            RadiusModel::Fixed { radius } => (0.0, 0.0, radius),
        };
        cfg.treetops.radius = RadiusModel::Allometric {
            a: args.a.unwrap_or(a0),
            b: args.b.unwrap_or(b0),
            c: args.c.unwrap_or(c0),
        };
    }
    if let Some(v) = args.min_height {
        cfg.treetops.min_height = v;
    }
    if let Some(v) = args.confidence {
        cfg.treetops.confidence = v;
        cfg.crowns.confidence = v;
    }
    if let Some(v) = args.overlap_metric {
        cfg.merge.overlap_metric = v;
    }
    if let Some(v) = args.overlap_threshold {
        cfg.merge.overlap_threshold = v;
    }
    if args.per_region_pass {
        cfg.merge.run_per_region_pass = true;
    }
    if args.no_crowns {
        cfg.grow_crowns = false;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "chm".into())
}

fn run_detect(args: &DetectArgs) -> Result<(), Error> {
    let cfg = detection_config(args)?;
    let out_dir = args.output_dir.join(cfg.experiment_name());
    fs::create_dir_all(&out_dir).map_err(InputError::from)?;
    info!("writing to {}", out_dir.display());
    let cancel = CancelToken::new();

    for path in &args.tif_paths {
        info!("opening {}", path.display());
        let chm = io::GeoTiffSource::open(path)?;
        let (res_x, res_y) = chm.resolution();
        let target = cfg.tiling.resolution;
        if (res_x - target).abs() > target * 1e-6 || (res_y - target).abs() > target * 1e-6 {
            info!("resampling from ({res_x}, {res_y}) to {target}");
            detect_file(&Resampled::new(chm, target), path, &out_dir, &cfg, &cancel)?;
        } else {
            detect_file(&chm, path, &out_dir, &cfg, &cancel)?;
        }
    }
    Ok(())
}

fn detect_file<S: RasterSource + Sync>(
    chm: &S,
    path: &Path,
    out_dir: &Path,
    cfg: &DetectionConfig,
    cancel: &CancelToken,
) -> Result<(), Error> {
    let (nrow, ncol) = chm.shape();
    let (res_x, res_y) = chm.resolution();
    info!(
        "{} x {} pixels ({:.2} ha)",
        ncol,
        nrow,
        ncol as f64 * res_x * nrow as f64 * res_y / 10000.0
    );

    let t0 = std::time::Instant::now();
    let run = detect_trees(chm, cfg, cancel)?;
    let stem = file_stem(path);
    let tops = &run.treetops.treetops;
    io::write_treetops_csv(out_dir.join(format!("{stem}_tree_tops.csv")), tops)?;
    io::write_treetops_geojson(out_dir.join(format!("{stem}_tree_tops.geojson")), tops, chm.crs())?;

    let report = &run.treetops.report;
    println!(
        "{}: {} tree tops ({} before suppression, {} empty tiles of {}) in {:.2}s",
        path.display(),
        tops.len(),
        report.detections_before_suppression,
        report.empty_tiles.len(),
        report.tiles_total,
        t0.elapsed().as_secs_f64()
    );
    if let Some(crowns) = &run.crowns {
        io::write_crowns_geojson(
            out_dir.join(format!("{stem}_tree_crowns.geojson")),
            &crowns.crowns,
            chm.crs(),
        )?;
        println!(
            "{}: {} crowns ({} grown, {} seeds dropped, {} merged away)",
            path.display(),
            crowns.crowns.len(),
            crowns.report.crowns_grown,
            crowns.report.dropped.len(),
            crowns.report.suppressed
        );
    }
    Ok(())
}

// ==========================================================================
// align
// ==========================================================================

fn align_config(args: &AlignArgs) -> Result<AlignConfig, Error> {
    let mut cfg = match &args.config {
        Some(p) => AlignConfig::load_json(p)?,
        None => AlignConfig::default(),
    };
    if let Some(v) = args.max_shift {
        cfg.align.max_shift = v;
    }
    if let Some(v) = args.grid_step {
        cfg.align.grid_step = v;
    }
    if args.keep_dead {
        cfg.imputation.drop_dead = false;
    }
    if args.fit_height_model {
        cfg.imputation.fit_model = true;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Detected tree-top files keyed by plot id (the file name up to the first `_`).
fn detected_files(dir: &Path) -> Result<HashMap<String, PathBuf>, Error> {
    let mut files = HashMap::new();
    for entry in fs::read_dir(dir).map_err(InputError::from)? {
        let path = entry.map_err(InputError::from)?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with("_tree_tops.csv") {
            continue;
        }
        if let Some(id) = name.split('_').next() {
            files.insert(id.to_string(), path.clone());
        }
    }
    Ok(files)
}

fn run_align(args: &AlignArgs) -> Result<(), Error> {
    let cfg = align_config(args)?;
    let field = io::read_field_trees_csv(&args.field_trees)?;
    let prepared = impute_heights(field, &cfg.imputation);
    let (boundaries, plots_crs) = io::read_plot_boundaries_geojson(&args.plots)?;
    let files = detected_files(&args.detected_dir)?;

    let mut plots = Vec::with_capacity(boundaries.len());
    for (id, boundary) in boundaries {
        let detected = match files.get(&id) {
            Some(p) => {
                // the CSV has no CRS; its GeoJSON sibling does
                let geojson = p.with_extension("geojson");
                if geojson.exists() {
                    io::ensure_same_crs(io::read_geojson_crs(&geojson)?, plots_crs)?;
                } else {
                    debug!("plot {id}: no {}, CRS not checked", geojson.display());
                }
                io::read_treetops_csv(p)?
                    .into_iter()
                    .map(|t| [t.x, t.y, t.height])
                    .collect()
            }
            None => {
                warn!("plot {id}: no detected tree-top file");
                Vec::new()
            }
        };
        let field_trees = prepared
            .trees
            .iter()
            .filter(|t| t.plot_id == id)
            .cloned()
            .collect();
        plots.push(Plot {
            id,
            boundary,
            field_trees,
            detected,
        });
    }

    if cfg.imputation.fit_model {
        println!(
            "height-diameter model: k0={:.4} k1={:.4}",
            prepared.model.k0, prepared.model.k1
        );
    }
    let batch = align_plots(&plots, &cfg.align)?;
    io::write_shifts_csv(&args.output, &batch.aligned)?;
    let shifted: Vec<_> = batch
        .aligned
        .iter()
        .flat_map(|a| a.shifted_field_trees.iter().cloned())
        .collect();
    io::write_field_trees_csv(&args.shifted, &shifted)?;

    for a in &batch.aligned {
        println!(
            "{:>24}  dx={:>7.2}  dy={:>7.2}  matches={:>4}  residual={:>8.2}",
            a.plot_id, a.shift.dx, a.shift.dy, a.shift.matches, a.shift.residual
        );
    }
    println!(
        "{} plots aligned, {} failed",
        batch.aligned.len(),
        batch.failed.len()
    );
    for f in &batch.failed {
        println!("  skipped: {f}");
    }
    Ok(())
}

// ==========================================================================
// Main
// ==========================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let result = match &cli.command {
        Command::Detect(args) => run_detect(args),
        Command::Align(args) => run_align(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
