//! File formats: GeoTIFF height rasters in, CSV and GeoJSON vectors in and
//! out.

use crate::alignment::Alignment;
use crate::crowns::CrownPolygon;
use crate::error::InputError;
use crate::imputation::FieldTree;
use crate::raster::{Raster, RasterSource};
use crate::treetops::Detection;
use csv::Writer;
use geo::{LineString, Polygon};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;

const PROJECTED_CS_TYPE_KEY: u32 = 3072;
const GEOGRAPHIC_TYPE_KEY: u32 = 2048;
const USER_DEFINED: u32 = 32767;

// ---------------------------------------------------------------------------
// GeoTIFF
// ---------------------------------------------------------------------------

/// Georeferencing read from the GeoTIFF tags of an open decoder.
#[derive(Debug, Clone, Copy)]
struct GeoTags {
    res_x: f64,
    res_y: f64,
    origin_x: f64,
    origin_y: f64,
    nodata: Option<f64>,
    epsg: Option<u32>,
}

fn geotiff_tags<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>, path: &Path) -> GeoTags {
    let mut tags = GeoTags {
        res_x: 1.0,
        res_y: 1.0,
        origin_x: 0.0,
        origin_y: 0.0,
        nodata: None,
        epsg: None,
    };

    match decoder.find_tag(Tag::ModelPixelScaleTag) {
        Ok(Some(v)) => match v.into_f64_vec() {
            Ok(scale) if scale.len() >= 2 => {
                tags.res_x = scale[0];
                tags.res_y = scale[1];
            }
            _ => warn!("{}: malformed ModelPixelScale, using 1.0", path.display()),
        },
        _ => warn!("{}: no ModelPixelScale tag, using 1.0", path.display()),
    }
    match decoder.find_tag(Tag::ModelTiepointTag) {
        Ok(Some(v)) => match v.into_f64_vec() {
            Ok(tie) if tie.len() >= 6 => {
                tags.origin_x = tie[3];
                tags.origin_y = tie[4];
            }
            _ => warn!("{}: malformed ModelTiepoint, origin at (0, 0)", path.display()),
        },
        _ => warn!("{}: no ModelTiepoint tag, origin at (0, 0)", path.display()),
    }
    if let Ok(Some(v)) = decoder.find_tag(Tag::GdalNodata) {
        if let Ok(s) = v.into_string() {
            tags.nodata = s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse().ok();
        }
    }
    if let Ok(Some(v)) = decoder.find_tag(Tag::GeoKeyDirectoryTag) {
        if let Ok(keys) = v.into_u32_vec() {
            tags.epsg = epsg_from_geokeys(&keys);
        }
    }
    debug!(
        "{}: res=({}, {}), origin=({:.2}, {:.2}), nodata={:?}, epsg={:?}",
        path.display(),
        tags.res_x,
        tags.res_y,
        tags.origin_x,
        tags.origin_y,
        tags.nodata,
        tags.epsg
    );
    tags
}

/// EPSG code from a GeoKey directory: the projected CRS if set, else the
/// geographic one.
fn epsg_from_geokeys(keys: &[u32]) -> Option<u32> {
    let header = keys.get(..4)?;
    let count = header[3] as usize;
    let mut projected = None;
    let mut geographic = None;
    for entry in keys[4..].chunks_exact(4).take(count) {
        // [key id, tag location, count, value]; location 0 means inline
        if entry[1] != 0 || entry[3] == USER_DEFINED {
            continue;
        }
        match entry[0] {
            PROJECTED_CS_TYPE_KEY => projected = Some(entry[3]),
            GEOGRAPHIC_TYPE_KEY => geographic = Some(entry[3]),
            _ => {}
        }
    }
    projected.or(geographic)
}

fn decoded_to_f64(result: DecodingResult, path: &Path) -> Result<Vec<f64>, InputError> {
    Ok(match result {
        DecodingResult::F64(v) => v,
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        _ => {
            return Err(InputError::UnsupportedPixelFormat {
                path: path.display().to_string(),
            })
        }
    })
}

/// A single-band GeoTIFF height raster read window by window.
///
/// Opening reads the header and the georeferencing tags only. Each
/// [`RasterSource::read_window`] call decodes the strips or tiles the window
/// touches, so memory stays bounded by the tile size. No-data cells become
/// NaN. Multi-band files are read from their first band.
#[derive(Debug, Clone)]
pub struct GeoTiffSource {
    path: PathBuf,
    nrow: usize,
    ncol: usize,
    chunk_rows: usize,
    chunk_cols: usize,
    chunks_across: usize,
    tags: GeoTags,
}

impl GeoTiffSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let path = path.as_ref().to_path_buf();
        let mut decoder = Decoder::new(BufReader::new(File::open(&path)?))?;
        let (width, height) = decoder.dimensions()?;
        let (chunk_w, chunk_h) = decoder.chunk_dimensions();
        if width == 0 || height == 0 || chunk_w == 0 || chunk_h == 0 {
            return Err(InputError::UnsupportedPixelFormat {
                path: path.display().to_string(),
            });
        }
        match decoder.colortype()? {
            ColorType::Gray(_) => {}
            other => warn!("{}: {:?} pixels, using band 0", path.display(), other),
        }
        let tags = geotiff_tags(&mut decoder, &path);
        debug!(
            "{}: {}x{} px in {}x{} chunks",
            path.display(),
            width,
            height,
            chunk_w,
            chunk_h
        );
        Ok(Self {
            nrow: height as usize,
            ncol: width as usize,
            chunk_rows: chunk_h as usize,
            chunk_cols: chunk_w as usize,
            chunks_across: width.div_ceil(chunk_w) as usize,
            tags,
            path,
        })
    }

    /// Sentinel value of no-data cells in the file.
    pub fn nodata(&self) -> Option<f64> {
        self.tags.nodata
    }
}

impl RasterSource for GeoTiffSource {
    fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    fn resolution(&self) -> (f64, f64) {
        (self.tags.res_x, self.tags.res_y)
    }

    fn origin(&self) -> (f64, f64) {
        (self.tags.origin_x, self.tags.origin_y)
    }

    fn crs(&self) -> Option<u32> {
        self.tags.epsg
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
        let (nrow, ncol) = (rows.len(), cols.len());
        let mut data = vec![f64::NAN; nrow * ncol];

        if nrow > 0 && ncol > 0 {
            // one decoder per window: windows are read from several threads
            let mut decoder = Decoder::new(BufReader::new(File::open(&self.path)?))?;
            let chunk_rows = (rows.start / self.chunk_rows)..=((rows.end - 1) / self.chunk_rows);
            let chunk_cols = (cols.start / self.chunk_cols)..=((cols.end - 1) / self.chunk_cols);
            for cr in chunk_rows {
                for cc in chunk_cols.clone() {
                    let index = (cr * self.chunks_across + cc) as u32;
                    let (w, h) = decoder.chunk_data_dimensions(index);
                    let (w, h) = (w as usize, h as usize);
                    let values = decoded_to_f64(decoder.read_chunk(index)?, &self.path)?;
                    if w == 0 || h == 0 || values.len() % (w * h) != 0 {
                        return Err(InputError::UnsupportedPixelFormat {
                            path: self.path.display().to_string(),
                        });
                    }
                    let bands = values.len() / (w * h);
                    let (r0, c0) = (cr * self.chunk_rows, cc * self.chunk_cols);
                    for r in rows.start.max(r0)..rows.end.min(r0 + h) {
                        for c in cols.start.max(c0)..cols.end.min(c0 + w) {
                            data[(r - rows.start) * ncol + (c - cols.start)] =
                                values[((r - r0) * w + (c - c0)) * bands];
                        }
                    }
                }
            }
        }

        let xmin = self.tags.origin_x + cols.start as f64 * self.tags.res_x;
        let ymax = self.tags.origin_y - rows.start as f64 * self.tags.res_y;
        Ok(Raster::from_vec(nrow, ncol, data)
            .placed(xmin, ymax, self.tags.res_x, self.tags.res_y)
            .with_nodata(self.tags.nodata)
            .with_crs(self.tags.epsg))
    }
}

// ---------------------------------------------------------------------------
// Tree tops
// ---------------------------------------------------------------------------

/// A tree top as stored in the tree-top CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeTopRecord {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    pub height: f64,
    pub score: f64,
    pub radius: f64,
    pub tile: usize,
}

/// Write tree tops as CSV: `id, x, y, height, score, radius, tile`.
pub fn write_treetops_csv(path: impl AsRef<Path>, treetops: &[Detection]) -> Result<(), InputError> {
    let file = File::create(path)?;
    let mut wtr = Writer::from_writer(BufWriter::new(file));
    wtr.write_record(["id", "x", "y", "height", "score", "radius", "tile"])?;
    for (i, t) in treetops.iter().enumerate() {
        wtr.write_record([
            i.to_string(),
            format!("{:.3}", t.x),
            format!("{:.3}", t.y),
            format!("{:.3}", t.height),
            format!("{:.3}", t.score),
            format!("{:.3}", t.radius),
            t.tile.index.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_treetops_csv(path: impl AsRef<Path>) -> Result<Vec<TreeTopRecord>, InputError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut out = Vec::new();
    for rec in rdr.deserialize() {
        out.push(rec?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// GeoJSON
// ---------------------------------------------------------------------------

/// GeoJSON `crs` member for an EPSG code.
fn crs_member(epsg: Option<u32>) -> Value {
    match epsg {
        Some(code) => json!({
            "type": "name",
            "properties": { "name": format!("urn:ogc:def:crs:EPSG::{code}") }
        }),
        None => Value::Null,
    }
}

fn feature_collection(features: Vec<Value>, epsg: Option<u32>) -> Value {
    let mut fc = json!({ "type": "FeatureCollection", "features": features });
    if epsg.is_some() {
        fc["crs"] = crs_member(epsg);
    }
    fc
}

fn write_json_file(path: impl AsRef<Path>, value: &Value) -> Result<(), InputError> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), value)?;
    Ok(())
}

/// Write tree tops as a GeoJSON point collection.
pub fn write_treetops_geojson(
    path: impl AsRef<Path>,
    treetops: &[Detection],
    epsg: Option<u32>,
) -> Result<(), InputError> {
    let features = treetops
        .iter()
        .enumerate()
        .map(|(i, t)| {
            json!({
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [t.x, t.y] },
                "properties": {
                    "id": i,
                    "height": t.height,
                    "score": t.score,
                    "radius": t.radius,
                    "tile": t.tile.index,
                }
            })
        })
        .collect();
    write_json_file(path, &feature_collection(features, epsg))
}

/// Write crowns as a GeoJSON polygon collection. `seed` refers to the row
/// of the tree-top outputs.
pub fn write_crowns_geojson(
    path: impl AsRef<Path>,
    crowns: &[CrownPolygon],
    epsg: Option<u32>,
) -> Result<(), InputError> {
    let features = crowns
        .iter()
        .map(|c| {
            let ring: Vec<[f64; 2]> = c.polygon.exterior().coords().map(|p| [p.x, p.y]).collect();
            json!({
                "type": "Feature",
                "geometry": { "type": "Polygon", "coordinates": [ring] },
                "properties": {
                    "seed": c.seed,
                    "score": c.score,
                    "height": c.height,
                    "tile": c.tile.index,
                }
            })
        })
        .collect();
    write_json_file(path, &feature_collection(features, epsg))
}

// ---------------------------------------------------------------------------
// Field trees and plots
// ---------------------------------------------------------------------------

/// Read field trees from CSV (`plot_id, x, y, height, dbh, live_dead,
/// height_allometric`; empty cells are missing values).
pub fn read_field_trees_csv(path: impl AsRef<Path>) -> Result<Vec<FieldTree>, InputError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut out = Vec::new();
    for rec in rdr.deserialize() {
        out.push(rec?);
    }
    Ok(out)
}

pub fn write_field_trees_csv(path: impl AsRef<Path>, trees: &[FieldTree]) -> Result<(), InputError> {
    let mut wtr = Writer::from_path(path)?;
    for t in trees {
        wtr.serialize(t)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Plot boundaries from a GeoJSON polygon collection keyed by the
/// `plot_id` property, plus the EPSG code of its `crs` member if any.
pub fn read_plot_boundaries_geojson(
    path: impl AsRef<Path>,
) -> Result<(Vec<(String, Polygon<f64>)>, Option<u32>), InputError> {
    let path = path.as_ref();
    let invalid = |reason: String| InputError::InvalidVector {
        path: path.display().to_string(),
        reason,
    };
    let file = File::open(path)?;
    let root: Value = serde_json::from_reader(BufReader::new(file))?;

    let epsg = geojson_crs(&root);
    let features = root["features"]
        .as_array()
        .ok_or_else(|| invalid("missing features array".into()))?;
    let mut plots = Vec::with_capacity(features.len());
    for (i, f) in features.iter().enumerate() {
        let id = match &f["properties"]["plot_id"] {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(invalid(format!("feature {i} has no plot_id"))),
        };
        let geometry = &f["geometry"];
        let rings = match geometry["type"].as_str() {
            Some("Polygon") => &geometry["coordinates"],
            // first part of a multipolygon
            Some("MultiPolygon") => &geometry["coordinates"][0],
            other => return Err(invalid(format!("plot {id}: unsupported geometry {other:?}"))),
        };
        let polygon = polygon_from_rings(rings).ok_or_else(|| invalid(format!("plot {id}: bad coordinates")))?;
        plots.push((id, polygon));
    }
    Ok((plots, epsg))
}

/// EPSG code of a GeoJSON `crs` member (`urn:ogc:def:crs:EPSG::<code>`).
fn geojson_crs(root: &Value) -> Option<u32> {
    root["crs"]["properties"]["name"]
        .as_str()
        .and_then(|name| name.rsplit(':').next())
        .and_then(|code| code.parse().ok())
}

/// EPSG code declared by a GeoJSON file, without reading its features.
pub fn read_geojson_crs(path: impl AsRef<Path>) -> Result<Option<u32>, InputError> {
    let file = File::open(path)?;
    let root: Value = serde_json::from_reader(BufReader::new(file))?;
    Ok(geojson_crs(&root))
}

/// Coordinates in two references can only be compared when the codes agree;
/// an unknown code is accepted.
pub fn ensure_same_crs(raster: Option<u32>, vector: Option<u32>) -> Result<(), InputError> {
    match (raster, vector) {
        (Some(raster), Some(vector)) if raster != vector => Err(InputError::CrsMismatch { raster, vector }),
        _ => Ok(()),
    }
}

fn polygon_from_rings(rings: &Value) -> Option<Polygon<f64>> {
    let mut parsed = rings.as_array()?.iter().map(|ring| {
        ring.as_array()?
            .iter()
            .map(|p| Some((p[0].as_f64()?, p[1].as_f64()?)))
            .collect::<Option<Vec<(f64, f64)>>>()
            .map(LineString::from)
    });
    let exterior = parsed.next()??;
    if exterior.0.len() < 4 {
        return None;
    }
    let interiors = parsed.collect::<Option<Vec<_>>>()?;
    Some(Polygon::new(exterior, interiors))
}

// ---------------------------------------------------------------------------
// Registration results
// ---------------------------------------------------------------------------

/// Per-plot registration results as CSV.
pub fn write_shifts_csv(path: impl AsRef<Path>, alignments: &[Alignment]) -> Result<(), InputError> {
    let file = File::create(path)?;
    let mut wtr = Writer::from_writer(BufWriter::new(file));
    wtr.write_record([
        "plot_id",
        "dx",
        "dy",
        "matches",
        "residual",
        "true_detections",
        "omissions",
        "false_detections",
        "height_bias",
        "height_rmse",
    ])?;
    for a in alignments {
        let (bias, rmse) = a
            .regression
            .map(|r| (format!("{:.3}", r.bias), format!("{:.3}", r.rmse)))
            .unwrap_or_default();
        wtr.write_record([
            a.plot_id.clone(),
            format!("{:.3}", a.shift.dx),
            format!("{:.3}", a.shift.dy),
            a.shift.matches.to_string(),
            format!("{:.3}", a.shift.residual),
            a.stats.true_detections.to_string(),
            a.stats.omissions.to_string(),
            a.stats.false_detections.to_string(),
            bias,
            rmse,
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
