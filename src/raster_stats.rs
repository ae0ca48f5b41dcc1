//! Per-polygon raster statistics.
//!
//! For every (polygon, raster) pair whose bounding boxes overlap, the pixels
//! whose centres fall inside the polygon are extracted and summarised.
//! Rasters with three or more bands are read as RGB and reduced to a
//! vegetation index; single-band rasters are used as-is minus no-data.
//!
//! # Source conflicts
//!
//! Several rasters may share one logical name (tiles of one orthomosaic).
//! When more than one of them overlaps a polygon, [`SourceConflict`] decides
//! what happens. Rasters with distinct names never interact.

use crate::crs::Crs;
use crate::error::{Error, Result};
use crate::geotiff::WindowedGeoTiff;
use crate::raster::{Bounds, Raster, Window};
use crate::stats::{compute_stats, StatsSummary};
use crate::storage::{Location, Store};
use crate::vector::{polygon_bounds, PolygonLayer, PolygonRecord};
use geo::{Contains, Point, Polygon};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// Guards the vegetation index against a zero denominator.
pub const INDEX_EPSILON: f64 = 1e-6;

/// Pixels behind a source.
#[derive(Debug, Clone)]
pub enum RasterData {
    /// Already decoded.
    Memory(Raster),
    /// Decoded one polygon window at a time.
    GeoTiff(WindowedGeoTiff),
}

/// A raster with the short name its statistics columns are keyed by.
#[derive(Debug, Clone)]
pub struct RasterSource {
    pub name: String,
    pub data: RasterData,
}

impl RasterSource {
    pub fn new(name: impl Into<String>, raster: Raster) -> Self {
        Self {
            name: name.into(),
            data: RasterData::Memory(raster),
        }
    }

    pub fn from_geotiff(name: impl Into<String>, tif: WindowedGeoTiff) -> Self {
        Self {
            name: name.into(),
            data: RasterData::GeoTiff(tif),
        }
    }

    /// Open a GeoTIFF for windowed reads.
    pub fn from_path<P: AsRef<Path>>(name: impl Into<String>, path: P) -> Result<Self> {
        Ok(Self::from_geotiff(name, WindowedGeoTiff::open(path)?))
    }

    /// Same as [`RasterSource::from_path`] for any storage location.
    pub fn load(name: impl Into<String>, store: &Store, location: &Location) -> Result<Self> {
        Ok(Self::from_geotiff(name, WindowedGeoTiff::load(store, location)?))
    }

    pub fn crs(&self) -> Option<Crs> {
        match &self.data {
            RasterData::Memory(r) => r.crs,
            RasterData::GeoTiff(t) => t.info().crs,
        }
    }

    pub fn bounds(&self) -> Bounds {
        match &self.data {
            RasterData::Memory(r) => r.bounds(),
            RasterData::GeoTiff(t) => t.info().bounds(),
        }
    }

    pub fn window(&self, bounds: &Bounds) -> Window {
        match &self.data {
            RasterData::Memory(r) => r.window(bounds),
            RasterData::GeoTiff(t) => t.info().window(bounds),
        }
    }

    /// The cells of `window` as a georeferenced raster.
    pub fn read_window(&self, window: Window) -> Result<Raster> {
        match &self.data {
            RasterData::Memory(r) => Ok(r.crop(window)),
            RasterData::GeoTiff(t) => t.read_window(window),
        }
    }
}

/// A `--raster` argument: `name=path`, or a bare path named by
/// [`name_from_path`].
pub fn parse_source_arg(arg: &str) -> Result<(String, Location)> {
    if let Some((name, path)) = arg.split_once('=') {
        let name = name.trim();
        if !name.is_empty() && !name.contains(['/', '\\', ':']) {
            return Ok((name.to_string(), path.trim().parse()?));
        }
    }
    let location: Location = arg.trim().parse()?;
    let name = name_from_path(Path::new(&location.file_name().unwrap_or_default()));
    debug!("raster {} named '{}' from its file name", location, name);
    Ok((name, location))
}

/// Short source name from a file name: the second-to-last `_` token of the
/// stem (`sfm_normalized.tif` → `sfm`), or the whole stem when it has no `_`.
pub fn name_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() >= 2 {
        tokens[tokens.len() - 2].to_string()
    } else {
        stem
    }
}

/// What to do when several same-named rasters overlap one polygon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceConflict {
    /// The last overlapping raster in input order supersedes the others.
    LastWins,
    /// Valid values of every overlapping raster are summarised together.
    #[default]
    Pool,
    /// Fail with [`Error::ConflictingSources`].
    Reject,
}

impl std::str::FromStr for SourceConflict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "last-wins" | "last_wins" | "last" => Ok(Self::LastWins),
            "pool" => Ok(Self::Pool),
            "reject" => Ok(Self::Reject),
            _ => Err(Error::InvalidParameter {
                name: "conflict policy",
                value: s.to_string(),
                reason: "expected last-wins, pool or reject".into(),
            }),
        }
    }
}

/// One summary per (polygon, source name).
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRecord {
    pub polygon_id: u32,
    pub source: String,
    pub summary: StatsSummary,
}

/// Pixels of a raster window, with a mask of cells whose centre lies inside
/// the polygon.
#[derive(Debug, Clone)]
pub struct MaskedWindow {
    pub window: Window,
    /// Per band, row-major over the window.
    pub bands: Vec<Vec<f64>>,
    pub inside: Vec<bool>,
}

impl MaskedWindow {
    /// Values of `band` at the cells inside the polygon.
    pub fn inside_values(&self, band: usize) -> Vec<f64> {
        self.bands[band]
            .iter()
            .zip(&self.inside)
            .filter_map(|(&v, &inside)| inside.then_some(v))
            .collect()
    }

    pub fn inside_count(&self) -> usize {
        self.inside.iter().filter(|&&m| m).count()
    }
}

/// Overlap test on bounding boxes. Edges that only touch still overlap.
pub fn bounds_disjoint(a: &Bounds, b: &Bounds) -> bool {
    a.disjoint(b)
}

/// Read the window covering the polygon's bounding box and mark the cells
/// whose centres fall inside it.
pub fn masked_read(raster: &Raster, polygon: &Polygon<f64>) -> Option<MaskedWindow> {
    let bounds = polygon_bounds(polygon)?;
    let window = raster.window(&bounds);
    if window.is_empty() {
        return None;
    }
    let mut bands = vec![Vec::new(); raster.band_count()];
    let mut inside = Vec::new();
    for row in window.row0..window.row1 {
        for col in window.col0..window.col1 {
            let (x, y) = raster.rc_to_xy(row, col);
            inside.push(polygon.contains(&Point::new(x, y)));
            for (b, out) in bands.iter_mut().enumerate() {
                out.push(raster.get_band(b, row, col));
            }
        }
    }
    Some(MaskedWindow {
        window,
        bands,
        inside,
    })
}

/// `(g − r) / (g + r − b + ε)`.
#[inline]
pub fn vegetation_index(r: f64, g: f64, b: f64) -> f64 {
    (g - r) / (g + r - b + INDEX_EPSILON)
}

/// Values fed to the statistics: the index (values above 1 dropped) for
/// RGB rasters, the raw band minus no-data otherwise.
pub fn extract_values(raster: &Raster, masked: &MaskedWindow) -> Vec<f64> {
    if raster.band_count() >= 3 {
        let (r, g, b) = (
            masked.inside_values(0),
            masked.inside_values(1),
            masked.inside_values(2),
        );
        r.iter()
            .zip(&g)
            .zip(&b)
            .map(|((&r, &g), &b)| vegetation_index(r, g, b))
            .filter(|&v| v <= 1.0)
            .collect()
    } else {
        masked
            .inside_values(0)
            .into_iter()
            .filter(|&v| !raster.is_nodata(v))
            .collect()
    }
}

/// Non-empty with a non-zero mean.
pub fn is_meaningful(values: &[f64]) -> bool {
    !values.is_empty() && crate::stats::mean(values) != 0.0
}

/// Valid values of one source under one polygon, `None` when the pair is
/// skipped (disjoint bounds, empty window, failed validity gate). Only the
/// polygon's window is read.
fn polygon_values(polygon: &PolygonRecord, source: &RasterSource) -> Result<Option<Vec<f64>>> {
    let Some(pb) = polygon.bounds() else {
        return Ok(None);
    };
    if bounds_disjoint(&source.bounds(), &pb) {
        return Ok(None);
    }
    let window = source.window(&pb);
    if window.is_empty() {
        return Ok(None);
    }
    let raster = source.read_window(window)?;
    let Some(masked) = masked_read(&raster, &polygon.geometry) else {
        return Ok(None);
    };
    let values = extract_values(&raster, &masked);
    Ok(is_meaningful(&values).then_some(values))
}

/// Statistics of one polygon against every source, one record per name.
pub fn get_raster_stats(
    polygon: &PolygonRecord,
    sources: &[RasterSource],
    policy: SourceConflict,
) -> Result<Vec<StatsRecord>> {
    // name -> valid value sets, in source order
    let mut by_name: Vec<(String, Vec<Vec<f64>>)> = Vec::new();
    for source in sources {
        let Some(values) = polygon_values(polygon, source)? else {
            continue;
        };
        match by_name.iter_mut().find(|(n, _)| *n == source.name) {
            Some((_, sets)) => sets.push(values),
            None => by_name.push((source.name.clone(), vec![values])),
        }
    }

    let mut records = Vec::with_capacity(by_name.len());
    for (name, mut sets) in by_name {
        let values = if sets.len() == 1 {
            sets.remove(0)
        } else {
            debug!("polygon {}: {} '{}' rasters overlap", polygon.id, sets.len(), name);
            match policy {
                SourceConflict::LastWins => sets.pop().unwrap_or_default(),
                SourceConflict::Pool => sets.concat(),
                SourceConflict::Reject => {
                    return Err(Error::ConflictingSources {
                        polygon_id: polygon.id,
                        source_name: name,
                        count: sets.len(),
                    })
                }
            }
        };
        if let Some(summary) = compute_stats(&values) {
            records.push(StatsRecord {
                polygon_id: polygon.id,
                source: name,
                summary,
            });
        }
    }
    Ok(records)
}

/// Statistics for every polygon of the layer, in identifier order.
///
/// Sources carrying a CRS must share the layer's.
pub fn process_polygons(
    layer: &PolygonLayer,
    sources: &[RasterSource],
    policy: SourceConflict,
) -> Result<Vec<StatsRecord>> {
    check_crs(sources, layer.crs)?;
    for s in sources.iter().filter(|s| s.crs().is_none()) {
        warn!("raster '{}' has no CRS, assuming {}", s.name, layer.crs);
    }
    let mut records = Vec::new();
    for polygon in layer.sorted_by_id() {
        let found = get_raster_stats(polygon, sources, policy)?;
        if found.is_empty() {
            debug!("polygon {}: no raster data", polygon.id);
        }
        records.extend(found);
    }
    info!(
        "{} statistics records for {} polygons",
        records.len(),
        layer.len()
    );
    Ok(records)
}

// ---------------------------------------------------------------------------
// Table assembly
// ---------------------------------------------------------------------------

/// Area and LiDAR canopy height per polygon, from the point-cloud stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruth {
    pub area: Option<f64>,
    pub h_lidar: Option<f64>,
}

/// Read `id`, `area` and `h_lidar` columns of a LiDAR statistics CSV.
pub fn read_ground_truth<R: std::io::Read>(reader: R) -> Result<HashMap<u32, GroundTruth>> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers()?.clone();
    let column = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::MissingAttribute {
                attribute: name.to_string(),
                feature: 0,
            })
    };
    let (id_col, area_col, h_col) = (column("id")?, column("area")?, column("h_lidar")?);
    let parse = |s: Option<&str>| s.and_then(|s| s.trim().parse::<f64>().ok()).filter(|v| v.is_finite());

    let mut out = HashMap::new();
    for (i, row) in reader.records().enumerate() {
        let row = row?;
        let id = parse(row.get(id_col))
            .filter(|v| *v >= 0.0 && v.fract() == 0.0)
            .ok_or_else(|| Error::MissingAttribute {
                attribute: "id".into(),
                feature: i,
            })? as u32;
        out.insert(
            id,
            GroundTruth {
                area: parse(row.get(area_col)),
                h_lidar: parse(row.get(h_col)),
            },
        );
    }
    Ok(out)
}

/// Wide table: one row per polygon id, seven columns per source name.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsTable {
    pub ids: Vec<u32>,
    pub sources: Vec<String>,
    /// Per row, `sources.len() * 7` cells in source-major order.
    pub cells: Vec<Vec<Option<f64>>>,
    pub ground_truth: Vec<Option<GroundTruth>>,
}

impl StatsTable {
    /// Rows for every id of the layer, sorted; polygons without records get
    /// empty cells.
    pub fn assemble(layer: &PolygonLayer, records: &[StatsRecord]) -> Self {
        let ids: Vec<u32> = layer.sorted_by_id().iter().map(|r| r.id).collect();
        let mut sources: Vec<String> = Vec::new();
        for r in records {
            if !sources.contains(&r.source) {
                sources.push(r.source.clone());
            }
        }
        let width = sources.len() * StatsSummary::SUFFIXES.len();
        let row_of: BTreeMap<u32, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let mut cells = vec![vec![None; width]; ids.len()];
        for r in records {
            let (Some(&row), Some(s)) = (row_of.get(&r.polygon_id), sources.iter().position(|s| *s == r.source))
            else {
                continue;
            };
            let start = s * StatsSummary::SUFFIXES.len();
            for (k, v) in r.summary.values().into_iter().enumerate() {
                cells[row][start + k] = Some(v);
            }
        }
        let ground_truth = vec![None; ids.len()];
        Self {
            ids,
            sources,
            cells,
            ground_truth,
        }
    }

    /// Attach LiDAR area and height by polygon id.
    pub fn join_ground_truth(&mut self, truth: &HashMap<u32, GroundTruth>) {
        let mut missing = 0;
        for (id, slot) in self.ids.iter().zip(self.ground_truth.iter_mut()) {
            *slot = truth.get(id).copied();
            if slot.is_none() {
                missing += 1;
            }
        }
        if missing > 0 {
            warn!("{} polygons without LiDAR ground truth", missing);
        }
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["id".to_string()];
        for s in &self.sources {
            header.extend(StatsSummary::SUFFIXES.iter().map(|suffix| format!("{s}_{suffix}")));
        }
        header.push("area".into());
        header.push("h_lidar".into());
        header
    }

    pub fn write<W: std::io::Write>(&self, writer: W) -> Result<()> {
        let cell = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        let mut w = csv::Writer::from_writer(writer);
        w.write_record(self.header())?;
        for (i, id) in self.ids.iter().enumerate() {
            let mut row = vec![id.to_string()];
            row.extend(self.cells[i].iter().map(|&v| cell(v)));
            let gt = self.ground_truth[i];
            row.push(cell(gt.and_then(|g| g.area)));
            row.push(cell(gt.and_then(|g| g.h_lidar)));
            w.write_record(&row)?;
        }
        w.flush()?;
        Ok(())
    }
}

/// File name of the merged training table for a labelling method.
pub fn table_file_name(method: &str) -> String {
    format!("shrubs2ml_{method}.csv")
}

/// File name of the LiDAR statistics a labelling method is joined against.
pub fn ground_truth_file_name(method: &str) -> String {
    format!("stats_{method}_lidar_leafon.csv")
}

/// Full SfM statistics stage: per-polygon stats over every source, joined
/// with LiDAR ground truth and written as `shrubs2ml_{method}.csv` into
/// `output_dir`. A missing ground-truth file is an error.
pub fn process_data(
    store: &Store,
    layer: &PolygonLayer,
    sources: &[RasterSource],
    policy: SourceConflict,
    output_dir: &Location,
    method: &str,
) -> Result<Location> {
    let records = process_polygons(layer, sources, policy)?;
    let mut table = StatsTable::assemble(layer, &records);
    let truth_file = output_dir.join(&ground_truth_file_name(method));
    let truth = read_ground_truth(store.read_bytes(&truth_file)?.as_slice())?;
    table.join_ground_truth(&truth);

    let mut buf = Vec::new();
    table.write(&mut buf)?;
    let target = output_dir.join(&table_file_name(method));
    store.write_bytes(&target, &buf)?;
    info!("wrote {}", target);
    Ok(target)
}

/// Sources must agree with the polygons on CRS before any pixel is read.
pub fn check_crs(sources: &[RasterSource], crs: Crs) -> Result<()> {
    sources
        .iter()
        .filter_map(RasterSource::crs)
        .try_for_each(|c| c.ensure_same(&crs))
}
