//! Ground truth canopy height from the extracted LiDAR point files.
//!
//! Points of class 2 are ground and class 1 canopy. The plot height is
//! `(canopy_max − ground_max) × 100`, i.e. centimetres.

use crate::error::Result;
use crate::stats::{point_stats, PointStats};
use crate::storage::{Location, Store};
use crate::vector::PolygonLayer;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const GROUND_CLASS: u8 = 2;
pub const CANOPY_CLASS: u8 = 1;
/// Metres to centimetres.
pub const HEIGHT_SCALE: f64 = 100.0;

/// One row of the LiDAR statistics table.
#[derive(Debug, Clone, PartialEq)]
pub struct LidarStatsRow {
    pub id: u32,
    pub species: Option<String>,
    pub area: f64,
    pub h_mean: Option<f64>,
    pub ground: Option<PointStats>,
    pub canopy: Option<PointStats>,
}

impl LidarStatsRow {
    pub fn h_lidar(&self) -> Option<f64> {
        canopy_height(self.ground.as_ref(), self.canopy.as_ref())
    }
}

pub fn canopy_height(ground: Option<&PointStats>, canopy: Option<&PointStats>) -> Option<f64> {
    Some((canopy?.max - ground?.max) * HEIGHT_SCALE)
}

/// Ground and canopy summaries of a set of `(class, z)` points.
pub fn summarise(points: &[(u8, f64)]) -> (Option<PointStats>, Option<PointStats>) {
    let z_of = |class: u8| -> Vec<f64> {
        points.iter().filter(|(c, _)| *c == class).map(|&(_, z)| z).collect()
    };
    (point_stats(&z_of(GROUND_CLASS)), point_stats(&z_of(CANOPY_CLASS)))
}

/// Polygon id a point file belongs to: the leading `_` token of its name
/// (`12_b07.geojson` → 12).
pub fn polygon_id_from_file(name: &str) -> Option<u32> {
    let stem = name.split('.').next()?;
    stem.split('_').next()?.parse().ok()
}

/// Summarise every point file under `point_dir` per polygon.
///
/// Points of one polygon found in several tiles are pooled. Polygons with
/// no file keep empty statistics; files naming an unknown id are skipped.
pub fn process_lidar_data(store: &Store, point_dir: &Location, layer: &PolygonLayer) -> Result<Vec<LidarStatsRow>> {
    let mut points: BTreeMap<u32, Vec<(u8, f64)>> = BTreeMap::new();
    let files = store.list(point_dir, "geojson")?;
    for file in &files {
        let Some(id) = file.file_name().as_deref().and_then(polygon_id_from_file) else {
            warn!("skipping {}: no polygon id in file name", file);
            continue;
        };
        if layer.get(id).is_none() {
            warn!("skipping {}: polygon {} not in layer", file, id);
            continue;
        }
        let class_z = crate::point_cloud::read_class_z(&store.read_to_string(file)?)?;
        debug!("polygon {}: {} points from {}", id, class_z.len(), file);
        points.entry(id).or_default().extend(class_z);
    }

    let rows: Vec<LidarStatsRow> = layer
        .sorted_by_id()
        .into_iter()
        .map(|r| {
            let (ground, canopy) = points.get(&r.id).map(|p| summarise(p)).unwrap_or((None, None));
            LidarStatsRow {
                id: r.id,
                species: r.species.clone(),
                area: r.area,
                h_mean: r.h_mean,
                ground,
                canopy,
            }
        })
        .collect();
    let with_height = rows.iter().filter(|r| r.h_lidar().is_some()).count();
    info!("{} of {} polygons with LiDAR height", with_height, rows.len());
    Ok(rows)
}

pub fn header() -> Vec<String> {
    let mut header: Vec<String> = ["id", "species", "area", "h_mean"].iter().map(|s| s.to_string()).collect();
    for prefix in ["ground", "canopy"] {
        header.extend(PointStats::SUFFIXES.iter().map(|s| format!("{prefix}_{s}")));
    }
    header.push("h_lidar".into());
    header
}

pub fn write_csv<W: std::io::Write>(rows: &[LidarStatsRow], writer: W) -> Result<()> {
    let cell = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
    let mut w = csv::Writer::from_writer(writer);
    w.write_record(header())?;
    for r in rows {
        let mut record = vec![
            r.id.to_string(),
            r.species.clone().unwrap_or_default(),
            r.area.to_string(),
            cell(r.h_mean),
        ];
        for stats in [r.ground, r.canopy] {
            match stats {
                Some(s) => record.extend(s.values().iter().map(|v| cell(Some(*v).filter(|v| v.is_finite())))),
                None => record.extend(std::iter::repeat(String::new()).take(PointStats::SUFFIXES.len())),
            }
        }
        record.push(cell(r.h_lidar()));
        w.write_record(&record)?;
    }
    w.flush()?;
    Ok(())
}
