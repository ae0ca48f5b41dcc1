//! LiDAR point extraction under plot polygons.
//!
//! Tiles are filtered in two steps. [`tile_may_contain`] looks only at the
//! LAS header and the polygons' representative points, and lets a tile be
//! skipped without reading its points. [`bbox_mask`] then decides, per
//! polygon, which points are kept; only this second test decides whether an
//! output file is written.

use crate::crs::{CoordTransformer, Crs};
use crate::error::{Error, Result};
use crate::raster::Bounds;
use crate::storage::{Location, Store};
use crate::vector::{feature_collection_string, make_feature, parse_feature_collection, point_value};
use crate::vector::{PolygonLayer, PolygonRecord};
use geo::{Intersects, Point};
use geojson::{JsonObject, JsonValue};
use las::{Read, Reader};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;
use tracing::{debug, info};

/// Native CRS of the survey's LiDAR tiles (WGS 84 / UTM zone 30N).
pub const DEFAULT_TILE_EPSG: u32 = 32630;

/// Extraction settings.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionParams {
    /// CRS the tile coordinates are expressed in.
    pub tile_crs: Crs,
    /// CRS of the written point files.
    pub output_crs: Crs,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            tile_crs: Crs::from_epsg(DEFAULT_TILE_EPSG),
            output_crs: Crs::british_national_grid(),
        }
    }
}

/// What the LAS header says about a tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub bounds: Bounds,
    pub point_count: u64,
}

impl TileBounds {
    pub fn from_header(header: &las::Header) -> Self {
        let b = header.bounds();
        Self {
            bounds: Bounds::new(b.min.x, b.min.y, b.max.x, b.max.y),
            point_count: header.number_of_points(),
        }
    }
}

/// Size of a LAS 1.4 public header block, the largest version.
pub const LAS_HEADER_SIZE: u64 = 375;

/// Offset of the `header_size` field in the public header block.
const HEADER_SIZE_OFFSET: usize = 94;

fn header_bounds<R: std::io::Read>(read: R) -> Result<TileBounds> {
    let raw = las::raw::Header::read_from(read)?;
    Ok(TileBounds::from_header(&las::Header::from_raw(raw)?))
}

/// Header of a LAS file on disk. Point records are not read.
pub fn tile_bounds<P: AsRef<Path>>(path: P) -> Result<TileBounds> {
    header_bounds(BufReader::new(File::open(path)?))
}

/// Header of a LAS tile anywhere in storage. Only the public header block
/// is fetched, remote objects through a byte-range request.
pub fn read_tile_bounds(store: &Store, location: &Location) -> Result<TileBounds> {
    let mut bytes = store.read_range(location, 0, LAS_HEADER_SIZE)?;
    let declared = bytes
        .get(HEADER_SIZE_OFFSET..HEADER_SIZE_OFFSET + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as u64);
    if let Some(size) = declared.filter(|&n| n > bytes.len() as u64) {
        // padded header
        bytes = store.read_range(location, 0, size)?;
    }
    header_bounds(Cursor::new(bytes))
}

/// Whole-tile pre-filter: true if any representative point lies within the
/// tile's header bounds (edges included).
pub fn tile_may_contain(tile: &Bounds, points: &[Point<f64>]) -> bool {
    points.iter().any(|p| tile.contains(p.x(), p.y()))
}

/// Per-point inclusive bounding-box filter.
pub fn bbox_mask(xs: &[f64], ys: &[f64], bounds: &Bounds) -> Vec<bool> {
    xs.iter().zip(ys).map(|(&x, &y)| bounds.contains(x, y)).collect()
}

/// Rescale a 16-bit colour channel to 8 bits, truncating.
#[inline]
pub fn rescale_color(v: u16) -> u8 {
    (v as f64 / 65535.0 * 255.0) as u8
}

/// One LiDAR return with 8-bit colour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    pub return_number: u8,
    pub classification: u8,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PointRecord {
    pub fn from_las(p: &las::Point) -> Self {
        let (r, g, b) = p
            .color
            .map(|c| (rescale_color(c.red), rescale_color(c.green), rescale_color(c.blue)))
            .unwrap_or((0, 0, 0));
        Self {
            return_number: p.return_number,
            classification: u8::from(p.classification),
            x: p.x,
            y: p.y,
            z: p.z,
            r,
            g,
            b,
        }
    }
}

/// A tile's points, read in full.
#[derive(Debug, Clone)]
pub struct TileData {
    pub block: String,
    pub bounds: TileBounds,
    pub points: Vec<PointRecord>,
}

/// Tile block identifier: the last `_` token of the file stem.
pub fn block_id(stem: &str) -> &str {
    stem.rsplit('_').next().unwrap_or(stem)
}

/// Output file name for the points of polygon `id` in tile `block`.
pub fn output_name(id: u32, block: &str) -> String {
    format!("{id}_b{block}.geojson")
}

/// Properties carried by each written point feature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PointProperties {
    #[serde(rename = "return")]
    return_number: u8,
    class: u8,
    z: f64,
    #[serde(rename = "R")]
    r: u8,
    #[serde(rename = "G")]
    g: u8,
    #[serde(rename = "B")]
    b: u8,
}

/// The subset of [`PointProperties`] the height stage needs.
#[derive(Debug, Deserialize)]
struct ClassZ {
    class: u8,
    z: f64,
}

/// Points of one tile that fall inside one polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonPoints {
    pub polygon_id: u32,
    pub block: String,
    pub crs: Crs,
    pub points: Vec<PointRecord>,
}

impl PolygonPoints {
    pub fn file_name(&self) -> String {
        output_name(self.polygon_id, &self.block)
    }

    /// Point features with `return`, `class`, `z`, `R`, `G`, `B` properties.
    pub fn to_geojson_string(&self) -> Result<String> {
        let features = self
            .points
            .iter()
            .map(|p| {
                let props = PointProperties {
                    return_number: p.return_number,
                    class: p.classification,
                    z: p.z,
                    r: p.r,
                    g: p.g,
                    b: p.b,
                };
                let props = match serde_json::to_value(props)? {
                    JsonValue::Object(map) => map,
                    _ => JsonObject::new(),
                };
                Ok(make_feature(point_value(&Point::new(p.x, p.y)), props))
            })
            .collect::<Result<Vec<_>>>()?;
        feature_collection_string(self.crs, features)
    }
}

/// Class and elevation of every point in a written point file.
pub fn read_class_z(text: &str) -> Result<Vec<(u8, f64)>> {
    let (_, features) = parse_feature_collection(text)?;
    features
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let props = f.properties.clone().unwrap_or_default();
            let p: ClassZ = serde_json::from_value(JsonValue::Object(props)).map_err(|_| Error::MissingAttribute {
                attribute: "class/z".into(),
                feature: i,
            })?;
            Ok((p.class, p.z))
        })
        .collect()
}

/// Read a LAS tile from disk or object storage.
pub fn read_tile(store: &Store, location: &Location) -> Result<TileData> {
    let mut reader = match location {
        Location::Local(p) => Reader::from_path(p)?,
        Location::Remote { .. } => Reader::new(Cursor::new(store.read_bytes(location)?))?,
    };
    let bounds = TileBounds::from_header(reader.header());
    let points = reader
        .points()
        .map(|p| p.map(|p| PointRecord::from_las(&p)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let stem = location.file_stem().unwrap_or_default();
    Ok(TileData {
        block: block_id(&stem).to_string(),
        bounds,
        points,
    })
}

/// Cut one polygon's points out of a tile.
///
/// `polygon` must be in the tile's CRS. Returns `None` when no point passes
/// the bounding-box filter. Points that pass it are clipped to the exact
/// geometry (boundary included) and reprojected through `to_output`.
pub fn extract_polygon(
    tile: &TileData,
    xs: &[f64],
    ys: &[f64],
    polygon: &PolygonRecord,
    to_output: &CoordTransformer,
) -> Result<Option<PolygonPoints>> {
    let Some(bounds) = polygon.bounds() else {
        return Ok(None);
    };
    let mask = bbox_mask(xs, ys, &bounds);
    if !mask.iter().any(|&m| m) {
        return Ok(None);
    }
    debug!("polygon {} within block {}", polygon.id, tile.block);
    let mut points = Vec::new();
    for (p, _) in tile.points.iter().zip(&mask).filter(|(_, m)| **m) {
        if !polygon.geometry.intersects(&Point::new(p.x, p.y)) {
            continue;
        }
        let (x, y) = to_output.transform(p.x, p.y)?;
        points.push(PointRecord { x, y, ..*p });
    }
    Ok(Some(PolygonPoints {
        polygon_id: polygon.id,
        block: tile.block.clone(),
        crs: to_output.target(),
        points,
    }))
}

/// Every polygon's points within one tile. `layer` must already be in the
/// tile CRS.
pub fn extract_tile(tile: &TileData, layer: &PolygonLayer, params: &ExtractionParams) -> Result<Vec<PolygonPoints>> {
    layer.crs.ensure_same(&params.tile_crs)?;
    let to_output = CoordTransformer::new(params.tile_crs, params.output_crs)?;
    let xs: Vec<f64> = tile.points.iter().map(|p| p.x).collect();
    let ys: Vec<f64> = tile.points.iter().map(|p| p.y).collect();
    let mut out = Vec::new();
    for polygon in layer.sorted_by_id() {
        if let Some(found) = extract_polygon(tile, &xs, &ys, polygon, &to_output)? {
            out.push(found);
        }
    }
    Ok(out)
}

/// Extract every `*.las` tile under `tiles` (sorted) and write one
/// GeoJSON file per (polygon, tile) into `out_dir`. Returns written files.
pub fn extract_all(
    store: &Store,
    tiles: &Location,
    layer: &PolygonLayer,
    params: &ExtractionParams,
    out_dir: &Location,
) -> Result<Vec<Location>> {
    let layer = layer.to_crs(params.tile_crs)?;
    let representative: Vec<Point<f64>> = layer
        .records()
        .iter()
        .filter_map(PolygonRecord::representative_point)
        .collect();

    let files = store.list(tiles, "las")?;
    info!("{} LAS tiles under {}", files.len(), tiles);
    let mut written = Vec::new();
    for file in &files {
        let stem = file.file_stem().unwrap_or_default();
        let block = block_id(&stem).to_string();
        let header = read_tile_bounds(store, file)?;
        if !tile_may_contain(&header.bounds, &representative) {
            info!("block {} not within plot bounds", block);
            continue;
        }
        info!("opening block {} ({} points)", block, header.point_count);
        let tile = read_tile(store, file)?;
        debug!("block {}: {} points read", block, tile.points.len());
        for found in extract_tile(&tile, &layer, params)? {
            let target = out_dir.join(&found.file_name());
            store.write_bytes(&target, found.to_geojson_string()?.as_bytes())?;
            debug!("wrote {} points to {}", found.points.len(), target);
            written.push(target);
        }
    }
    info!("{} point files written", written.len());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area};
    use las::point::{Classification, Format};
    use las::{Builder, Color, Write, Writer};

    fn square(id: u32, x0: f64, y0: f64, size: f64) -> PolygonRecord {
        let geometry = polygon![
            (x: x0, y: y0), (x: x0 + size, y: y0), (x: x0 + size, y: y0 + size), (x: x0, y: y0 + size), (x: x0, y: y0)
        ];
        PolygonRecord {
            id,
            species: None,
            area: geometry.unsigned_area(),
            h_mean: None,
            geometry,
        }
    }

    fn bng() -> Crs {
        Crs::british_national_grid()
    }

    fn write_las(path: &Path, pts: &[(f64, f64, f64, u8)]) {
        let mut builder = Builder::from((1, 2));
        builder.point_format = Format::new(2).unwrap();
        let header = builder.into_header().unwrap();
        let mut writer = Writer::from_path(path, header).unwrap();
        for &(x, y, z, class) in pts {
            writer
                .write(las::Point {
                    x,
                    y,
                    z,
                    return_number: 1,
                    classification: Classification::new(class).unwrap(),
                    color: Some(Color::new(65535, 32768, 0)),
                    ..Default::default()
                })
                .unwrap();
        }
        drop(writer);
    }

    #[test]
    fn test_rescale_color() {
        assert_eq!(rescale_color(65535), 255);
        assert_eq!(rescale_color(0), 0);
        assert_eq!(rescale_color(32768), 127);
    }

    #[test]
    fn test_block_id() {
        assert_eq!(block_id("LIDAR_SU1234_07"), "07");
        assert_eq!(block_id("tile"), "tile");
        assert_eq!(output_name(12, "07"), "12_b07.geojson");
    }

    #[test]
    fn test_predicates() {
        let tile = Bounds::new(0.0, 0.0, 10.0, 10.0);
        assert!(tile_may_contain(&tile, &[Point::new(50.0, 50.0), Point::new(10.0, 5.0)]));
        assert!(!tile_may_contain(&tile, &[Point::new(10.5, 5.0)]));
        let mask = bbox_mask(&[0.0, 1.0, 2.0, 3.0], &[1.0, 1.0, 1.0, 1.0], &Bounds::new(1.0, 0.0, 2.0, 1.0));
        assert_eq!(mask, vec![false, true, true, false]);
    }

    #[test]
    fn test_bbox_filter_is_authoritative() {
        // Polygon 5 has a point in its bounding box but none inside its
        // geometry: a file is still emitted, with no points. Polygon 7's
        // bbox holds no point at all.
        let tile = TileData {
            block: "3".into(),
            bounds: TileBounds { bounds: Bounds::new(0.0, 0.0, 10.0, 10.0), point_count: 3 },
            points: vec![
                PointRecord { return_number: 1, classification: 2, x: 1.0, y: 1.0, z: 5.0, r: 0, g: 0, b: 0 },
                PointRecord { return_number: 1, classification: 1, x: 9.0, y: 9.0, z: 6.0, r: 0, g: 0, b: 0 },
                PointRecord { return_number: 1, classification: 1, x: 50.0, y: 50.0, z: 6.0, r: 0, g: 0, b: 0 },
            ],
        };
        let outside = PolygonRecord {
            geometry: polygon![(x: 1.0, y: 2.0), (x: 2.0, y: 2.0), (x: 2.0, y: 1.0), (x: 1.0, y: 2.0)],
            ..square(5, 0.0, 0.0, 1.0)
        };
        let empty_bbox = PolygonRecord {
            geometry: polygon![(x: 3.0, y: 3.0), (x: 4.0, y: 3.0), (x: 4.0, y: 4.0), (x: 3.0, y: 3.0)],
            ..square(7, 0.0, 0.0, 1.0)
        };
        let layer = PolygonLayer::new(
            bng(),
            vec![square(1, 0.0, 0.0, 2.0), square(2, 8.0, 8.0, 2.0), outside, empty_bbox],
        )
        .unwrap();
        let params = ExtractionParams { tile_crs: bng(), output_crs: bng() };
        let out = extract_tile(&tile, &layer, &params).unwrap();
        let ids: Vec<u32> = out.iter().map(|p| p.polygon_id).collect();
        assert_eq!(ids, vec![1, 2, 5]);
        assert_eq!(out[0].points.len(), 1);
        assert_eq!(out[1].points[0].z, 6.0);
        assert_eq!(out[1].file_name(), "2_b3.geojson");
        assert!(out[2].points.is_empty());
    }

    #[test]
    fn test_extract_all_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = dir.path().join("tiles");
        std::fs::create_dir(&tiles).unwrap();
        write_las(
            &tiles.join("survey_01.las"),
            &[(1.5, 1.5, 10.0, 2), (1.6, 1.6, 11.5, 1), (30.0, 30.0, 9.0, 2)],
        );
        write_las(&tiles.join("survey_02.las"), &[(500.0, 500.0, 1.0, 2), (501.0, 501.0, 1.0, 2)]);

        let layer = PolygonLayer::new(bng(), vec![square(4, 1.0, 1.0, 1.0)]).unwrap();
        let params = ExtractionParams { tile_crs: bng(), output_crs: bng() };
        let out = Location::from(dir.path().join("points"));
        let written = extract_all(&Store::local(), &Location::from(tiles.as_path()), &layer, &params, &out).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].file_name().as_deref(), Some("4_b01.geojson"));

        let text = std::fs::read_to_string(dir.path().join("points/4_b01.geojson")).unwrap();
        let mut class_z = read_class_z(&text).unwrap();
        class_z.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(class_z, vec![(1, 11.5), (2, 10.0)]);
    }

    #[test]
    fn test_read_class_z_requires_properties() {
        let text = r#"{"type":"FeatureCollection","crs":{"type":"name","properties":{"name":"EPSG:27700"}},
            "features":[{"type":"Feature","geometry":{"type":"Point","coordinates":[1.0,2.0]},"properties":{"class":2}}]}"#;
        assert!(matches!(read_class_z(text), Err(Error::MissingAttribute { feature: 0, .. })));
    }

    #[test]
    fn test_read_tile_colour_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_9.las");
        write_las(&path, &[(2.0, 3.0, 4.0, 2), (6.0, 7.0, 8.0, 1)]);
        let header = tile_bounds(&path).unwrap();
        assert_eq!(header.point_count, 2);
        assert_eq!(header.bounds, Bounds::new(2.0, 3.0, 6.0, 7.0));
        let tile = read_tile(&Store::local(), &Location::from(path)).unwrap();
        assert_eq!(tile.block, "9");
        assert_eq!((tile.points[0].r, tile.points[0].g, tile.points[0].b), (255, 127, 0));
        assert_eq!(tile.points[1].classification, 1);
    }

    #[test]
    fn test_tile_bounds_from_header_bytes_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b_2.las");
        write_las(&path, &[(10.0, 20.0, 1.0, 2), (14.0, 25.0, 2.0, 1), (12.0, 21.0, 3.0, 1)]);
        let full = tile_bounds(&path).unwrap();

        // a file cut right after the header still yields the same bounds
        let store = Store::local();
        let prefix = store.read_range(&Location::from(path.as_path()), 0, LAS_HEADER_SIZE).unwrap();
        let cut = Location::from(dir.path().join("header_only.las"));
        store.write_bytes(&cut, &prefix).unwrap();
        let from_prefix = read_tile_bounds(&store, &cut).unwrap();

        assert_eq!(from_prefix, full);
        assert_eq!(full.point_count, 3);
        assert_eq!(full.bounds, Bounds::new(10.0, 20.0, 14.0, 25.0));
    }
}
