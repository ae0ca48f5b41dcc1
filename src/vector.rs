//! Vector layers: survey points, plot polygons and their GeoJSON encoding.
//!
//! Layers are written as GeoJSON FeatureCollections carrying a named CRS
//! member, so identifier set, geometry count and CRS survive a round-trip.

use crate::crs::{CoordTransformer, Crs};
use crate::error::{Error, Result};
use crate::raster::Bounds;
use crate::storage::{Location, Store};
use geo::{Area, BoundingRect, Coord, InteriorPoint, LineString, MapCoords, Point, Polygon};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, JsonValue};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// A field survey observation: a plot centre with its mean crown diameter.
#[derive(Debug, Clone, PartialEq)]
pub struct PointObservation {
    pub id: u32,
    pub species: Option<String>,
    /// Mean crown diameter.
    pub d_mean: f64,
    /// Mean measured height.
    pub h_mean: Option<f64>,
    pub location: Point<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointLayer {
    pub crs: Crs,
    pub records: Vec<PointObservation>,
}

/// A shrub plot polygon, the unit every downstream stage joins on.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonRecord {
    pub id: u32,
    pub species: Option<String>,
    pub area: f64,
    pub h_mean: Option<f64>,
    pub geometry: Polygon<f64>,
}

impl PolygonRecord {
    pub fn bounds(&self) -> Option<Bounds> {
        polygon_bounds(&self.geometry)
    }

    /// A point guaranteed to lie inside the polygon.
    pub fn representative_point(&self) -> Option<Point<f64>> {
        self.geometry.interior_point()
    }
}

/// Plot polygons sharing one CRS, with unique identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonLayer {
    pub crs: Crs,
    records: Vec<PolygonRecord>,
}

impl PolygonLayer {
    pub fn new(crs: Crs, records: Vec<PolygonRecord>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(records.len());
        for r in &records {
            if !seen.insert(r.id) {
                return Err(Error::DuplicateId(r.id));
            }
        }
        Ok(Self { crs, records })
    }

    pub fn records(&self) -> &[PolygonRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&PolygonRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.id).collect()
    }

    /// Records ordered by identifier.
    pub fn sorted_by_id(&self) -> Vec<&PolygonRecord> {
        let mut sorted: Vec<&PolygonRecord> = self.records.iter().collect();
        sorted.sort_by_key(|r| r.id);
        sorted
    }

    /// Reproject every geometry. Areas are left as stored.
    pub fn to_crs(&self, target: Crs) -> Result<PolygonLayer> {
        let t = CoordTransformer::new(self.crs, target)?;
        if t.is_identity() {
            return Ok(self.clone());
        }
        let records = self
            .records
            .iter()
            .map(|r| {
                Ok(PolygonRecord {
                    geometry: reproject_polygon(&r.geometry, &t)?,
                    ..r.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PolygonLayer { crs: target, records })
    }

    pub fn from_geojson_str(text: &str) -> Result<Self> {
        let (crs, features) = parse_feature_collection(text)?;
        let mut records = Vec::with_capacity(features.len());
        for (i, f) in features.iter().enumerate() {
            let geometry = feature_polygon(f, i)?;
            let area = property_f64(f, "area").unwrap_or_else(|| geometry.unsigned_area());
            records.push(PolygonRecord {
                id: property_id(f, i)?,
                species: property_string(f, "species"),
                area,
                h_mean: property_f64(f, "h_mean"),
                geometry,
            });
        }
        Self::new(crs, records)
    }

    /// Manually digitised polygons: identifiers may be absent or stale.
    /// Ids are taken from the feature position (1..N) and not validated.
    pub fn from_geojson_str_unlabelled(text: &str) -> Result<Self> {
        let (crs, features) = parse_feature_collection(text)?;
        let records = features
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let geometry = feature_polygon(f, i)?;
                Ok(PolygonRecord {
                    id: i as u32 + 1,
                    species: property_string(f, "species"),
                    area: property_f64(f, "area").unwrap_or(0.0),
                    h_mean: property_f64(f, "h_mean"),
                    geometry,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(crs, records)
    }

    pub fn to_geojson_string(&self) -> Result<String> {
        let features = self
            .records
            .iter()
            .map(|r| {
                let mut props = JsonObject::new();
                props.insert("id".into(), JsonValue::from(r.id));
                props.insert(
                    "species".into(),
                    r.species.clone().map(JsonValue::from).unwrap_or(JsonValue::Null),
                );
                props.insert("area".into(), JsonValue::from(r.area));
                props.insert(
                    "h_mean".into(),
                    r.h_mean.map(JsonValue::from).unwrap_or(JsonValue::Null),
                );
                make_feature(polygon_value(&r.geometry), props)
            })
            .collect();
        feature_collection_string(self.crs, features)
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_geojson_str(&fs::read_to_string(path)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_geojson_string()?)?;
        Ok(())
    }

    pub fn load(store: &Store, location: &Location) -> Result<Self> {
        Self::from_geojson_str(&store.read_to_string(location)?)
    }

    pub fn save(&self, store: &Store, location: &Location) -> Result<()> {
        store.write_bytes(location, self.to_geojson_string()?.as_bytes())
    }
}

impl PointLayer {
    pub fn from_geojson_str(text: &str) -> Result<Self> {
        let (crs, features) = parse_feature_collection(text)?;
        let records = features
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let location = match f.geometry.as_ref().map(|g| &g.value) {
                    Some(geojson::Value::Point(p)) if p.len() >= 2 => Point::new(p[0], p[1]),
                    _ => {
                        return Err(Error::UnexpectedGeometry {
                            feature: i,
                            expected: "Point",
                        })
                    }
                };
                let d_mean = property_f64(f, "d_mean").ok_or_else(|| Error::MissingAttribute {
                    attribute: "d_mean".into(),
                    feature: i,
                })?;
                Ok(PointObservation {
                    id: property_id(f, i)?,
                    species: property_string(f, "species"),
                    d_mean,
                    h_mean: property_f64(f, "h_mean"),
                    location,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { crs, records })
    }

    pub fn to_geojson_string(&self) -> Result<String> {
        let features = self
            .records
            .iter()
            .map(|r| {
                let mut props = JsonObject::new();
                props.insert("id".into(), JsonValue::from(r.id));
                props.insert(
                    "species".into(),
                    r.species.clone().map(JsonValue::from).unwrap_or(JsonValue::Null),
                );
                props.insert("d_mean".into(), JsonValue::from(r.d_mean));
                props.insert(
                    "h_mean".into(),
                    r.h_mean.map(JsonValue::from).unwrap_or(JsonValue::Null),
                );
                make_feature(point_value(&r.location), props)
            })
            .collect();
        feature_collection_string(self.crs, features)
    }

    pub fn to_crs(&self, target: Crs) -> Result<PointLayer> {
        let t = CoordTransformer::new(self.crs, target)?;
        let records = self
            .records
            .iter()
            .map(|r| {
                let (x, y) = t.transform(r.location.x(), r.location.y())?;
                Ok(PointObservation {
                    location: Point::new(x, y),
                    ..r.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PointLayer { crs: target, records })
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_geojson_str(&fs::read_to_string(path)?)
    }

    pub fn load(store: &Store, location: &Location) -> Result<Self> {
        Self::from_geojson_str(&store.read_to_string(location)?)
    }
}

pub fn polygon_bounds(polygon: &Polygon<f64>) -> Option<Bounds> {
    polygon
        .bounding_rect()
        .map(|r| Bounds::new(r.min().x, r.min().y, r.max().x, r.max().y))
}

pub fn reproject_polygon(polygon: &Polygon<f64>, t: &CoordTransformer) -> Result<Polygon<f64>> {
    polygon.try_map_coords(|c| {
        let (x, y) = t.transform(c.x, c.y)?;
        Ok::<_, Error>(Coord { x, y })
    })
}

// ---------------------------------------------------------------------------
// GeoJSON helpers
// ---------------------------------------------------------------------------

const CRS_URN_PREFIX: &str = "urn:ogc:def:crs:EPSG::";

fn crs_member(crs: Crs) -> JsonValue {
    serde_json::json!({
        "type": "name",
        "properties": { "name": format!("{CRS_URN_PREFIX}{}", crs.epsg()) }
    })
}

fn parse_crs_name(name: &str) -> Result<Crs> {
    if name.ends_with("CRS84") {
        return Ok(Crs::wgs84());
    }
    match name.strip_prefix(CRS_URN_PREFIX) {
        Some(code) => code.parse(),
        None => name.parse(),
    }
}

/// Parse a FeatureCollection and its named CRS member.
pub fn parse_feature_collection(text: &str) -> Result<(Crs, Vec<Feature>)> {
    let fc = match text.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(fc) => fc,
        _ => {
            return Err(Error::UnexpectedGeometry {
                feature: 0,
                expected: "FeatureCollection",
            })
        }
    };
    let name = fc
        .foreign_members
        .as_ref()
        .and_then(|m| m.get("crs"))
        .and_then(|c| c.pointer("/properties/name"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| Error::MissingCrs {
            what: "feature collection".into(),
        })?;
    Ok((parse_crs_name(name)?, fc.features))
}

pub fn feature_collection_string(crs: Crs, features: Vec<Feature>) -> Result<String> {
    let mut members = JsonObject::new();
    members.insert("crs".into(), crs_member(crs));
    let fc = FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(members),
    };
    Ok(serde_json::to_string(&fc)?)
}

pub fn make_feature(value: geojson::Value, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

pub fn point_value(p: &Point<f64>) -> geojson::Value {
    geojson::Value::Point(vec![p.x(), p.y()])
}

fn ring_positions(ring: &LineString<f64>) -> Vec<Vec<f64>> {
    ring.coords().map(|c| vec![c.x, c.y]).collect()
}

pub fn polygon_value(p: &Polygon<f64>) -> geojson::Value {
    let mut rings = vec![ring_positions(p.exterior())];
    rings.extend(p.interiors().iter().map(ring_positions));
    geojson::Value::Polygon(rings)
}

fn ring_from_positions(ring: &[Vec<f64>]) -> LineString<f64> {
    ring.iter()
        .filter(|p| p.len() >= 2)
        .map(|p| Coord { x: p[0], y: p[1] })
        .collect::<Vec<_>>()
        .into()
}

fn feature_polygon(f: &Feature, index: usize) -> Result<Polygon<f64>> {
    match f.geometry.as_ref().map(|g| &g.value) {
        Some(geojson::Value::Polygon(rings)) if !rings.is_empty() => Ok(Polygon::new(
            ring_from_positions(&rings[0]),
            rings[1..].iter().map(|r| ring_from_positions(r)).collect(),
        )),
        _ => Err(Error::UnexpectedGeometry {
            feature: index,
            expected: "Polygon",
        }),
    }
}

pub fn property_f64(f: &Feature, key: &str) -> Option<f64> {
    f.property(key).and_then(JsonValue::as_f64).filter(|v| v.is_finite())
}

pub fn property_string(f: &Feature, key: &str) -> Option<String> {
    match f.property(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

/// Integer identifier; float-typed ids (`3.0`) are accepted.
pub fn property_id(f: &Feature, index: usize) -> Result<u32> {
    property_f64(f, "id")
        .filter(|v| *v >= 0.0 && v.fract() == 0.0 && *v <= u32::MAX as f64)
        .map(|v| v as u32)
        .ok_or_else(|| Error::MissingAttribute {
            attribute: "id".into(),
            feature: index,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(id: u32, x0: f64) -> PolygonRecord {
        let geometry = polygon![
            (x: x0, y: 0.0), (x: x0 + 2.0, y: 0.0), (x: x0 + 2.0, y: 2.0), (x: x0, y: 2.0), (x: x0, y: 0.0)
        ];
        PolygonRecord {
            id,
            species: Some("Calluna".into()),
            area: geometry.unsigned_area(),
            h_mean: None,
            geometry,
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = PolygonLayer::new(Crs::british_national_grid(), vec![square(1, 0.0), square(1, 5.0)]);
        assert!(matches!(err, Err(Error::DuplicateId(1))));
    }

    #[test]
    fn test_polygon_layer_roundtrip() {
        let layer =
            PolygonLayer::new(Crs::british_national_grid(), vec![square(7, 0.0), square(3, 5.0)]).unwrap();
        let text = layer.to_geojson_string().unwrap();
        let back = PolygonLayer::from_geojson_str(&text).unwrap();
        assert_eq!(back.crs, layer.crs);
        assert_eq!(back.ids(), vec![7, 3]);
        assert_eq!(back.len(), 2);
        assert_eq!(back.records()[0].geometry, layer.records()[0].geometry);
        assert_eq!(back.records()[1].species.as_deref(), Some("Calluna"));
    }

    #[test]
    fn test_missing_crs_is_error() {
        let text = r#"{"type":"FeatureCollection","features":[]}"#;
        assert!(matches!(
            PolygonLayer::from_geojson_str(text),
            Err(Error::MissingCrs { .. })
        ));
    }

    #[test]
    fn test_point_layer_reads_float_ids() {
        let text = r#"{"type":"FeatureCollection",
            "crs":{"type":"name","properties":{"name":"EPSG:27700"}},
            "features":[{"type":"Feature","geometry":{"type":"Point","coordinates":[1.0,2.0]},
                         "properties":{"id":4.0,"d_mean":120,"species":"Ulex","h_mean":null}}]}"#;
        let layer = PointLayer::from_geojson_str(text).unwrap();
        assert_eq!(layer.crs, Crs::british_national_grid());
        let r = &layer.records[0];
        assert_eq!((r.id, r.d_mean, r.h_mean), (4, 120.0, None));
        assert_eq!(r.location, Point::new(1.0, 2.0));
    }

    #[test]
    fn test_point_layer_requires_diameter() {
        let text = r#"{"type":"FeatureCollection",
            "crs":{"type":"name","properties":{"name":"urn:ogc:def:crs:EPSG::27700"}},
            "features":[{"type":"Feature","geometry":{"type":"Point","coordinates":[1.0,2.0]},
                         "properties":{"id":1}}]}"#;
        assert!(matches!(
            PointLayer::from_geojson_str(text),
            Err(Error::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_representative_point_inside() {
        let r = square(1, 10.0);
        let p = r.representative_point().unwrap();
        assert!(r.bounds().unwrap().contains(p.x(), p.y()));
    }
}
