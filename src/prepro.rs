//! Geometry preparation: survey points → plot polygons.
//!
//! Field plots arrive either as centre points with a mean crown diameter,
//! which are buffered into circles, or as manually digitised polygons, which
//! get fresh sequential identifiers.

use crate::crs::{CoordTransformer, Crs};
use crate::error::{Error, Result};
use crate::raster::Raster;
use crate::vector::{PointLayer, PolygonLayer, PolygonRecord};
use geo::{Area, LineString, Point, Polygon};
use std::f64::consts::PI;
use tracing::{debug, info, warn};

/// Largest plausible crown diameter. Anything above it is a cm/m mix-up.
pub const MAX_DIAMETER: f64 = 500.0;

/// Vertices per circle (16 per quadrant).
pub const CIRCLE_SEGMENTS: usize = 64;

/// Circular buffer of diameter `d_mean` around `center`.
///
/// Fails with [`Error::UnitMismatch`] when `d_mean > MAX_DIAMETER` and on a
/// NaN diameter. A diameter of zero or less buffers to an empty polygon.
pub fn create_circle(center: Point<f64>, d_mean: f64) -> Result<Polygon<f64>> {
    if d_mean.is_nan() {
        return Err(Error::InvalidParameter {
            name: "d_mean",
            value: d_mean.to_string(),
            reason: "diameter is not a number".into(),
        });
    }
    if d_mean > MAX_DIAMETER {
        return Err(Error::UnitMismatch { diameter: d_mean });
    }
    if d_mean <= 0.0 {
        return Ok(Polygon::new(LineString::new(Vec::new()), vec![]));
    }
    let r = d_mean / 2.0;
    let mut coords = Vec::with_capacity(CIRCLE_SEGMENTS + 1);
    for i in 0..CIRCLE_SEGMENTS {
        let angle = 2.0 * PI * i as f64 / CIRCLE_SEGMENTS as f64;
        coords.push((center.x() + r * angle.cos(), center.y() + r * angle.sin()));
    }
    coords.push(coords[0]);
    Ok(Polygon::new(LineString::from(coords), vec![]))
}

/// Buffer every survey point in the target CRS and keep the plot columns.
pub fn points_to_polygons(points: &PointLayer, target: Crs) -> Result<PolygonLayer> {
    let points = points.to_crs(target)?;
    let records = points
        .records
        .iter()
        .map(|p| {
            let geometry = create_circle(p.location, p.d_mean)?;
            if geometry.exterior().0.is_empty() {
                warn!("plot {} has diameter {}, its polygon is empty", p.id, p.d_mean);
            } else {
                debug!("plot {} buffered to radius {}", p.id, p.d_mean / 2.0);
            }
            Ok(PolygonRecord {
                id: p.id,
                species: p.species.clone(),
                area: geometry.unsigned_area(),
                h_mean: p.h_mean,
                geometry,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    info!("{} plot polygons from survey points", records.len());
    PolygonLayer::new(target, records)
}

/// Manually labelled polygons: reproject, renumber 1..N in input order and
/// recompute every area from the geometry.
pub fn relabel_manual(layer: &PolygonLayer, target: Crs) -> Result<PolygonLayer> {
    let layer = layer.to_crs(target)?;
    let records = layer
        .records()
        .iter()
        .enumerate()
        .map(|(i, r)| PolygonRecord {
            id: i as u32 + 1,
            area: r.geometry.unsigned_area(),
            ..r.clone()
        })
        .collect();
    info!("{} manual polygons relabelled", layer.len());
    PolygonLayer::new(target, records)
}

/// Known origin offset of the orthomosaic, in map units (west, south).
pub const ORIGIN_SHIFT: (f64, f64) = (-1.0, -1.0);

/// Translate a raster's georeferencing by `(dx, dy)` map units.
pub fn shift_origin(raster: &Raster, dx: f64, dy: f64) -> Raster {
    Raster {
        transform: raster.transform.translated(dx, dy),
        ..raster.clone()
    }
}

/// Shift a raster's georeferencing by `(dx, dy)` map units, then warp it onto
/// `target`. Used to correct the orthomosaic's known origin offset.
pub fn adjust_origin(raster: &Raster, dx: f64, dy: f64, target: Crs) -> Result<Raster> {
    let src_crs = raster.crs.ok_or_else(|| Error::MissingCrs {
        what: "orthomosaic".into(),
    })?;
    let shifted = shift_origin(raster, dx, dy);
    if src_crs == target {
        return Ok(shifted);
    }
    let t = CoordTransformer::new(src_crs, target)?;
    let (transform, cols, rows) =
        crate::normalize::default_transform(&t, shifted.ncol, shifted.nrow, &shifted.bounds())?;
    let fill = raster.nodata.unwrap_or(f64::NAN);
    let bands = (0..shifted.band_count())
        .map(|b| {
            crate::normalize::reproject_nearest(&shifted, b, &transform, target, cols, rows, fill)
        })
        .collect::<Result<Vec<_>>>()?;
    let mut out = Raster::from_bands(rows, cols, bands)
        .with_transform(transform)
        .with_crs(target);
    out.nodata = raster.nodata;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GeoTransform;
    use crate::vector::PointObservation;
    use approx::assert_relative_eq;
    use geo::polygon;

    fn obs(id: u32, x: f64, d: f64) -> PointObservation {
        PointObservation {
            id,
            species: Some("A".into()),
            d_mean: d,
            h_mean: Some(1.5),
            location: Point::new(x, 0.0),
        }
    }

    #[test]
    fn test_create_circle_area() {
        let circle = create_circle(Point::new(0.0, 0.0), 200.0).unwrap();
        assert_relative_eq!(circle.unsigned_area(), PI * 1e4, max_relative = 1e-2);
    }

    #[test]
    fn test_create_circle_area_small_diameters() {
        for d in [0.5, 1.0, 3.7, 120.0, 500.0] {
            let circle = create_circle(Point::new(10.0, -4.0), d).unwrap();
            assert_relative_eq!(circle.unsigned_area(), PI * (d / 2.0).powi(2), max_relative = 1e-2);
        }
    }

    #[test]
    fn test_create_circle_validates_units() {
        let err = create_circle(Point::new(0.0, 0.0), 20000.0).unwrap_err();
        assert!(matches!(err, Error::UnitMismatch { .. }));
        assert!(err.to_string().contains("seems too large"));
    }

    #[test]
    fn test_zero_diameter_is_empty_polygon() {
        for d in [0.0, -2.0] {
            let circle = create_circle(Point::new(5.0, 5.0), d).unwrap();
            assert_eq!(circle.unsigned_area(), 0.0);
            assert!(crate::vector::polygon_bounds(&circle).is_none());
        }
        assert!(matches!(
            create_circle(Point::new(0.0, 0.0), f64::NAN),
            Err(Error::InvalidParameter { name: "d_mean", .. })
        ));
    }

    #[test]
    fn test_points_to_polygons_keeps_zero_diameter_record() {
        let points = PointLayer {
            crs: Crs::british_national_grid(),
            records: vec![obs(1, 0.0, 100.0), obs(2, 1.0, 0.0), obs(3, 2.0, 50.0)],
        };
        let layer = points_to_polygons(&points, Crs::british_national_grid()).unwrap();
        assert_eq!(layer.ids(), vec![1, 2, 3]);
        assert_eq!(layer.get(2).unwrap().area, 0.0);
        assert!(layer.get(2).unwrap().representative_point().is_none());
        assert!(layer.get(3).unwrap().area > 0.0);
    }

    #[test]
    fn test_points_to_polygons_projects_columns() {
        let points = PointLayer {
            crs: Crs::british_national_grid(),
            records: vec![obs(1, 0.0, 100.0), obs(2, 1.0, 200.0)],
        };
        let layer = points_to_polygons(&points, Crs::british_national_grid()).unwrap();
        assert_eq!(layer.len(), 2);
        let r = &layer.records()[1];
        assert_eq!(r.id, 2);
        assert_eq!(r.h_mean, Some(1.5));
        assert_relative_eq!(r.area, r.geometry.unsigned_area());
    }

    #[test]
    fn test_points_to_polygons_rejects_bad_record() {
        let points = PointLayer {
            crs: Crs::british_national_grid(),
            records: vec![obs(1, 0.0, 100.0), obs(2, 1.0, 900.0)],
        };
        assert!(points_to_polygons(&points, Crs::british_national_grid()).is_err());
    }

    #[test]
    fn test_relabel_manual_is_idempotent() {
        let geometry = polygon![(x: 0.0, y: 0.0), (x: 3.0, y: 0.0), (x: 3.0, y: 3.0), (x: 0.0, y: 0.0)];
        let records = vec![
            PolygonRecord { id: 40, species: None, area: -1.0, h_mean: None, geometry: geometry.clone() },
            PolygonRecord { id: 12, species: None, area: 99.0, h_mean: None, geometry },
        ];
        let layer = PolygonLayer::new(Crs::british_national_grid(), records).unwrap();
        let once = relabel_manual(&layer, Crs::british_national_grid()).unwrap();
        let twice = relabel_manual(&once, Crs::british_national_grid()).unwrap();
        assert_eq!(once.ids(), vec![1, 2]);
        assert_relative_eq!(once.records()[0].area, 4.5);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_adjust_origin_same_crs() {
        let raster = Raster::new(2, 2, 1.0)
            .with_transform(GeoTransform::from_origin(100.0, 200.0, 1.0, 1.0))
            .with_crs(Crs::british_national_grid());
        let out = adjust_origin(&raster, -1.0, -1.0, Crs::british_national_grid()).unwrap();
        assert_eq!(out.transform.origin_x, 99.0);
        assert_eq!(out.transform.origin_y, 199.0);
    }
}
