//! End-to-end runs over small synthetic surveys on local disk.

use approx::assert_relative_eq;
use geo::{polygon, Area, Point};
use las::point::{Classification, Format};
use las::{Builder, Write, Writer};
use shrubheight::geotiff::{load_geotiff, save_geotiff};
use shrubheight::lidar_stats::{process_lidar_data, write_csv};
use shrubheight::modelling::{self, EvalMethod, MlTable, ModelKind, ModelParams};
use shrubheight::raster_stats::process_data;
use shrubheight::{
    create_circle, extract_all, get_raster_stats, normalize_dsm, Crs, ExtractionParams, GeoTransform, Location,
    PolygonLayer, PolygonRecord, Raster, RasterSource, SourceConflict, Store,
};
use std::path::Path;

const PLOTS: usize = 8;

fn bng() -> Crs {
    Crs::british_national_grid()
}

fn plot_height(i: usize) -> f64 {
    0.5 + 0.25 * i as f64
}

/// 2 m squares along y = 1..3, every 4 m from x = 1.
fn plots() -> PolygonLayer {
    let records = (0..PLOTS)
        .map(|i| {
            let x0 = 1.0 + 4.0 * i as f64;
            let geometry = polygon![
                (x: x0, y: 1.0), (x: x0 + 2.0, y: 1.0), (x: x0 + 2.0, y: 3.0), (x: x0, y: 3.0), (x: x0, y: 1.0)
            ];
            PolygonRecord {
                id: i as u32 + 1,
                species: Some(if i % 2 == 0 { "Calluna" } else { "Ulex" }.into()),
                area: geometry.unsigned_area(),
                h_mean: None,
                geometry,
            }
        })
        .collect();
    PolygonLayer::new(bng(), records).unwrap()
}

/// Normalised heights: each plot's four cells hold its height, the rest 0.
fn height_raster() -> Raster {
    let (nrow, ncol) = (4, 4 * PLOTS + 2);
    let mut r = Raster::new(nrow, ncol, 0.0)
        .with_transform(GeoTransform::from_origin(0.0, 4.0, 1.0, 1.0))
        .with_crs(bng())
        .with_nodata(-9999.0);
    for i in 0..PLOTS {
        for row in 1..=2 {
            for col in [1 + 4 * i, 2 + 4 * i] {
                r.set(row, col, plot_height(i));
            }
        }
    }
    r
}

fn write_tile(path: &Path) {
    let mut builder = Builder::from((1, 2));
    builder.point_format = Format::new(2).unwrap();
    let mut writer = Writer::from_path(path, builder.into_header().unwrap()).unwrap();
    for i in 0..PLOTS {
        let x0 = 1.0 + 4.0 * i as f64;
        for (x, y, z, class) in [
            (x0 + 0.5, 1.5, 10.0, 2),
            (x0 + 1.0, 2.0, 10.0 + plot_height(i) / 2.0, 1),
            (x0 + 1.5, 2.5, 10.0 + plot_height(i), 1),
        ] {
            writer
                .write(las::Point {
                    x,
                    y,
                    z,
                    return_number: 1,
                    classification: Classification::new(class).unwrap(),
                    ..Default::default()
                })
                .unwrap();
        }
    }
    drop(writer);
}

#[test]
fn test_normalize_uniform_surface_through_geotiff() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::local();
    let grid = |fill: f64| {
        Raster::new(10, 10, fill)
            .with_transform(GeoTransform::from_origin(300000.0, 700000.0, 1.0, 1.0))
            .with_crs(bng())
            .with_nodata(-9999.0)
    };
    let dtm_loc = Location::from(dir.path().join("dtm.tif"));
    let dsm_loc = Location::from(dir.path().join("dsm.tif"));
    save_geotiff(&store, &grid(100.0), &dtm_loc).unwrap();
    save_geotiff(&store, &grid(102.0), &dsm_loc).unwrap();

    let dtm = load_geotiff(&store, &dtm_loc).unwrap();
    let dsm = load_geotiff(&store, &dsm_loc).unwrap();
    let out = normalize_dsm(&dtm, &dsm, bng()).unwrap();
    let out_loc = Location::from(dir.path().join("interim").join("sfm_normalized.tif"));
    save_geotiff(&store, &out, &out_loc).unwrap();

    let back = load_geotiff(&store, &out_loc).unwrap();
    assert_eq!((back.nrow, back.ncol), (10, 10));
    assert_eq!(back.nodata, Some(-9999.0));
    assert_eq!(back.crs, Some(bng()));
    for &v in back.data() {
        assert_relative_eq!(v, 1.0, epsilon = 1e-9);
    }
}

#[test]
fn test_circle_of_two_metres_diameter() {
    let circle = create_circle(Point::new(300000.0, 700000.0), 200.0).unwrap();
    assert_relative_eq!(circle.unsigned_area(), 31415.9, max_relative = 1e-2);
}

#[test]
fn test_polygon_outside_raster_has_no_stats() {
    let far = polygon![
        (x: 500.0, y: 500.0), (x: 510.0, y: 500.0), (x: 510.0, y: 510.0), (x: 500.0, y: 510.0), (x: 500.0, y: 500.0)
    ];
    let record = PolygonRecord {
        id: 9,
        species: None,
        area: far.unsigned_area(),
        h_mean: None,
        geometry: far,
    };
    let stats =
        get_raster_stats(&record, &[RasterSource::new("sfm", height_raster())], SourceConflict::Pool).unwrap();
    assert!(stats.is_empty());
}

#[test]
fn test_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::local();
    let layer = plots();

    // LiDAR points under each plot
    let tiles = dir.path().join("raw").join("LiDAR");
    std::fs::create_dir_all(&tiles).unwrap();
    write_tile(&tiles.join("leafon_01.las"));
    let point_dir = Location::from(dir.path().join("interim").join("lidar_leafon_field_id"));
    let params = ExtractionParams {
        tile_crs: bng(),
        output_crs: bng(),
    };
    let written = extract_all(&store, &Location::from(tiles.as_path()), &layer, &params, &point_dir).unwrap();
    assert_eq!(written.len(), PLOTS);
    assert_eq!(written[0].file_name().as_deref(), Some("1_b01.geojson"));

    // ground truth
    let rows = process_lidar_data(&store, &point_dir, &layer).unwrap();
    assert_eq!(rows.len(), PLOTS);
    for (i, row) in rows.iter().enumerate() {
        assert_relative_eq!(row.h_lidar().unwrap(), plot_height(i) * 100.0, epsilon = 0.2);
        assert_relative_eq!(row.ground.unwrap().max, 10.0, epsilon = 1e-6);
    }
    let processed = Location::from(dir.path().join("processed"));
    let mut buf = Vec::new();
    write_csv(&rows, &mut buf).unwrap();
    store
        .write_bytes(&processed.join("stats_field_lidar_leafon.csv"), &buf)
        .unwrap();

    // SfM statistics joined with ground truth
    let sources = [RasterSource::new("sfm", height_raster())];
    let table_loc = process_data(&store, &layer, &sources, SourceConflict::Pool, &processed, "field").unwrap();
    assert_eq!(table_loc.file_name().as_deref(), Some("shrubs2ml_field.csv"));
    let text = store.read_to_string(&table_loc).unwrap();
    assert!(text.starts_with("id,sfm_mean,sfm_std,sfm_min,sfm_max,"));
    assert!(text.lines().next().unwrap().ends_with(",area,h_lidar"));

    // modelling on the mean height alone
    let table = MlTable::from_reader(text.as_bytes(), "h_lidar").unwrap();
    assert_eq!(table.n_rows(), PLOTS);
    assert!(!table.has_missing_target());
    let mean_col = table.feature_names.iter().position(|n| n == "sfm_mean").unwrap();
    let reduced = MlTable {
        feature_names: vec!["sfm_mean".into()],
        features: table.select(&[mean_col]),
        ..table
    };
    let out = dir.path().join("output");
    let reports = modelling::run(
        &store,
        &reduced,
        "h_lidar",
        &[ModelKind::Mlr],
        &ModelParams::default(),
        false,
        &Location::from(out.as_path()),
    )
    .unwrap();
    let report = &reports[0];
    assert_eq!(report.method, EvalMethod::KFold);
    assert!(report.accuracy.unwrap().rmse < 1.0);
    assert!(out.join("results_raw_h_lidar_MLR_k-fold.csv").exists());
    assert!(out.join("imps_h_lidar_MLR_k-fold.csv").exists());
}

#[test]
fn test_sfm_stats_needs_lidar_table() {
    let dir = tempfile::tempdir().unwrap();
    let sources = [RasterSource::new("sfm", height_raster())];
    let out = Location::from(dir.path());
    assert!(process_data(&Store::local(), &plots(), &sources, SourceConflict::Pool, &out, "manual").is_err());
}
