//! # shrubheight: shrub canopy height from drone and LiDAR surveys
//!
//! Estimates shrub height per field plot from SfM surface models and RGB
//! orthomosaics, validated against canopy height derived from classified
//! LiDAR returns.
//!
//! This crate provides:
//! - **Geometry preparation**: `create_circle`, `points_to_polygons`,
//!   `relabel_manual`, `adjust_origin`
//! - **Raster normalisation**: `normalize_dsm`, `default_transform`, `reproject_nearest`
//! - **Per-polygon raster statistics**: `get_raster_stats`, `process_polygons`,
//!   `StatsTable`, with an explicit `SourceConflict` policy
//! - **Point-cloud extraction**: `tile_may_contain`, `bbox_mask`, `extract_tile`, `extract_all`
//! - **Ground truth and modelling**: `process_lidar_data`, `modelling::run`
//! - **I/O**: GeoTIFF, GeoJSON, LAS and CSV on local disk or S3-compatible storage

pub mod crs;
pub mod error;
pub mod geotiff;
pub mod lidar_stats;
pub mod modelling;
pub mod normalize;
pub mod point_cloud;
pub mod prepro;
pub mod raster;
pub mod raster_stats;
pub mod stats;
pub mod storage;
pub mod vector;

pub use crs::Crs;
pub use error::{Error, Result};
pub use normalize::normalize_dsm;
pub use point_cloud::{bbox_mask, extract_all, extract_tile, tile_may_contain, ExtractionParams, PointRecord};
pub use prepro::{adjust_origin, create_circle, points_to_polygons, relabel_manual, shift_origin};
pub use raster::{Bounds, GeoTransform, Raster};
pub use raster_stats::{get_raster_stats, process_polygons, RasterSource, SourceConflict, StatsRecord, StatsTable};
pub use stats::{compute_stats, StatsSummary};
pub use storage::{Location, Store};
pub use vector::{PointLayer, PolygonLayer, PolygonRecord};
