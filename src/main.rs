//! Shrub height pipeline, one subcommand per stage.
//!
//! Usage:
//!   shrubheight point2pol --input data/raw/field_points.geojson
//!   shrubheight normalize --dtm dtm.tif --dsm dsm.tif
//!   shrubheight sfm-stats --method field --raster sfm=data/interim/sfm_normalized.tif
//!   shrubheight las-extract --polygons data/interim/field_pols.geojson --tiles data/raw/LiDAR/Leaf-On
//!   shrubheight las-stats --method field
//!   shrubheight model --method field
//!
//! Paths may be local or `s3://bucket/key` when `AWS_ENDPOINT_URL` is set.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shrubheight::{
    geotiff::{load_geotiff, save_geotiff},
    lidar_stats,
    modelling::{self, MlTable, ModelKind, ModelParams},
    normalize::normalize_dsm,
    point_cloud::{extract_all, ExtractionParams},
    prepro::{adjust_origin, points_to_polygons, relabel_manual, ORIGIN_SHIFT},
    raster_stats::{parse_source_arg, process_data, RasterSource, SourceConflict},
    Crs, Location, PointLayer, PolygonLayer, Store,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(Parser, Debug)]
#[command(
    name = "shrubheight",
    version,
    about = "Shrub canopy height from SfM rasters and LiDAR point clouds"
)]
struct Cli {
    /// Verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// S3-compatible endpoint for s3:// locations
    #[arg(long, env = "AWS_ENDPOINT_URL", global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Buffer field survey points into plot circles
    Point2pol {
        #[arg(long, default_value = "data/raw/field_points.geojson")]
        input: String,
        #[arg(long, default_value = "data/interim")]
        output_dir: String,
        #[arg(long, default_value = "EPSG:27700")]
        crs: String,
    },
    /// Renumber and re-measure manually digitised polygons
    Manual {
        #[arg(long, default_value = "data/raw/manual_pols.geojson")]
        input: String,
        #[arg(long, default_value = "data/interim")]
        output_dir: String,
        #[arg(long, default_value = "EPSG:27700")]
        crs: String,
    },
    /// Correct the orthomosaic origin offset and reproject it
    AdjustOrigin {
        #[arg(long)]
        input: String,
        #[arg(long, default_value = "data/interim/rgb_ortho.tif")]
        output: String,
        #[arg(long, default_value_t = ORIGIN_SHIFT.0, allow_hyphen_values = true)]
        dx: f64,
        #[arg(long, default_value_t = ORIGIN_SHIFT.1, allow_hyphen_values = true)]
        dy: f64,
        #[arg(long, default_value = "EPSG:27700")]
        crs: String,
    },
    /// Height above ground: DSM − (DTM + 1)
    Normalize {
        #[arg(long)]
        dtm: String,
        #[arg(long)]
        dsm: String,
        #[arg(long, default_value = "data/interim/sfm_normalized.tif")]
        output: String,
        #[arg(long, default_value = "EPSG:27700")]
        crs: String,
    },
    /// Per-polygon raster statistics joined with LiDAR ground truth
    SfmStats {
        #[arg(long, default_value = "data/interim")]
        input_dir: String,
        /// Labelling method, "field" or "manual"
        #[arg(long, default_value = "field")]
        method: String,
        #[arg(long, default_value = "data/processed")]
        output_dir: String,
        /// Rasters to summarise as NAME=TIF, or a bare TIF named after its
        /// file (default: sfm=<input-dir>/sfm_normalized.tif)
        #[arg(long = "raster", value_name = "NAME=TIF")]
        rasters: Vec<String>,
        /// Same-named rasters overlapping one polygon: pool, last-wins or reject
        #[arg(long, default_value = "pool")]
        conflict: String,
    },
    /// Cut LiDAR points under each polygon out of every tile
    LasExtract {
        #[arg(long, default_value = "data/interim/field_pols.geojson")]
        polygons: String,
        #[arg(long, default_value = "data/raw/LiDAR/Leaf-On")]
        tiles: String,
        #[arg(long, default_value = "data/interim/lidar_leafon_field_id")]
        output_dir: String,
        #[arg(long, default_value = "EPSG:32630")]
        tile_crs: String,
        #[arg(long, default_value = "EPSG:27700")]
        output_crs: String,
    },
    /// Ground and canopy statistics per polygon from extracted points
    LasStats {
        #[arg(long, default_value = "field")]
        method: String,
        /// Point files (default: data/interim/lidar_leafon_<method>_id)
        #[arg(long)]
        input_dir: Option<String>,
        /// Polygons (default: data/interim/<method>_pols.geojson)
        #[arg(long)]
        polygons: Option<String>,
        #[arg(long, default_value = "data/processed")]
        output_dir: String,
    },
    /// Compare regression models on the merged table
    Model {
        #[arg(long, default_value = "field")]
        method: String,
        #[arg(long, default_value = "data/processed")]
        input_dir: String,
        #[arg(long, default_value = "h_lidar")]
        target: String,
        #[arg(long, value_delimiter = ',', default_value = "MLR,SVM,GBM,RF")]
        models: Vec<String>,
        #[arg(long, default_value = "data/output")]
        output_dir: String,
        /// Skip feature clustering
        #[arg(long)]
        no_selection: bool,
        #[arg(long, default_value_t = 5)]
        folds: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

// ==========================================================================
// Helpers
// ==========================================================================

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging already initialised");
    }
}

fn location(s: &str) -> Result<Location> {
    s.parse().with_context(|| format!("invalid location '{s}'"))
}

fn crs(s: &str) -> Result<Crs> {
    s.parse().with_context(|| format!("invalid CRS '{s}'"))
}

// ==========================================================================
// Main
// ==========================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let store = match cli.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
        Some(endpoint) => Store::with_endpoint(endpoint.trim())?,
        None => Store::local(),
    };

    match cli.command {
        Commands::Point2pol { input, output_dir, crs: target } => {
            let points = PointLayer::load(&store, &location(&input)?)
                .with_context(|| format!("reading survey points {input}"))?;
            let layer = points_to_polygons(&points, crs(&target)?).context("buffering survey points")?;
            let out = location(&output_dir)?.join("field_pols.geojson");
            layer.save(&store, &out)?;
            info!("{} polygons written to {}", layer.len(), out);
        }

        Commands::Manual { input, output_dir, crs: target } => {
            let text = store.read_to_string(&location(&input)?)?;
            let layer = PolygonLayer::from_geojson_str_unlabelled(&text)
                .with_context(|| format!("reading manual polygons {input}"))?;
            let layer = relabel_manual(&layer, crs(&target)?)?;
            let out = location(&output_dir)?.join("manual_pols.geojson");
            layer.save(&store, &out)?;
            info!("{} polygons written to {}", layer.len(), out);
        }

        Commands::AdjustOrigin { input, output, dx, dy, crs: target } => {
            let raster = load_geotiff(&store, &location(&input)?).with_context(|| format!("reading {input}"))?;
            let adjusted = adjust_origin(&raster, dx, dy, crs(&target)?)?;
            save_geotiff(&store, &adjusted, &location(&output)?)?;
            info!("shifted by ({}, {}) and written to {}", dx, dy, output);
        }

        Commands::Normalize { dtm, dsm, output, crs: target } => {
            let dtm_r = load_geotiff(&store, &location(&dtm)?).with_context(|| format!("reading DTM {dtm}"))?;
            let dsm_r = load_geotiff(&store, &location(&dsm)?).with_context(|| format!("reading DSM {dsm}"))?;
            let normalized = normalize_dsm(&dtm_r, &dsm_r, crs(&target)?).context("normalising DSM")?;
            save_geotiff(&store, &normalized, &location(&output)?)?;
            info!("{}x{} normalised raster written to {}", normalized.ncol, normalized.nrow, output);
        }

        Commands::SfmStats {
            input_dir,
            method,
            output_dir,
            rasters,
            conflict,
        } => {
            let input = location(&input_dir)?;
            let policy: SourceConflict = conflict.parse()?;
            let layer = PolygonLayer::load(&store, &input.join(&format!("{method}_pols.geojson")))
                .context("reading polygons")?;
            let named = if rasters.is_empty() {
                vec![("sfm".to_string(), input.join("sfm_normalized.tif"))]
            } else {
                rasters
                    .iter()
                    .map(|r| parse_source_arg(r).with_context(|| format!("invalid raster '{r}'")))
                    .collect::<Result<Vec<_>>>()?
            };
            let sources = named
                .into_iter()
                .map(|(name, l)| {
                    RasterSource::load(name, &store, &l).with_context(|| format!("reading raster {l}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let written = process_data(&store, &layer, &sources, policy, &location(&output_dir)?, &method)
                .context("computing SfM statistics")?;
            info!("training table written to {}", written);
        }

        Commands::LasExtract {
            polygons,
            tiles,
            output_dir,
            tile_crs,
            output_crs,
        } => {
            let layer = PolygonLayer::load(&store, &location(&polygons)?).context("reading polygons")?;
            let params = ExtractionParams {
                tile_crs: crs(&tile_crs)?,
                output_crs: crs(&output_crs)?,
            };
            let written = extract_all(&store, &location(&tiles)?, &layer, &params, &location(&output_dir)?)
                .context("extracting LiDAR points")?;
            info!("{} point files written to {}", written.len(), output_dir);
        }

        Commands::LasStats {
            method,
            input_dir,
            polygons,
            output_dir,
        } => {
            let input_dir = input_dir.unwrap_or_else(|| format!("data/interim/lidar_leafon_{method}_id"));
            let polygons = polygons.unwrap_or_else(|| format!("data/interim/{method}_pols.geojson"));
            let layer = PolygonLayer::load(&store, &location(&polygons)?).context("reading polygons")?;
            let rows = lidar_stats::process_lidar_data(&store, &location(&input_dir)?, &layer)?;
            let mut buf = Vec::new();
            lidar_stats::write_csv(&rows, &mut buf)?;
            let out = location(&output_dir)?.join(&format!("stats_{method}_lidar_leafon.csv"));
            store.write_bytes(&out, &buf)?;
            info!("LiDAR statistics written to {}", out);
        }

        Commands::Model {
            method,
            input_dir,
            target,
            models,
            output_dir,
            no_selection,
            folds,
            seed,
        } => {
            let table_loc = location(&input_dir)?.join(&format!("shrubs2ml_{method}.csv"));
            let bytes = store.read_bytes(&table_loc).with_context(|| format!("reading {table_loc}"))?;
            let table = MlTable::from_reader(bytes.as_slice(), &target)?;
            let kinds = models
                .iter()
                .map(|m| m.parse::<ModelKind>())
                .collect::<shrubheight::Result<Vec<_>>>()?;
            let params = ModelParams {
                folds,
                seed,
                ..ModelParams::default()
            };
            let out = location(&output_dir)?;
            let reports = modelling::run(&store, &table, &target, &kinds, &params, !no_selection, &out)?;
            for r in &reports {
                match r.accuracy {
                    Some(a) => println!(
                        "{:<4} {:<8} rmse={:.3} bias={:.3} r2={:.3} (n={})",
                        r.model, r.method, a.rmse, a.bias, a.r2, a.n
                    ),
                    None => println!("{:<4} {:<8} no scored predictions", r.model, r.method),
                }
            }
        }
    }

    Ok(())
}
