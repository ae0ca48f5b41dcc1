//! Error types for the shrubheight pipeline.

use thiserror::Error;

/// Main error type for every pipeline stage.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("LAS error: {0}")]
    Las(#[from] las::Error),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote store returned {status} for {url}")]
    RemoteStatus { status: u16, url: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Diameter {diameter}m seems too large. Check if input is in meters not centimeters.")]
    UnitMismatch { diameter: f64 },

    #[error("{what} has no coordinate reference system")]
    MissingCrs { what: String },

    #[error("CRS mismatch: {0} vs {1}")]
    CrsMismatch(String, String),

    #[error("unsupported CRS: {0}")]
    UnsupportedCrs(String),

    #[error("projection failed: {0}")]
    Projection(String),

    #[error("Raster size mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    SizeMismatch { er: usize, ec: usize, ar: usize, ac: usize },

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("missing attribute '{attribute}' on feature {feature}")]
    MissingAttribute { attribute: String, feature: usize },

    #[error("duplicate polygon identifier {0}")]
    DuplicateId(u32),

    #[error("unsupported geometry on feature {feature}: expected {expected}")]
    UnexpectedGeometry { feature: usize, expected: &'static str },

    #[error("{count} rasters named '{source_name}' overlap polygon {polygon_id}")]
    ConflictingSources {
        polygon_id: u32,
        source_name: String,
        count: usize,
    },

    #[error("model error: {0}")]
    Model(String),

    #[error("not enough data: {0}")]
    InsufficientData(String),

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
