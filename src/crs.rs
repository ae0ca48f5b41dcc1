//! Coordinate reference systems and point reprojection.
//!
//! Every geometry and raster in the pipeline carries an EPSG-coded [`Crs`].
//! Reprojection goes through `proj4rs` (pure Rust); only the handful of
//! systems the survey data actually uses are registered.

use crate::error::{Error, Result};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use std::fmt;
use std::str::FromStr;

/// WGS84 geographic (longitude/latitude in degrees).
pub const EPSG_WGS84: u32 = 4326;
/// OSGB36 / British National Grid.
pub const EPSG_BNG: u32 = 27700;
/// Web Mercator.
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// An EPSG-coded coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crs {
    epsg: u32,
}

impl Crs {
    pub fn from_epsg(epsg: u32) -> Self {
        Self { epsg }
    }

    pub fn wgs84() -> Self {
        Self::from_epsg(EPSG_WGS84)
    }

    pub fn british_national_grid() -> Self {
        Self::from_epsg(EPSG_BNG)
    }

    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    /// True for systems with angular (degree) coordinates.
    pub fn is_geographic(&self) -> bool {
        self.epsg == EPSG_WGS84
    }

    /// PROJ.4 definition, if the code is one we know how to project.
    pub fn proj_string(&self) -> Option<String> {
        match self.epsg {
            EPSG_WGS84 => Some("+proj=longlat +datum=WGS84 +no_defs".into()),
            EPSG_WEB_MERCATOR => Some(
                "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                    .into(),
            ),
            EPSG_BNG => Some(
                "+proj=tmerc +lat_0=49 +lon_0=-2 +k=0.9996012717 +x_0=400000 +y_0=-100000 \
                 +ellps=airy +towgs84=446.448,-125.157,542.06,0.15,0.247,0.842,-20.489 \
                 +units=m +no_defs"
                    .into(),
            ),
            code @ 32601..=32660 => Some(format!(
                "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
                code - 32600
            )),
            code @ 32701..=32760 => Some(format!(
                "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
                code - 32700
            )),
            _ => None,
        }
    }

    /// Fail with [`Error::CrsMismatch`] unless `other` is the same system.
    pub fn ensure_same(&self, other: &Crs) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(Error::CrsMismatch(self.to_string(), other.to_string()))
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

impl FromStr for Crs {
    type Err = Error;

    /// Accepts `EPSG:27700`, `epsg:27700` or a bare code.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        code.parse::<u32>()
            .map(Crs::from_epsg)
            .map_err(|_| Error::UnsupportedCrs(s.to_string()))
    }
}

/// Reusable transformer between two coordinate systems.
pub struct CoordTransformer {
    source: Crs,
    target: Crs,
    projs: Option<(Proj, Proj)>,
}

impl fmt::Debug for CoordTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordTransformer")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl CoordTransformer {
    pub fn new(source: Crs, target: Crs) -> Result<Self> {
        if source == target {
            return Ok(Self {
                source,
                target,
                projs: None,
            });
        }
        let build = |crs: Crs| -> Result<Proj> {
            let def = crs
                .proj_string()
                .ok_or_else(|| Error::UnsupportedCrs(crs.to_string()))?;
            Proj::from_proj_string(&def)
                .map_err(|e| Error::Projection(format!("{crs}: {e:?}")))
        };
        Ok(Self {
            source,
            target,
            projs: Some((build(source)?, build(target)?)),
        })
    }

    pub fn source(&self) -> Crs {
        self.source
    }

    pub fn target(&self) -> Crs {
        self.target
    }

    pub fn is_identity(&self) -> bool {
        self.projs.is_none()
    }

    /// Transform one coordinate pair. Geographic coordinates are in degrees.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let Some((src, dst)) = &self.projs else {
            return Ok((x, y));
        };
        let mut point = if self.source.is_geographic() {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(src, dst, &mut point).map_err(|e| {
            Error::Projection(format!("{} -> {} at ({x}, {y}): {e:?}", self.source, self.target))
        })?;
        if self.target.is_geographic() {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }
}
