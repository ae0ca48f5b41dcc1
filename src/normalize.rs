//! DSM normalisation: height above ground from a surface and a terrain model.
//!
//! Both rasters are warped (nearest neighbour) onto the grid the surface
//! model gets in the target CRS, then `dsm − (dtm + 1)` is taken per cell.

use crate::crs::{CoordTransformer, Crs};
use crate::error::{Error, Result};
use crate::raster::{Bounds, GeoTransform, Raster};
use tracing::{debug, info};

/// Calibration offset between the SfM surface and the terrain model (m).
pub const TERRAIN_OFFSET: f64 = 1.0;

/// Samples per raster edge when estimating the warped extent.
const EDGE_SAMPLES: usize = 21;

/// Output grid for warping a `cols × rows` raster covering `bounds` through
/// `t`: the envelope of the transformed edges, with a square pixel size that
/// keeps the source diagonal pixel count.
pub fn default_transform(
    t: &CoordTransformer,
    cols: usize,
    rows: usize,
    bounds: &Bounds,
) -> Result<(GeoTransform, usize, usize)> {
    if cols == 0 || rows == 0 {
        return Err(Error::InvalidParameter {
            name: "raster size",
            value: format!("{cols}x{rows}"),
            reason: "raster has no cells".into(),
        });
    }
    let mut samples = Vec::with_capacity(EDGE_SAMPLES * 4);
    for i in 0..EDGE_SAMPLES {
        let f = i as f64 / (EDGE_SAMPLES - 1) as f64;
        let x = bounds.min_x + f * bounds.width();
        let y = bounds.min_y + f * bounds.height();
        samples.push((x, bounds.min_y));
        samples.push((x, bounds.max_y));
        samples.push((bounds.min_x, y));
        samples.push((bounds.max_x, y));
    }
    let projected = samples
        .into_iter()
        .map(|(x, y)| t.transform(x, y))
        .collect::<Result<Vec<_>>>()?;
    let env = Bounds::from_points(projected).ok_or_else(|| Error::Projection("empty extent".into()))?;

    let diagonal = env.width().hypot(env.height());
    let res = diagonal / (cols as f64).hypot(rows as f64);
    if !(res > 0.0) {
        return Err(Error::Projection(format!("degenerate extent {env:?}")));
    }
    let out_cols = ((env.width() / res) + 0.5) as usize;
    let out_rows = ((env.height() / res) + 0.5) as usize;
    Ok((
        GeoTransform::from_origin(env.min_x, env.max_y, res, res),
        out_cols.max(1),
        out_rows.max(1),
    ))
}

/// Nearest-neighbour resample of one band onto a destination grid.
/// Cells that fall off the source, or onto source no-data, get `dst_nodata`.
pub fn reproject_nearest(
    src: &Raster,
    band: usize,
    dst_transform: &GeoTransform,
    dst_crs: Crs,
    cols: usize,
    rows: usize,
    dst_nodata: f64,
) -> Result<Vec<f64>> {
    let src_crs = src.crs.ok_or_else(|| Error::MissingCrs {
        what: "source raster".into(),
    })?;
    let inverse = CoordTransformer::new(dst_crs, src_crs)?;
    let mut out = vec![dst_nodata; cols * rows];
    for row in 0..rows {
        for col in 0..cols {
            let (x, y) = dst_transform.pixel_center(col, row);
            let (sx, sy) = inverse.transform(x, y)?;
            if let Some((r, c)) = src.xy_to_rc(sx, sy) {
                let v = src.get_band(band, r, c);
                if !src.is_nodata(v) {
                    out[row * cols + col] = v;
                }
            }
        }
    }
    Ok(out)
}

/// Height of the surface above the terrain, on the DSM's grid in `target`.
///
/// Cells where the warped DSM is no-data, or where the terrain model has no
/// value, carry the DSM's no-data sentinel (NaN if it declares none).
pub fn normalize_dsm(dtm: &Raster, dsm: &Raster, target: Crs) -> Result<Raster> {
    let dsm_crs = dsm.crs.ok_or_else(|| Error::MissingCrs { what: "DSM".into() })?;
    if dtm.crs.is_none() {
        return Err(Error::MissingCrs { what: "DTM".into() });
    }

    let t = CoordTransformer::new(dsm_crs, target)?;
    let (transform, cols, rows) = default_transform(&t, dsm.ncol, dsm.nrow, &dsm.bounds())?;
    info!("normalising onto {}x{} grid in {}", cols, rows, target);

    let nodata = dsm.nodata.unwrap_or(f64::NAN);
    let is_nodata = |v: f64| if nodata.is_nan() { v.is_nan() } else { v == nodata };

    let surface = reproject_nearest(dsm, 0, &transform, target, cols, rows, nodata)?;
    let terrain = reproject_nearest(dtm, 0, &transform, target, cols, rows, f64::NAN)?;

    let mut masked = 0usize;
    let result: Vec<f64> = surface
        .iter()
        .zip(&terrain)
        .map(|(&s, &g)| {
            if is_nodata(s) || g.is_nan() {
                masked += 1;
                nodata
            } else {
                s - (g + TERRAIN_OFFSET)
            }
        })
        .collect();
    debug!("{} of {} cells without data", masked, result.len());

    Ok(Raster::from_vec(rows, cols, result)
        .with_transform(transform)
        .with_crs(target)
        .with_nodata(nodata))
}
