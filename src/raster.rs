//! Georeferenced raster grid with one or more bands.

use crate::crs::Crs;

/// Axis-aligned bounding box in map units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Envelope of a set of points. `None` for an empty set.
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut it = points.into_iter();
        let (x0, y0) = it.next()?;
        let mut b = Self::new(x0, y0, x0, y0);
        for (x, y) in it {
            b.min_x = b.min_x.min(x);
            b.min_y = b.min_y.min(y);
            b.max_x = b.max_x.max(x);
            b.max_y = b.max_y.max(y);
        }
        Some(b)
    }

    /// True when the boxes share no point. Touching edges count as overlap.
    pub fn disjoint(&self, other: &Bounds) -> bool {
        self.max_x < other.min_x
            || other.max_x < self.min_x
            || self.max_y < other.min_y
            || other.max_y < self.min_y
    }

    /// Inclusive containment test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Affine transformation coefficients for georeferencing rasters.
///
/// ```text
/// x = origin_x + col * pixel_width + row * row_rotation
/// y = origin_y + col * col_rotation + row * pixel_height
/// ```
///
/// North-up grids have zero rotation and a negative `pixel_height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub row_rotation: f64,
    pub col_rotation: f64,
}

impl GeoTransform {
    /// North-up transform with no rotation.
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            row_rotation: 0.0,
            col_rotation: 0.0,
        }
    }

    /// Upper-left origin with square-ish pixels of the given size, as
    /// rasterio's `from_origin(west, north, xsize, ysize)`.
    pub fn from_origin(west: f64, north: f64, xsize: f64, ysize: f64) -> Self {
        Self::new(west, north, xsize, -ysize)
    }

    /// Map coordinates at fractional pixel position (col, row).
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// Cell centre of pixel (col, row).
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Fractional pixel coordinates `(col, row)` of a map position.
    /// NaN for a degenerate transform.
    pub fn invert(&self, x: f64, y: f64) -> (f64, f64) {
        let det = self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation;
        if det.abs() < 1e-12 {
            return (f64::NAN, f64::NAN);
        }
        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        (
            (self.pixel_height * dx - self.row_rotation * dy) / det,
            (-self.col_rotation * dx + self.pixel_width * dy) / det,
        )
    }

    /// Shift the origin by a map-unit offset.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self {
            origin_x: self.origin_x + dx,
            origin_y: self.origin_y + dy,
            ..*self
        }
    }

    /// Envelope of a grid of `cols × rows` cells.
    pub fn bounds(&self, cols: usize, rows: usize) -> Bounds {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(cols as f64, 0.0),
            self.apply(0.0, rows as f64),
            self.apply(cols as f64, rows as f64),
        ];
        Bounds::from_points(corners).unwrap_or(Bounds::new(0.0, 0.0, 0.0, 0.0))
    }

    /// Pixel window of a `cols × rows` grid covering `bounds`, clamped to
    /// the grid.
    pub fn window(&self, bounds: &Bounds, cols: usize, rows: usize) -> Window {
        let corners = [
            self.invert(bounds.min_x, bounds.min_y),
            self.invert(bounds.min_x, bounds.max_y),
            self.invert(bounds.max_x, bounds.min_y),
            self.invert(bounds.max_x, bounds.max_y),
        ];
        let (mut c0, mut c1, mut r0, mut r1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for (c, r) in corners {
            c0 = c0.min(c);
            c1 = c1.max(c);
            r0 = r0.min(r);
            r1 = r1.max(r);
        }
        let clamp = |v: f64, hi: usize| -> usize {
            if v.is_nan() || v <= 0.0 {
                0
            } else {
                (v as usize).min(hi)
            }
        };
        Window {
            row0: clamp(r0.floor(), rows),
            row1: clamp(r1.ceil(), rows),
            col0: clamp(c0.floor(), cols),
            col1: clamp(c1.ceil(), cols),
        }
    }

    /// Transform of the sub-grid whose top-left pixel is `(col, row)`.
    pub fn offset(&self, col: usize, row: usize) -> Self {
        let (origin_x, origin_y) = self.apply(col as f64, row as f64);
        Self {
            origin_x,
            origin_y,
            ..*self
        }
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1.0, -1.0)
    }
}

/// Half-open pixel window `[row0, row1) × [col0, col1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub row0: usize,
    pub row1: usize,
    pub col0: usize,
    pub col1: usize,
}

impl Window {
    pub fn is_empty(&self) -> bool {
        self.row0 >= self.row1 || self.col0 >= self.col1
    }

    pub fn height(&self) -> usize {
        self.row1.saturating_sub(self.row0)
    }

    pub fn width(&self) -> usize {
        self.col1.saturating_sub(self.col0)
    }
}

/// True if `v` is the sentinel `nodata`. A NaN sentinel, or none at all,
/// matches NaN cells.
#[inline]
pub fn is_nodata_value(nodata: Option<f64>, v: f64) -> bool {
    match nodata {
        Some(nd) if nd.is_nan() => v.is_nan(),
        Some(nd) => v == nd,
        None => v.is_nan(),
    }
}

/// A raster (row-major), one `Vec` per band. Origin is top-left.
///
/// Pixel (r, c) of band b is `bands[b][r * ncol + c]`; its centre in map
/// coordinates is `transform.pixel_center(c, r)`.
#[derive(Debug, Clone)]
pub struct Raster {
    pub nrow: usize,
    pub ncol: usize,
    pub bands: Vec<Vec<f64>>,
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    /// Sentinel marking cells without a valid measurement.
    pub nodata: Option<f64>,
}

impl Raster {
    /// Single-band raster filled with a constant value.
    pub fn new(nrow: usize, ncol: usize, fill: f64) -> Self {
        Self::from_vec(nrow, ncol, vec![fill; nrow * ncol])
    }

    /// Single-band raster from an existing Vec (row-major).
    pub fn from_vec(nrow: usize, ncol: usize, data: Vec<f64>) -> Self {
        Self::from_bands(nrow, ncol, vec![data])
    }

    /// Multi-band raster. Every band must hold `nrow * ncol` values.
    pub fn from_bands(nrow: usize, ncol: usize, bands: Vec<Vec<f64>>) -> Self {
        assert!(bands.iter().all(|b| b.len() == nrow * ncol));
        Self {
            nrow,
            ncol,
            bands,
            transform: GeoTransform::from_origin(0.0, nrow as f64, 1.0, 1.0),
            crs: None,
            nodata: None,
        }
    }

    pub fn with_transform(mut self, transform: GeoTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_crs(mut self, crs: Crs) -> Self {
        self.crs = Some(crs);
        self
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// First band.
    pub fn data(&self) -> &[f64] {
        &self.bands[0]
    }

    /// Get value at (row, col) of the first band, NaN if out of bounds.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.get_band(0, row, col)
    }

    #[inline]
    pub fn get_band(&self, band: usize, row: usize, col: usize) -> f64 {
        if row < self.nrow && col < self.ncol && band < self.bands.len() {
            self.bands[band][row * self.ncol + col]
        } else {
            f64::NAN
        }
    }

    /// Set value at (row, col) of the first band.
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        if row < self.nrow && col < self.ncol {
            self.bands[0][row * self.ncol + col] = val;
        }
    }

    /// True if `v` is the no-data sentinel. A NaN sentinel matches NaN cells.
    #[inline]
    pub fn is_nodata(&self, v: f64) -> bool {
        is_nodata_value(self.nodata, v)
    }

    /// Convert map X,Y to (row, col); `None` outside the grid.
    pub fn xy_to_rc(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.transform.invert(x, y);
        if !(col.is_finite() && row.is_finite()) || col < 0.0 || row < 0.0 {
            return None;
        }
        let (col, row) = (col.floor() as usize, row.floor() as usize);
        (row < self.nrow && col < self.ncol).then_some((row, col))
    }

    /// Convert (row, col) to map X,Y (cell centre).
    pub fn rc_to_xy(&self, row: usize, col: usize) -> (f64, f64) {
        self.transform.pixel_center(col, row)
    }

    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.ncol, self.nrow)
    }

    /// Pixel window covering `bounds`, clamped to the grid.
    pub fn window(&self, bounds: &Bounds) -> Window {
        self.transform.window(bounds, self.ncol, self.nrow)
    }

    /// Copy of the cells inside `window`, georeferenced in place.
    pub fn crop(&self, window: Window) -> Raster {
        let (h, w) = (window.height(), window.width());
        let bands = self
            .bands
            .iter()
            .map(|band| {
                (window.row0..window.row0 + h)
                    .flat_map(|r| band[r * self.ncol + window.col0..r * self.ncol + window.col0 + w].iter().copied())
                    .collect()
            })
            .collect();
        Raster {
            nrow: h,
            ncol: w,
            bands,
            transform: self.transform.offset(window.col0, window.row0),
            crs: self.crs,
            nodata: self.nodata,
        }
    }

    /// Number of cells per band.
    pub fn len(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pixel_roundtrip() {
        let gt = GeoTransform::new(100.0, 200.0, 10.0, -10.0);
        let (x, y) = gt.pixel_center(5, 10);
        let (col, row) = gt.invert(x, y);
        assert_relative_eq!(col, 5.5, epsilon = 1e-10);
        assert_relative_eq!(row, 10.5, epsilon = 1e-10);
    }

    #[test]
    fn test_bounds_from_origin() {
        let r = Raster::new(10, 10, 0.0).with_transform(GeoTransform::from_origin(0.0, 0.0, 1.0, 1.0));
        let b = r.bounds();
        assert_eq!(b, Bounds::new(0.0, -10.0, 10.0, 0.0));
    }

    #[test]
    fn test_disjoint_touching_is_not_disjoint() {
        let a = Bounds::new(0.0, 0.0, 1.0, 1.0);
        assert!(!a.disjoint(&Bounds::new(1.0, 0.0, 2.0, 1.0)));
        assert!(a.disjoint(&Bounds::new(1.5, 0.0, 2.0, 1.0)));
        assert!(a.disjoint(&Bounds::new(0.0, -3.0, 1.0, -2.0)));
    }

    #[test]
    fn test_xy_to_rc() {
        let r = Raster::new(4, 5, 0.0).with_transform(GeoTransform::from_origin(0.0, 4.0, 1.0, 1.0));
        assert_eq!(r.xy_to_rc(0.5, 3.5), Some((0, 0)));
        assert_eq!(r.xy_to_rc(4.9, 0.1), Some((3, 4)));
        assert_eq!(r.xy_to_rc(5.1, 0.1), None);
        assert_eq!(r.xy_to_rc(-0.1, 2.0), None);
    }

    #[test]
    fn test_window_clamped() {
        let r = Raster::new(10, 10, 0.0).with_transform(GeoTransform::from_origin(0.0, 10.0, 1.0, 1.0));
        let w = r.window(&Bounds::new(2.2, 7.5, 4.1, 9.0));
        assert_eq!(w, Window { row0: 1, row1: 3, col0: 2, col1: 5 });
        let w = r.window(&Bounds::new(-5.0, -5.0, 50.0, 50.0));
        assert_eq!(w, Window { row0: 0, row1: 10, col0: 0, col1: 10 });
    }

    #[test]
    fn test_nodata_matching() {
        let r = Raster::new(1, 1, 0.0).with_nodata(-9999.0);
        assert!(r.is_nodata(-9999.0));
        assert!(!r.is_nodata(0.0));
        let r = Raster::new(1, 1, 0.0).with_nodata(f64::NAN);
        assert!(r.is_nodata(f64::NAN));
    }

    #[test]
    fn test_crop_keeps_cell_positions() {
        let data: Vec<f64> = (0..20).map(|v| v as f64).collect();
        let r = Raster::from_vec(4, 5, data)
            .with_transform(GeoTransform::from_origin(100.0, 40.0, 2.0, 2.0))
            .with_nodata(-1.0);
        let w = Window { row0: 1, row1: 3, col0: 2, col1: 5 };
        let c = r.crop(w);
        assert_eq!((c.nrow, c.ncol), (2, 3));
        assert_eq!(c.data(), &[7.0, 8.0, 9.0, 12.0, 13.0, 14.0]);
        assert_eq!(c.rc_to_xy(0, 0), r.rc_to_xy(1, 2));
        assert_eq!(c.nodata, Some(-1.0));
    }
}
