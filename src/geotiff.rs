//! GeoTIFF reading and writing on top of the `tiff` crate.
//!
//! Georeferencing comes from ModelPixelScale + ModelTiepoint (or
//! ModelTransformation), the EPSG code from the GeoKey directory and the
//! no-data sentinel from the GDAL_NODATA ASCII tag.
//!
//! Large orthomosaics are read through [`WindowedGeoTiff`], which decodes
//! only the strips or tiles under a requested window.

use crate::crs::Crs;
use crate::error::{Error, Result};
use crate::raster::{Bounds, GeoTransform, Raster, Window};
use crate::storage::{Location, Store};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{Gray32Float, RGB32Float, RGBA32Float};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;
use tracing::{debug, warn};

const GT_MODEL_TYPE: u32 = 1024;
const GT_RASTER_TYPE: u32 = 1025;
const GEOGRAPHIC_TYPE: u32 = 2048;
const PROJECTED_CS_TYPE: u32 = 3072;
const USER_DEFINED: u32 = 32767;
const PLANAR_SEPARATE: u32 = 2;

pub fn read_geotiff<P: AsRef<Path>>(path: P) -> Result<Raster> {
    let file = File::open(path.as_ref())?;
    debug!("reading raster {}", path.as_ref().display());
    decode_geotiff(BufReader::new(file))
}

/// Same as [`read_geotiff`] over an in-memory buffer (remote objects).
pub fn read_geotiff_from_buffer(data: &[u8]) -> Result<Raster> {
    decode_geotiff(Cursor::new(data))
}

/// Read a GeoTIFF from disk or object storage.
pub fn load_geotiff(store: &Store, location: &Location) -> Result<Raster> {
    match location {
        Location::Local(p) => read_geotiff(p),
        Location::Remote { .. } => read_geotiff_from_buffer(&store.read_bytes(location)?),
    }
}

/// Decoder without the default buffer limits, which reject large
/// orthomosaics outright.
fn open_decoder<R: Read + Seek>(reader: R) -> Result<Decoder<R>> {
    Ok(Decoder::new(reader)?.with_limits(Limits::unlimited()))
}

fn to_f64(result: DecodingResult) -> Result<Vec<f64>> {
    Ok(match result {
        DecodingResult::F64(v) => v,
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        _ => return Err(Error::UnsupportedDataType("pixel format".into())),
    })
}

/// Size, band count and georeferencing of a GeoTIFF, read from its tags.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoTiffInfo {
    pub nrow: usize,
    pub ncol: usize,
    pub bands: usize,
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    pub nodata: Option<f64>,
}

impl GeoTiffInfo {
    fn read<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Self> {
        let (width, height) = decoder.dimensions()?;
        let (ncol, nrow) = (width as usize, height as usize);
        let transform = read_transform(decoder).unwrap_or_else(|| {
            warn!("no georeferencing tags, using identity pixel grid");
            GeoTransform::from_origin(0.0, nrow as f64, 1.0, 1.0)
        });
        let bands = tag_u32(decoder, Tag::SamplesPerPixel).unwrap_or(1).max(1) as usize;
        if bands > 1 && tag_u32(decoder, Tag::PlanarConfiguration) == Some(PLANAR_SEPARATE) {
            return Err(Error::UnsupportedDataType("band-sequential (planar) samples".into()));
        }
        Ok(Self {
            nrow,
            ncol,
            bands,
            transform,
            crs: read_epsg(decoder).map(Crs::from_epsg),
            nodata: read_nodata(decoder),
        })
    }

    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.ncol, self.nrow)
    }

    pub fn window(&self, bounds: &Bounds) -> Window {
        self.transform.window(bounds, self.ncol, self.nrow)
    }
}

fn tag_u32<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<u32> {
    decoder.find_tag(tag).ok().flatten().and_then(|v| v.into_u32().ok())
}

#[derive(Clone)]
enum TiffBytes {
    File(PathBuf),
    Memory(Arc<Vec<u8>>),
}

impl fmt::Debug for TiffBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TiffBytes::File(p) => write!(f, "File({})", p.display()),
            TiffBytes::Memory(b) => write!(f, "Memory({} bytes)", b.len()),
        }
    }
}

/// A GeoTIFF opened for windowed reads. Only the header is decoded up
/// front; [`WindowedGeoTiff::read_window`] decodes the chunks it needs.
#[derive(Debug, Clone)]
pub struct WindowedGeoTiff {
    bytes: TiffBytes,
    info: GeoTiffInfo,
}

impl WindowedGeoTiff {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let info = GeoTiffInfo::read(&mut open_decoder(BufReader::new(File::open(&path)?))?)?;
        debug!("opened raster {} ({}x{}, {} band(s))", path.display(), info.ncol, info.nrow, info.bands);
        Ok(Self {
            bytes: TiffBytes::File(path),
            info,
        })
    }

    pub fn from_buffer(data: Vec<u8>) -> Result<Self> {
        let data = Arc::new(data);
        let info = GeoTiffInfo::read(&mut open_decoder(Cursor::new(data.as_slice()))?)?;
        Ok(Self {
            bytes: TiffBytes::Memory(data),
            info,
        })
    }

    /// Remote objects are fetched once and decoded from memory.
    pub fn load(store: &Store, location: &Location) -> Result<Self> {
        match location {
            Location::Local(p) => Self::open(p),
            Location::Remote { .. } => Self::from_buffer(store.read_bytes(location)?),
        }
    }

    pub fn info(&self) -> &GeoTiffInfo {
        &self.info
    }

    /// Cells inside `window` (clamped to the image), georeferenced in place.
    pub fn read_window(&self, window: Window) -> Result<Raster> {
        let window = Window {
            row0: window.row0.min(self.info.nrow),
            row1: window.row1.min(self.info.nrow),
            col0: window.col0.min(self.info.ncol),
            col1: window.col1.min(self.info.ncol),
        };
        let bands = match &self.bytes {
            TiffBytes::File(p) => read_chunks(open_decoder(BufReader::new(File::open(p)?))?, &self.info, window)?,
            TiffBytes::Memory(b) => read_chunks(open_decoder(Cursor::new(b.as_slice()))?, &self.info, window)?,
        };
        let mut raster = Raster::from_bands(window.height(), window.width(), bands)
            .with_transform(self.info.transform.offset(window.col0, window.row0));
        raster.crs = self.info.crs;
        raster.nodata = self.info.nodata;
        Ok(raster)
    }
}

/// Copy the part of every strip or tile overlapping `window` into
/// per-band buffers.
fn read_chunks<R: Read + Seek>(mut decoder: Decoder<R>, info: &GeoTiffInfo, window: Window) -> Result<Vec<Vec<f64>>> {
    let (h, w) = (window.height(), window.width());
    let nb = info.bands;
    let mut bands = vec![vec![f64::NAN; h * w]; nb];
    if window.is_empty() {
        return Ok(bands);
    }
    let (chunk_w, chunk_h) = decoder.chunk_dimensions();
    let (cw, ch) = ((chunk_w as usize).max(1), (chunk_h as usize).max(1));
    let across = info.ncol.div_ceil(cw);

    let mut decoded = 0;
    for cr in window.row0 / ch..=(window.row1 - 1) / ch {
        for cc in window.col0 / cw..=(window.col1 - 1) / cw {
            let index = (cr * across + cc) as u32;
            let (dw, dh) = decoder.chunk_data_dimensions(index);
            let (dw, dh) = (dw as usize, dh as usize);
            let data = to_f64(decoder.read_chunk(index)?)?;
            if data.len() < dw * dh * nb {
                return Err(Error::SizeMismatch {
                    er: dh,
                    ec: dw * nb,
                    ar: data.len(),
                    ac: 1,
                });
            }
            let (r0, c0) = (cr * ch, cc * cw);
            for r in r0.max(window.row0)..(r0 + dh).min(window.row1) {
                for c in c0.max(window.col0)..(c0 + dw).min(window.col1) {
                    let px = ((r - r0) * dw + (c - c0)) * nb;
                    let at = (r - window.row0) * w + (c - window.col0);
                    for (b, band) in bands.iter_mut().enumerate() {
                        band[at] = data[px + b];
                    }
                }
            }
            decoded += 1;
        }
    }
    debug!("window {:?}: {} chunk(s) decoded", window, decoded);
    Ok(bands)
}

fn decode_geotiff<R: Read + Seek>(reader: R) -> Result<Raster> {
    let mut decoder = open_decoder(reader)?;
    let info = GeoTiffInfo::read(&mut decoder)?;
    let (nrow, ncol) = (info.nrow, info.ncol);
    let raw = to_f64(decoder.read_image()?)?;

    let total = nrow * ncol;
    if total == 0 || raw.len() % total != 0 {
        return Err(Error::SizeMismatch {
            er: nrow,
            ec: ncol,
            ar: raw.len(),
            ac: 1,
        });
    }
    // Chunky (pixel-interleaved) samples.
    let n_bands = raw.len() / total;
    let bands: Vec<Vec<f64>> = if n_bands == 1 {
        vec![raw]
    } else {
        (0..n_bands)
            .map(|b| (0..total).map(|px| raw[px * n_bands + b]).collect())
            .collect()
    };

    let mut raster = Raster::from_bands(nrow, ncol, bands).with_transform(info.transform);
    raster.crs = info.crs;
    raster.nodata = info.nodata;
    debug!(
        "raster {}x{} with {} band(s), crs={:?}, nodata={:?}",
        ncol, nrow, n_bands, raster.crs, raster.nodata
    );
    Ok(raster)
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(Some(v)) = decoder.find_tag(Tag::ModelTransformationTag) {
        if let Ok(m) = v.into_f64_vec() {
            if m.len() >= 8 {
                return Some(GeoTransform {
                    origin_x: m[3],
                    pixel_width: m[0],
                    row_rotation: m[1],
                    origin_y: m[7],
                    col_rotation: m[4],
                    pixel_height: m[5],
                });
            }
        }
    }

    let scale = decoder
        .find_tag(Tag::ModelPixelScaleTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())?;
    let tie = decoder
        .find_tag(Tag::ModelTiepointTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())?;
    if scale.len() < 2 || tie.len() < 6 {
        return None;
    }
    // tiepoint: [I, J, K, X, Y, Z]
    Some(GeoTransform::new(
        tie[3] - tie[0] * scale[0],
        tie[4] + tie[1] * scale[1],
        scale[0],
        -scale[1],
    ))
}

fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<u32> {
    let keys = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_u32_vec().ok())?;
    if keys.len() < 4 {
        return None;
    }
    let n = keys[3] as usize;
    let entries: Vec<&[u32]> = keys[4..].chunks(4).take(n).filter(|e| e.len() == 4).collect();
    let lookup = |id: u32| {
        entries
            .iter()
            .find(|e| e[0] == id && e[1] == 0)
            .map(|e| e[3])
            .filter(|&code| code != 0 && code != USER_DEFINED)
    };
    lookup(PROJECTED_CS_TYPE).or_else(|| lookup(GEOGRAPHIC_TYPE))
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder
        .find_tag(Tag::GdalNodata)
        .ok()
        .flatten()
        .and_then(|v| v.into_string().ok())?;
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .parse::<f64>()
        .ok()
}

/// Write a raster as float32 GeoTIFF. Supports 1, 3 and 4 bands.
pub fn write_geotiff<P: AsRef<Path>>(raster: &Raster, path: P) -> Result<()> {
    let file = File::create(path.as_ref())?;
    debug!("writing raster {}", path.as_ref().display());
    encode_geotiff(raster, BufWriter::new(file))
}

pub fn write_geotiff_to_buffer(raster: &Raster) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_geotiff(raster, Cursor::new(&mut buf))?;
    Ok(buf)
}

/// Write a GeoTIFF to disk or object storage.
pub fn save_geotiff(store: &Store, raster: &Raster, location: &Location) -> Result<()> {
    store.write_bytes(location, &write_geotiff_to_buffer(raster)?)
}

fn encode_geotiff<W: Write + Seek>(raster: &Raster, writer: W) -> Result<()> {
    let mut encoder = TiffEncoder::new(writer)?;
    let (w, h) = (raster.ncol as u32, raster.nrow as u32);
    let n_bands = raster.band_count();

    let mut data: Vec<f32> = Vec::with_capacity(raster.len() * n_bands);
    for px in 0..raster.len() {
        for band in &raster.bands {
            data.push(band[px] as f32);
        }
    }

    macro_rules! write_image {
        ($color:ty) => {{
            let mut image = encoder.new_image::<$color>(w, h)?;
            write_geo_tags(image.encoder(), raster)?;
            image.write_data(&data)?;
        }};
    }
    match n_bands {
        1 => write_image!(Gray32Float),
        3 => write_image!(RGB32Float),
        4 => write_image!(RGBA32Float),
        n => {
            return Err(Error::UnsupportedDataType(format!(
                "{n} bands (writer supports 1, 3 or 4)"
            )))
        }
    }
    Ok(())
}

/// GeoKey values are SHORTs; larger EPSG codes cannot be stored.
fn geokey_code(crs: Crs) -> Result<u16> {
    u16::try_from(crs.epsg()).map_err(|_| Error::UnsupportedCrs(format!("EPSG:{} does not fit a GeoKey", crs.epsg())))
}

fn write_geo_tags<W: Write + Seek, K: tiff::encoder::TiffKind>(
    dir: &mut tiff::encoder::DirectoryEncoder<'_, W, K>,
    raster: &Raster,
) -> Result<()> {
    let gt = raster.transform;
    if gt.row_rotation == 0.0 && gt.col_rotation == 0.0 {
        let scale = [gt.pixel_width, -gt.pixel_height, 0.0];
        dir.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
        let tiepoint = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
        dir.write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    } else {
        let m = [
            gt.pixel_width, gt.row_rotation, 0.0, gt.origin_x,
            gt.col_rotation, gt.pixel_height, 0.0, gt.origin_y,
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        dir.write_tag(Tag::ModelTransformationTag, &m[..])?;
    }

    let mut keys: Vec<u16> = vec![1, 1, 0, 0];
    let mut push = |id: u32, value: u16| {
        keys.extend_from_slice(&[id as u16, 0, 1, value]);
    };
    match raster.crs {
        Some(crs) => {
            let code = geokey_code(crs)?;
            if crs.is_geographic() {
                push(GT_MODEL_TYPE, 2);
                push(GT_RASTER_TYPE, 1);
                push(GEOGRAPHIC_TYPE, code);
            } else {
                push(GT_MODEL_TYPE, 1);
                push(GT_RASTER_TYPE, 1);
                push(PROJECTED_CS_TYPE, code);
            }
        }
        None => {
            push(GT_MODEL_TYPE, 1);
            push(GT_RASTER_TYPE, 1);
        }
    }
    keys[3] = ((keys.len() - 4) / 4) as u16;
    dir.write_tag(Tag::GeoKeyDirectoryTag, &keys[..])?;

    if let Some(nd) = raster.nodata {
        let text = if nd.is_nan() { "nan".to_string() } else { format!("{nd}") };
        dir.write_tag(Tag::GdalNodata, text.as_str())?;
    }
    Ok(())
}
