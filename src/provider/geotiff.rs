//! GeoTIFF raster provider.
//!
//! Reads and writes GeoTIFF files with pure Rust (no GDAL dependency):
//! the `tiff` crate does the codec work, GeoTIFF georeferencing rides in
//! ModelPixelScale/ModelTiepoint and a GeoKey directory, the nodata
//! sentinel in the GDAL_NODATA tag and band statistics in GDAL_METADATA.
//!
//! The writer accumulates blocks in memory and encodes once on `finish`:
//! the TIFF layout wants complete strips up front, so nothing exists on
//! disk until the mosaic ran to completion and an aborted run leaves no
//! file behind. A size guard refuses outputs too large for this strategy.

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{Gray16, Gray32, Gray32Float, Gray64Float, Gray8};
use tiff::encoder::compression::{Deflate, DeflateLevel, Lzw};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;
use tracing::{debug, warn};

use crate::casting;
use crate::error::MosaicError;
use crate::grid::{BlockRect, GeoTransform, GridSpec, PixelType};
use crate::provider::{BlockReader, BlockWriter, ImageInfo, RasterProvider, ViewSpec};
use crate::reproject::ReprojectingReader;

// GeoTIFF tag IDs (not in the standard tiff crate)
const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
const GEOTIFF_MODELTIEPOINT: u16 = 33922;
const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;
const GEOTIFF_GEOASCIIPARAMS: u16 = 34737;
const GDAL_METADATA: u16 = 42112;
const GDAL_NODATA: u16 = 42113;

// GeoKey IDs
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

// GeoKey values
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const KEY_VALUE_UNDEFINED: u64 = 32767;

/// Refuse buffered outputs beyond this many samples (2 GB of f32).
const MAX_OUTPUT_SAMPLES: usize = 512_000_000;

/// Raster provider backed by GeoTIFF files on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeoTiffProvider;

impl GeoTiffProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RasterProvider for GeoTiffProvider {
    fn probe(&self, path: &Path) -> Result<ImageInfo, MosaicError> {
        let file = File::open(path).map_err(|e| MosaicError::probe(path, e))?;
        let mut decoder =
            Decoder::new(BufReader::new(file)).map_err(|e| MosaicError::probe(path, e))?;
        probe_decoder(&mut decoder, path)
    }

    fn open_read(
        &self,
        path: &Path,
        view: Option<&ViewSpec>,
    ) -> Result<Box<dyn BlockReader>, MosaicError> {
        let info = self.probe(path)?;
        let native = Box::new(GeoTiffReader {
            path: path.to_path_buf(),
            grid: info.grid,
            bands: info.bands,
            decoded: None,
        });
        match view {
            None => Ok(native),
            Some(spec) => Ok(Box::new(ReprojectingReader::new(
                native,
                spec.grid.clone(),
                spec.resampling,
            )?)),
        }
    }

    fn create_output(
        &self,
        path: &Path,
        grid: &GridSpec,
        bands: usize,
        driver: &str,
        creation_options: &[String],
    ) -> Result<Box<dyn BlockWriter>, MosaicError> {
        if driver != "GTiff" {
            return Err(MosaicError::Usage(format!(
                "driver {driver} is not supported (only GTiff)"
            )));
        }
        if !grid.transform.is_north_up() {
            return Err(MosaicError::write(
                path,
                "rotated geotransforms cannot be written to GeoTIFF",
            ));
        }
        let total_samples = grid
            .width
            .checked_mul(grid.height)
            .and_then(|p| p.checked_mul(bands))
            .ok_or_else(|| MosaicError::write(path, "output dimensions overflow"))?;
        if total_samples > MAX_OUTPUT_SAMPLES {
            return Err(MosaicError::write(
                path,
                format!("output of {total_samples} samples exceeds the buffered-write limit"),
            ));
        }

        let compression = parse_creation_options(creation_options)?;
        let fill = grid.nodata.unwrap_or(0.0) as f32;
        Ok(Box::new(GeoTiffBlockWriter {
            path: path.to_path_buf(),
            grid: grid.clone(),
            bands,
            compression,
            pixels: vec![vec![fill; grid.width * grid.height]; bands],
            statistics: vec![None; bands],
        }))
    }
}

/// Extract metadata from an open TIFF decoder.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn probe_decoder<R: std::io::Read + Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
) -> Result<ImageInfo, MosaicError> {
    let (width32, height32) = decoder.dimensions().map_err(|e| MosaicError::probe(path, e))?;
    let width = width32 as usize;
    let height = height32 as usize;

    let bands = tag_u64(decoder, Tag::SamplesPerPixel).unwrap_or(1) as usize;
    let bits = tag_u64_vec(decoder, Tag::BitsPerSample)
        .and_then(|v| v.first().copied())
        .unwrap_or(8);
    let sample_format = tag_u64_vec(decoder, Tag::SampleFormat)
        .and_then(|v| v.first().copied())
        .unwrap_or(1);

    let dtype = match (sample_format, bits) {
        (1, 8) => PixelType::U8,
        (1, 16) => PixelType::U16,
        (1, 32) => PixelType::U32,
        (2, 16) => PixelType::I16,
        (2, 32) => PixelType::I32,
        (3, 32) => PixelType::F32,
        (3, 64) => PixelType::F64,
        (fmt, b) => {
            return Err(MosaicError::probe(
                path,
                format!("unsupported sample type (format {fmt}, {b} bits)"),
            ))
        }
    };

    let pixel_scale = tag_f64_vec(decoder, Tag::Unknown(GEOTIFF_MODELPIXELSCALE));
    let tiepoint = tag_f64_vec(decoder, Tag::Unknown(GEOTIFF_MODELTIEPOINT));
    let transform = match (pixel_scale, tiepoint) {
        (Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => {
            // Tiepoint maps pixel (i, j) to world (x, y)
            let origin_x = tie[3] - tie[0] * scale[0];
            let origin_y = tie[4] + tie[1] * scale[1];
            GeoTransform::north_up(origin_x, origin_y, scale[0], scale[1])
        }
        _ => {
            warn!(path = %path.display(), "No geotransform; using pixel coordinates");
            GeoTransform::north_up(0.0, height as f64, 1.0, 1.0)
        }
    };

    let epsg = parse_geokey_epsg(tag_u64_vec(decoder, Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY)));
    let nodata = tag_string(decoder, Tag::Unknown(GDAL_NODATA)).and_then(|s| {
        let trimmed = s.trim_matches(char::from(0)).trim().to_string();
        trimmed.parse::<f64>().ok()
    });

    let block_size = match (
        tag_u64(decoder, Tag::TileWidth),
        tag_u64(decoder, Tag::TileLength),
    ) {
        (Some(tw), Some(th)) => (tw as usize, th as usize),
        _ => {
            let rows = tag_u64(decoder, Tag::RowsPerStrip).unwrap_or(height32 as u64) as usize;
            (width, rows.min(height))
        }
    };

    Ok(ImageInfo {
        path: path.to_path_buf(),
        grid: GridSpec {
            epsg,
            transform,
            width,
            height,
            dtype,
            nodata,
        },
        bands,
        block_size,
    })
}

fn tag_u64<R: std::io::Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<u64> {
    decoder.find_tag(tag).ok().flatten().and_then(|v| v.into_u64().ok())
}

fn tag_u64_vec<R: std::io::Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<Vec<u64>> {
    decoder.find_tag(tag).ok().flatten().and_then(|v| v.into_u64_vec().ok())
}

fn tag_f64_vec<R: std::io::Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<Vec<f64>> {
    decoder.find_tag(tag).ok().flatten().and_then(|v| v.into_f64_vec().ok())
}

fn tag_string<R: std::io::Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<String> {
    decoder.find_tag(tag).ok().flatten().and_then(|v| v.into_string().ok())
}

/// Pull the CRS code out of a GeoKey directory: the projected CS key when
/// present, otherwise the geographic type key.
#[allow(clippy::cast_possible_truncation)]
fn parse_geokey_epsg(geokeys: Option<Vec<u64>>) -> u32 {
    let Some(keys) = geokeys else {
        return 0;
    };
    let mut geographic = 0_u32;
    let mut projected = 0_u32;
    // Entries of four shorts follow the directory header
    for entry in keys[4.min(keys.len())..].chunks_exact(4) {
        let (key_id, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 || value == KEY_VALUE_UNDEFINED {
            continue;
        }
        match key_id {
            k if k == u64::from(GEOGRAPHIC_TYPE_GEO_KEY) => geographic = value as u32,
            k if k == u64::from(PROJECTED_CS_TYPE_GEO_KEY) => projected = value as u32,
            _ => {}
        }
    }
    if projected != 0 {
        projected
    } else {
        geographic
    }
}

/// Convert any decoded sample buffer to `f32`.
#[allow(clippy::cast_precision_loss)]
fn decoding_to_f32(result: DecodingResult, path: &Path) -> Result<Vec<f32>, MosaicError> {
    match result {
        DecodingResult::U8(v) => Ok(v.into_iter().map(f32::from).collect()),
        DecodingResult::U16(v) => Ok(v.into_iter().map(f32::from).collect()),
        DecodingResult::U32(v) => Ok(v.into_iter().map(|s| s as f32).collect()),
        DecodingResult::U64(v) => Ok(v.into_iter().map(|s| s as f32).collect()),
        DecodingResult::I8(v) => Ok(v.into_iter().map(f32::from).collect()),
        DecodingResult::I16(v) => Ok(v.into_iter().map(f32::from).collect()),
        DecodingResult::I32(v) => Ok(v.into_iter().map(|s| s as f32).collect()),
        DecodingResult::I64(v) => Ok(v.into_iter().map(|s| s as f32).collect()),
        DecodingResult::F32(v) => Ok(v),
        DecodingResult::F64(v) => Ok(v.into_iter().map(|s| s as f32).collect()),
        _ => Err(MosaicError::read(path, "unsupported decoded sample type")),
    }
}

/// Block reader for one GeoTIFF file.
///
/// The full image is decoded on first use and windows are served from
/// memory; the worker-side handle LRU bounds how many decoded inputs a
/// thread keeps alive.
struct GeoTiffReader {
    path: PathBuf,
    grid: GridSpec,
    bands: usize,
    /// Planar per-band pixels, decoded lazily.
    decoded: Option<Arc<Vec<Vec<f32>>>>,
}

impl GeoTiffReader {
    fn ensure_decoded(&mut self) -> Result<&[Vec<f32>], MosaicError> {
        if self.decoded.is_none() {
            let file = File::open(&self.path).map_err(|e| MosaicError::read(&self.path, e))?;
            let mut decoder = Decoder::new(BufReader::new(file))
                .map_err(|e| MosaicError::read(&self.path, e))?;
            let result = decoder
                .read_image()
                .map_err(|e| MosaicError::read(&self.path, e))?;
            let interleaved = decoding_to_f32(result, &self.path)?;

            let pixel_count = self.grid.width * self.grid.height;
            if interleaved.len() != pixel_count * self.bands {
                return Err(MosaicError::read(
                    &self.path,
                    format!(
                        "decoded {} samples, expected {}",
                        interleaved.len(),
                        pixel_count * self.bands
                    ),
                ));
            }

            // Deinterleave chunky sample order into planar bands
            let mut planar = vec![Vec::with_capacity(pixel_count); self.bands];
            if self.bands == 1 {
                planar[0] = interleaved;
            } else {
                for (i, v) in interleaved.into_iter().enumerate() {
                    planar[i % self.bands].push(v);
                }
            }
            debug!(path = %self.path.display(), "Decoded input raster");
            self.decoded = Some(Arc::new(planar));
        }
        Ok(self.decoded.as_ref().expect("just decoded"))
    }
}

impl BlockReader for GeoTiffReader {
    #[allow(clippy::cast_sign_loss)]
    fn read_block(&mut self, band: usize, rect: &BlockRect) -> Result<Vec<f32>, MosaicError> {
        if band >= self.bands {
            return Err(MosaicError::read(&self.path, format!("no band {band}")));
        }
        if rect.x0 < 0
            || rect.y0 < 0
            || rect.x1() > self.grid.width as i64
            || rect.y1() > self.grid.height as i64
        {
            return Err(MosaicError::read(
                &self.path,
                format!("rect {rect:?} outside {}x{}", self.grid.width, self.grid.height),
            ));
        }

        let width = self.grid.width;
        let planar = self.ensure_decoded()?;
        let data = &planar[band];
        let mut out = Vec::with_capacity(rect.len());
        for row in 0..rect.h {
            let src_row = (rect.y0 as usize + row) * width + rect.x0 as usize;
            out.extend_from_slice(&data[src_row..src_row + rect.w]);
        }
        Ok(out)
    }

    fn grid(&self) -> &GridSpec {
        &self.grid
    }
}

/// Compression for the output file, from creation options.
#[derive(Debug, Clone, Copy, Default)]
enum OutputCompression {
    #[default]
    Deflate,
    Lzw,
    None,
}

fn parse_creation_options(options: &[String]) -> Result<OutputCompression, MosaicError> {
    let mut compression = OutputCompression::default();
    for option in options {
        let Some((name, value)) = option.split_once('=') else {
            return Err(MosaicError::Usage(format!(
                "creation option '{option}' is not NAME=VALUE"
            )));
        };
        match name.to_ascii_uppercase().as_str() {
            "COMPRESS" => {
                compression = match value.to_ascii_uppercase().as_str() {
                    "DEFLATE" => OutputCompression::Deflate,
                    "LZW" => OutputCompression::Lzw,
                    "NONE" => OutputCompression::None,
                    other => {
                        return Err(MosaicError::Usage(format!(
                            "unsupported COMPRESS value '{other}'"
                        )))
                    }
                };
            }
            other => {
                debug!(option = other, "Ignoring creation option");
            }
        }
    }
    Ok(compression)
}

/// Buffered block writer that encodes the GeoTIFF on `finish`.
struct GeoTiffBlockWriter {
    path: PathBuf,
    grid: GridSpec,
    bands: usize,
    compression: OutputCompression,
    /// Planar per-band output pixels.
    pixels: Vec<Vec<f32>>,
    statistics: Vec<Option<(f64, f64, f64, f64)>>,
}

impl BlockWriter for GeoTiffBlockWriter {
    #[allow(clippy::cast_sign_loss)]
    fn write_block(
        &mut self,
        band: usize,
        rect: &BlockRect,
        pixels: &[f32],
    ) -> Result<(), MosaicError> {
        if pixels.len() != rect.len() {
            return Err(MosaicError::Invariant(format!(
                "block buffer {} does not match rect {rect:?}",
                pixels.len()
            )));
        }
        let width = self.grid.width;
        let band_pixels = &mut self.pixels[band];
        for row in 0..rect.h {
            let dst_row = (rect.y0 as usize + row) * width + rect.x0 as usize;
            band_pixels[dst_row..dst_row + rect.w]
                .copy_from_slice(&pixels[row * rect.w..(row + 1) * rect.w]);
        }
        Ok(())
    }

    fn set_statistics(&mut self, band: usize, min: f64, max: f64, mean: f64, stddev: f64) {
        self.statistics[band] = Some((min, max, mean, stddev));
    }

    fn finish(self: Box<Self>) -> Result<(), MosaicError> {
        let path = self.path.clone();
        if let Err(e) = self.encode() {
            std::fs::remove_file(&path).ok();
            return Err(e);
        }
        Ok(())
    }

    fn discard(self: Box<Self>) {
        // Nothing hits the disk before finish(); remove just in case a
        // previous run left the path behind.
        std::fs::remove_file(&self.path).ok();
    }
}

impl GeoTiffBlockWriter {
    fn encode(&self) -> Result<(), MosaicError> {
        let file = File::create(&self.path).map_err(|e| MosaicError::write(&self.path, e))?;
        let writer = BufWriter::new(file);

        let encoder = TiffEncoder::new(writer).map_err(|e| MosaicError::write(&self.path, e))?;

        self.write_image(encoder)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_image<W: Write + Seek>(&self, mut encoder: TiffEncoder<W>) -> Result<(), MosaicError> {
        let width = casting::usize_to_u32(self.grid.width).map_err(|e| MosaicError::write(&self.path, e))?;
        let height =
            casting::usize_to_u32(self.grid.height).map_err(|e| MosaicError::write(&self.path, e))?;

        // Single-band outputs of common datatypes use the typed encoder;
        // everything else goes through the raw directory encoder.
        //
        // The typed encoder bakes the compression algorithm into the image's
        // type parameter, so the runtime `self.compression` choice is
        // dispatched here into the matching `new_image_with_compression`
        // generic instantiation.
        macro_rules! write_typed_image {
            ($colortype:ty, $samples:expr) => {{
                match self.compression {
                    OutputCompression::None => {
                        let mut image = encoder
                            .new_image::<$colortype>(width, height)
                            .map_err(|e| MosaicError::write(&self.path, e))?;
                        self.write_geo_tags(image.encoder())?;
                        image
                            .write_data($samples)
                            .map_err(|e| MosaicError::write(&self.path, e))?;
                    }
                    OutputCompression::Lzw => {
                        let mut image = encoder
                            .new_image_with_compression::<$colortype, Lzw>(width, height, Lzw)
                            .map_err(|e| MosaicError::write(&self.path, e))?;
                        self.write_geo_tags(image.encoder())?;
                        image
                            .write_data($samples)
                            .map_err(|e| MosaicError::write(&self.path, e))?;
                    }
                    OutputCompression::Deflate => {
                        let mut image = encoder
                            .new_image_with_compression::<$colortype, Deflate>(
                                width,
                                height,
                                Deflate::with_level(DeflateLevel::Fast),
                            )
                            .map_err(|e| MosaicError::write(&self.path, e))?;
                        self.write_geo_tags(image.encoder())?;
                        image
                            .write_data($samples)
                            .map_err(|e| MosaicError::write(&self.path, e))?;
                    }
                }
                return Ok(());
            }};
        }

        if self.bands == 1 {
            let data = &self.pixels[0];
            match self.grid.dtype {
                PixelType::U8 => write_typed_image!(Gray8, &casting::f32s_to_u8(data)),
                PixelType::U16 => write_typed_image!(Gray16, &casting::f32s_to_u16(data)),
                PixelType::U32 => write_typed_image!(Gray32, &casting::f32s_to_u32(data)),
                PixelType::F32 => write_typed_image!(Gray32Float, data),
                PixelType::F64 => write_typed_image!(Gray64Float, &casting::f32s_to_f64(data)),
                PixelType::I16 | PixelType::I32 => {}
            }
        }

        self.write_raw_image(&mut encoder, width, height)
    }

    /// Write via the low-level directory encoder: signed integer types and
    /// arbitrary band counts (interleaved, one strip).
    fn write_raw_image<W: Write + Seek>(
        &self,
        encoder: &mut TiffEncoder<W>,
        width: u32,
        height: u32,
    ) -> Result<(), MosaicError> {
        let mut dir = encoder
            .new_directory()
            .map_err(|e| MosaicError::write(&self.path, e))?;

        let wr = |e: tiff::TiffError| MosaicError::write(&self.path, e);

        dir.write_tag(Tag::ImageWidth, width).map_err(wr)?;
        dir.write_tag(Tag::ImageLength, height).map_err(wr)?;

        let bits_per_sample: Vec<u16> = vec![self.grid.dtype.bits(); self.bands];
        dir.write_tag(Tag::BitsPerSample, bits_per_sample.as_slice())
            .map_err(wr)?;

        let compression_tag: u16 = match self.compression {
            OutputCompression::None => 1,
            OutputCompression::Lzw => 5,
            OutputCompression::Deflate => 8,
        };
        dir.write_tag(Tag::Compression, compression_tag).map_err(wr)?;

        dir.write_tag(Tag::PhotometricInterpretation, 1_u16).map_err(wr)?;
        dir.write_tag(Tag::SamplesPerPixel, self.bands as u16).map_err(wr)?;

        let sample_format: Vec<u16> = vec![self.grid.dtype.sample_format(); self.bands];
        dir.write_tag(Tag::SampleFormat, sample_format.as_slice())
            .map_err(wr)?;

        dir.write_tag(Tag::PlanarConfiguration, 1_u16).map_err(wr)?;
        dir.write_tag(Tag::RowsPerStrip, height).map_err(wr)?;

        if self.bands > 1 {
            let extra_samples: Vec<u16> = vec![0; self.bands - 1];
            dir.write_tag(Tag::ExtraSamples, extra_samples.as_slice())
                .map_err(wr)?;
        }

        self.write_geo_tags(&mut dir)?;

        // Interleave planar bands into chunky sample order, then to bytes
        let pixel_count = self.grid.width * self.grid.height;
        let mut interleaved = Vec::with_capacity(pixel_count * self.bands);
        for i in 0..pixel_count {
            for band in &self.pixels {
                interleaved.push(band[i]);
            }
        }
        let pixel_bytes = self.compress_strip(samples_to_bytes(self.grid.dtype, &interleaved))?;

        let strip_offset = dir.write_data(pixel_bytes.as_slice()).map_err(wr)?;
        dir.write_tag(Tag::StripOffsets, strip_offset).map_err(wr)?;
        dir.write_tag(Tag::StripByteCounts, pixel_bytes.len() as u32)
            .map_err(wr)?;

        dir.finish().map_err(wr)?;
        Ok(())
    }

    /// Compress one strip's bytes according to the configured method.
    ///
    /// The raw directory path writes strip data itself, so the codec work
    /// the typed encoder would do happens here: zlib-wrapped deflate for
    /// COMPRESS=DEFLATE and TIFF-variant LZW (MSB-first with the early
    /// size switch) for COMPRESS=LZW.
    fn compress_strip(&self, raw: Vec<u8>) -> Result<Vec<u8>, MosaicError> {
        match self.compression {
            OutputCompression::None => Ok(raw),
            OutputCompression::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
                encoder
                    .write_all(&raw)
                    .and_then(|()| encoder.finish())
                    .map_err(|e| MosaicError::write(&self.path, e))
            }
            OutputCompression::Lzw => {
                let mut encoder =
                    weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8);
                encoder
                    .encode(&raw)
                    .map_err(|e| MosaicError::write(&self.path, e))
            }
        }
    }

    fn write_geo_tags<W: Write + Seek, K: tiff::encoder::TiffKind>(
        &self,
        dir: &mut tiff::encoder::DirectoryEncoder<W, K>,
    ) -> Result<(), MosaicError> {
        let wr = |e: tiff::TiffError| MosaicError::write(&self.path, e);
        let c = &self.grid.transform.0;

        // ModelPixelScale: [ScaleX, ScaleY, ScaleZ]
        let pixel_scale = [c[1].abs(), c[5].abs(), 0.0];
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), pixel_scale.as_slice())
            .map_err(wr)?;

        // ModelTiepoint: pixel (0, 0) maps to the grid origin
        let tiepoint = [0.0, 0.0, 0.0, c[0], c[3], 0.0];
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), tiepoint.as_slice())
            .map_err(wr)?;

        let geokeys = self.build_geokey_directory();
        dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), geokeys.as_slice())
            .map_err(wr)?;

        if let Some(proj_string) = crate::geometry::get_proj_string(self.grid.epsg) {
            // GeoAsciiParams wants pipe-delimited, null-terminated text
            let ascii_params = format!("{proj_string}|");
            dir.write_tag(Tag::Unknown(GEOTIFF_GEOASCIIPARAMS), ascii_params.as_bytes())
                .map_err(wr)?;
        }

        if let Some(nodata) = self.grid.nodata {
            dir.write_tag(Tag::Unknown(GDAL_NODATA), format!("{nodata}").as_bytes())
                .map_err(wr)?;
        }

        if let Some(metadata) = self.build_gdal_metadata() {
            dir.write_tag(Tag::Unknown(GDAL_METADATA), metadata.as_bytes())
                .map_err(wr)?;
        }

        Ok(())
    }

    fn build_geokey_directory(&self) -> Vec<u16> {
        // [Version, Revision, MinorRevision, NumberOfKeys, then key entries]
        let is_geographic = crate::geometry::is_geographic_crs(self.grid.epsg);

        let mut keys = vec![1, 1, 0, 3];
        keys.extend_from_slice(&[
            GT_MODEL_TYPE_GEO_KEY,
            0,
            1,
            if is_geographic {
                MODEL_TYPE_GEOGRAPHIC
            } else {
                MODEL_TYPE_PROJECTED
            },
        ]);
        keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);

        #[allow(clippy::cast_possible_truncation)]
        let epsg = self.grid.epsg as u16;
        if is_geographic {
            keys.extend_from_slice(&[GEOGRAPHIC_TYPE_GEO_KEY, 0, 1, epsg]);
        } else {
            keys.extend_from_slice(&[PROJECTED_CS_TYPE_GEO_KEY, 0, 1, epsg]);
        }
        keys
    }

    /// Band statistics as GDAL metadata items, if any were set.
    fn build_gdal_metadata(&self) -> Option<String> {
        if self.statistics.iter().all(Option::is_none) {
            return None;
        }
        let mut xml = String::from("<GDALMetadata>\n");
        for (band, stats) in self.statistics.iter().enumerate() {
            let Some((min, max, mean, stddev)) = stats else {
                continue;
            };
            let items = [
                ("STATISTICS_MINIMUM", min),
                ("STATISTICS_MAXIMUM", max),
                ("STATISTICS_MEAN", mean),
                ("STATISTICS_STDDEV", stddev),
            ];
            for (name, value) in items {
                xml.push_str(&format!(
                    "  <Item name=\"{name}\" sample=\"{band}\">{value}</Item>\n"
                ));
            }
        }
        xml.push_str("</GDALMetadata>\n");
        Some(xml)
    }
}

/// Convert composed `f32` samples to little-endian bytes of the output type.
fn samples_to_bytes(dtype: PixelType, samples: &[f32]) -> Vec<u8> {
    match dtype {
        PixelType::U8 => casting::f32s_to_u8(samples),
        PixelType::U16 => casting::f32s_to_u16(samples)
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect(),
        PixelType::I16 => casting::f32s_to_i16(samples)
            .into_iter()
            .flat_map(i16::to_le_bytes)
            .collect(),
        PixelType::U32 => casting::f32s_to_u32(samples)
            .into_iter()
            .flat_map(u32::to_le_bytes)
            .collect(),
        PixelType::I32 => casting::f32s_to_i32(samples)
            .into_iter()
            .flat_map(i32::to_le_bytes)
            .collect(),
        PixelType::F32 => samples.iter().flat_map(|v| v.to_le_bytes()).collect(),
        PixelType::F64 => samples
            .iter()
            .flat_map(|&v| f64::from(v).to_le_bytes())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_grid(dtype: PixelType, w: usize, h: usize) -> GridSpec {
        GridSpec {
            epsg: 32610,
            transform: GeoTransform::north_up(500_000.0, 4_100_000.0, 10.0, 10.0),
            width: w,
            height: h,
            dtype,
            nodata: Some(0.0),
        }
    }

    fn write_single_band(path: &Path, dtype: PixelType, pixels: Vec<f32>, w: usize, h: usize) {
        let provider = GeoTiffProvider::new();
        let grid = test_grid(dtype, w, h);
        let mut writer = provider.create_output(path, &grid, 1, "GTiff", &[]).unwrap();
        writer
            .write_block(0, &BlockRect::new(0, 0, w, h), &pixels)
            .unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_write_probe_roundtrip_u16() {
        let path = Path::new("/tmp/mosrs_test_roundtrip_u16.tif");
        let pixels: Vec<f32> = (0..64 * 32).map(|i| (i % 1000) as f32).collect();
        write_single_band(path, PixelType::U16, pixels, 64, 32);

        let provider = GeoTiffProvider::new();
        let info = provider.probe(path).unwrap();
        assert_eq!(info.grid.width, 64);
        assert_eq!(info.grid.height, 32);
        assert_eq!(info.grid.dtype, PixelType::U16);
        assert_eq!(info.grid.epsg, 32610);
        assert_eq!(info.grid.nodata, Some(0.0));
        assert_eq!(info.bands, 1);
        // Strip layout: native blocks span the full width
        assert_eq!(info.block_size.0, 64);
        assert!((info.grid.transform.0[0] - 500_000.0).abs() < 1e-6);
        assert!((info.grid.transform.0[3] - 4_100_000.0).abs() < 1e-6);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_write_read_roundtrip_pixels() {
        let path = Path::new("/tmp/mosrs_test_roundtrip_px.tif");
        let pixels: Vec<f32> = (0..16 * 16).map(|i| f32::from(i as u8)).collect();
        write_single_band(path, PixelType::U8, pixels.clone(), 16, 16);

        let provider = GeoTiffProvider::new();
        let mut reader = provider.open_read(path, None).unwrap();
        let full = reader.read_block(0, &BlockRect::new(0, 0, 16, 16)).unwrap();
        assert_eq!(full, pixels);

        // A window
        let window = reader.read_block(0, &BlockRect::new(4, 2, 3, 2)).unwrap();
        assert_eq!(window, vec![36.0, 37.0, 38.0, 52.0, 53.0, 54.0]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_write_f32_with_statistics() {
        let path = Path::new("/tmp/mosrs_test_stats.tif");
        let provider = GeoTiffProvider::new();
        let grid = test_grid(PixelType::F32, 8, 8);
        let mut writer = provider.create_output(path, &grid, 1, "GTiff", &[]).unwrap();
        writer
            .write_block(0, &BlockRect::new(0, 0, 8, 8), &vec![1.5; 64])
            .unwrap();
        writer.set_statistics(0, 1.5, 1.5, 1.5, 0.0);
        writer.finish().unwrap();

        // Statistics land in the GDAL_METADATA tag
        let file = File::open(path).unwrap();
        let mut decoder = Decoder::new(BufReader::new(file)).unwrap();
        let metadata = tag_string(&mut decoder, Tag::Unknown(GDAL_METADATA)).unwrap();
        assert!(metadata.contains("STATISTICS_MINIMUM"));
        assert!(metadata.contains("1.5"));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_multiband_raw_write() {
        let path = Path::new("/tmp/mosrs_test_multiband.tif");
        let provider = GeoTiffProvider::new();
        let grid = test_grid(PixelType::U16, 4, 4);
        let mut writer = provider.create_output(path, &grid, 3, "GTiff", &[]).unwrap();
        for band in 0..3 {
            let value = (band + 1) as f32 * 10.0;
            writer
                .write_block(band, &BlockRect::new(0, 0, 4, 4), &vec![value; 16])
                .unwrap();
        }
        writer.finish().unwrap();

        let provider = GeoTiffProvider::new();
        let info = provider.probe(path).unwrap();
        assert_eq!(info.bands, 3);

        let mut reader = provider.open_read(path, None).unwrap();
        assert_eq!(reader.read_block(0, &BlockRect::new(0, 0, 4, 4)).unwrap(), vec![10.0; 16]);
        assert_eq!(reader.read_block(2, &BlockRect::new(0, 0, 4, 4)).unwrap(), vec![30.0; 16]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_i16_raw_path_deflate_roundtrip() {
        // I16 goes through the raw directory path; the default creation
        // options deflate the strip, and the decoder must get it back
        let path = Path::new("/tmp/mosrs_test_i16_deflate.tif");
        let provider = GeoTiffProvider::new();
        let grid = test_grid(PixelType::I16, 8, 4);
        let mut writer = provider.create_output(path, &grid, 1, "GTiff", &[]).unwrap();
        let pixels: Vec<f32> = (0..32).map(|i| (i - 16) as f32).collect();
        writer
            .write_block(0, &BlockRect::new(0, 0, 8, 4), &pixels)
            .unwrap();
        writer.finish().unwrap();

        let info = provider.probe(path).unwrap();
        assert_eq!(info.grid.dtype, PixelType::I16);
        let mut reader = provider.open_read(path, None).unwrap();
        assert_eq!(reader.read_block(0, &BlockRect::new(0, 0, 8, 4)).unwrap(), pixels);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_multiband_lzw_roundtrip() {
        let path = Path::new("/tmp/mosrs_test_multiband_lzw.tif");
        let provider = GeoTiffProvider::new();
        let grid = test_grid(PixelType::U16, 6, 6);
        let mut writer = provider
            .create_output(path, &grid, 2, "GTiff", &["COMPRESS=LZW".into()])
            .unwrap();
        writer
            .write_block(0, &BlockRect::new(0, 0, 6, 6), &vec![11.0; 36])
            .unwrap();
        writer
            .write_block(1, &BlockRect::new(0, 0, 6, 6), &vec![22.0; 36])
            .unwrap();
        writer.finish().unwrap();

        let mut reader = provider.open_read(path, None).unwrap();
        assert_eq!(reader.read_block(0, &BlockRect::new(0, 0, 6, 6)).unwrap(), vec![11.0; 36]);
        assert_eq!(reader.read_block(1, &BlockRect::new(0, 0, 6, 6)).unwrap(), vec![22.0; 36]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_unknown_driver_is_usage_error() {
        let provider = GeoTiffProvider::new();
        let grid = test_grid(PixelType::U8, 4, 4);
        let result = provider.create_output(Path::new("/tmp/x.img"), &grid, 1, "HFA", &[]);
        let err = match result {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, MosaicError::Usage(_)));
    }

    #[test]
    fn test_bad_creation_option() {
        assert!(parse_creation_options(&["COMPRESS=LZW".into()]).is_ok());
        assert!(parse_creation_options(&["TILED=YES".into()]).is_ok());
        assert!(parse_creation_options(&["COMPRESS=ZSTD".into()]).is_err());
        assert!(parse_creation_options(&["NOEQUALS".into()]).is_err());
    }

    #[test]
    fn test_probe_missing_file() {
        let provider = GeoTiffProvider::new();
        let err = provider.probe(Path::new("/tmp/mosrs_no_such_file.tif")).unwrap_err();
        assert!(matches!(err, MosaicError::Probe { .. }));
    }

    #[test]
    fn test_rotated_output_refused() {
        let provider = GeoTiffProvider::new();
        let mut grid = test_grid(PixelType::U8, 4, 4);
        grid.transform = GeoTransform([0.0, 1.0, 0.1, 0.0, 0.1, -1.0]);
        let result = provider.create_output(Path::new("/tmp/rot.tif"), &grid, 1, "GTiff", &[]);
        let err = match result {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, MosaicError::Write { .. }));
    }

    #[test]
    fn test_geokey_parse() {
        // Header + model type + raster type + projected CS 32610
        let keys: Vec<u64> = vec![
            1, 1, 0, 3, //
            1024, 0, 1, 1, //
            1025, 0, 1, 1, //
            3072, 0, 1, 32610,
        ];
        assert_eq!(parse_geokey_epsg(Some(keys)), 32610);
        assert_eq!(parse_geokey_epsg(None), 0);
    }
}
