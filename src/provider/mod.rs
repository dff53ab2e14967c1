//! Raster I/O provider abstraction.
//!
//! The scheduler never touches files directly; it talks to a
//! [`RasterProvider`] that can probe metadata, open per-thread block
//! readers (optionally through a reprojection view bound to the output
//! grid) and create the output writer. Two implementations ship:
//! [`GeoTiffProvider`](geotiff::GeoTiffProvider) for GeoTIFF files on disk
//! and [`MemoryProvider`](memory::MemoryProvider) for tests and embedding.
//!
//! Reader handles are not shared between threads: every worker opens its
//! own via `open_read` and owns them privately.

pub mod geotiff;
pub mod memory;

use std::path::{Path, PathBuf};
use std::thread;

use tracing::debug;

use crate::error::MosaicError;
use crate::grid::{BlockRect, GridSpec};
use crate::reproject::ResamplingMethod;

/// Index of an input in the user-supplied list. The list order is the
/// mosaic priority order, so the index doubles as the priority rank.
pub type InputId = usize;

/// Per-input metadata gathered once during probing and shared read-only.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub path: PathBuf,
    /// The input's native pixel grid.
    pub grid: GridSpec,
    /// Number of bands.
    pub bands: usize,
    /// Native block size (tile size, or strip width/height).
    pub block_size: (usize, usize),
}

/// Request for a reprojection view: reads through the view return pixels
/// already sampled into this grid (the output grid).
#[derive(Debug, Clone)]
pub struct ViewSpec {
    pub grid: GridSpec,
    pub resampling: ResamplingMethod,
}

/// Reads rectangular blocks of one raster, decoded to `f32`.
///
/// Implementations are single-threaded values owned by one worker; the
/// scheduler never moves a reader across threads.
pub trait BlockReader {
    /// Read `rect` of the given band (0-indexed) into a row-major buffer of
    /// `rect.w * rect.h` samples. `rect` must lie inside the reader's grid;
    /// callers clamp and pad.
    fn read_block(&mut self, band: usize, rect: &BlockRect) -> Result<Vec<f32>, MosaicError>;

    /// The grid this reader serves: the native grid, or the view grid for
    /// reprojecting readers.
    fn grid(&self) -> &GridSpec;
}

/// Writes rectangular blocks of the output raster.
pub trait BlockWriter {
    /// Write `rect` of the given band. The scheduler calls this in strict
    /// row-major block order, once per block per band.
    fn write_block(&mut self, band: usize, rect: &BlockRect, pixels: &[f32])
        -> Result<(), MosaicError>;

    /// Attach single-pass statistics for a band; emitted with the output's
    /// metadata where the format supports it.
    fn set_statistics(&mut self, _band: usize, _min: f64, _max: f64, _mean: f64, _stddev: f64) {}

    /// Finalize the output. Nothing is guaranteed to exist on disk until
    /// this returns.
    fn finish(self: Box<Self>) -> Result<(), MosaicError>;

    /// Drop the output, removing any partial file.
    fn discard(self: Box<Self>);
}

/// A raster I/O backend.
pub trait RasterProvider: Sync {
    /// Probe one input's metadata. A missing or unreadable input is fatal
    /// to the job, so this returns a hard error.
    fn probe(&self, path: &Path) -> Result<ImageInfo, MosaicError>;

    /// Open a block reader for an input. With a [`ViewSpec`], the reader is
    /// a reprojecting view: rectangles are in the view grid's coordinates
    /// and pixels come back already sampled into that grid.
    fn open_read(
        &self,
        path: &Path,
        view: Option<&ViewSpec>,
    ) -> Result<Box<dyn BlockReader>, MosaicError>;

    /// Create the output raster.
    fn create_output(
        &self,
        path: &Path,
        grid: &GridSpec,
        bands: usize,
        driver: &str,
        creation_options: &[String],
    ) -> Result<Box<dyn BlockWriter>, MosaicError>;
}

/// Probe all inputs, in parallel across up to `parallelism` threads.
///
/// Opening remote files is latency-bound, so probing gets the same
/// round-robin fan-out as block reads. Results keep input-list order and
/// the map is frozen before planning begins.
///
/// # Errors
/// Fails with the first probe error encountered; the job must not reach
/// scheduling with an unreadable input.
pub fn probe_inputs(
    provider: &dyn RasterProvider,
    paths: &[PathBuf],
    parallelism: usize,
) -> Result<Vec<ImageInfo>, MosaicError> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    let nthreads = parallelism.max(1).min(paths.len());
    let per_thread = paths.len().div_ceil(nthreads);

    let mut slots: Vec<Option<Result<ImageInfo, MosaicError>>> = Vec::new();
    slots.resize_with(paths.len(), || None);

    thread::scope(|s| {
        for (chunk_index, chunk) in slots.chunks_mut(per_thread).enumerate() {
            let start = chunk_index * per_thread;
            s.spawn(move || {
                for (i, slot) in chunk.iter_mut().enumerate() {
                    *slot = Some(provider.probe(&paths[start + i]));
                }
            });
        }
    });

    let mut infos = Vec::with_capacity(paths.len());
    for (path, slot) in paths.iter().zip(slots) {
        let info = slot.expect("probe thread filled every slot")?;
        debug!(
            path = %path.display(),
            width = info.grid.width,
            height = info.grid.height,
            bands = info.bands,
            "Probed input"
        );
        infos.push(info);
    }
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GeoTransform, PixelType};
    use super::memory::MemoryProvider;

    fn small_grid(x0: f64) -> GridSpec {
        GridSpec {
            epsg: 32633,
            transform: GeoTransform::north_up(x0, 100.0, 1.0, 1.0),
            width: 4,
            height: 4,
            dtype: PixelType::U16,
            nodata: Some(0.0),
        }
    }

    #[test]
    fn test_probe_inputs_preserves_order() {
        let provider = MemoryProvider::new();
        let mut paths = Vec::new();
        for i in 0..7 {
            let path = PathBuf::from(format!("in_{i}.tif"));
            #[allow(clippy::cast_precision_loss)]
            provider.add_input(&path, small_grid(i as f64 * 4.0), vec![vec![1.0; 16]]);
            paths.push(path);
        }

        let infos = probe_inputs(&provider, &paths, 3).unwrap();
        assert_eq!(infos.len(), 7);
        for (i, info) in infos.iter().enumerate() {
            assert_eq!(info.path, paths[i]);
        }
    }

    #[test]
    fn test_probe_inputs_fails_on_missing() {
        let provider = MemoryProvider::new();
        provider.add_input(Path::new("a.tif"), small_grid(0.0), vec![vec![1.0; 16]]);
        let paths = vec![PathBuf::from("a.tif"), PathBuf::from("missing.tif")];

        let err = probe_inputs(&provider, &paths, 2).unwrap_err();
        assert!(matches!(err, MosaicError::Probe { .. }));
    }
}
