//! In-memory raster provider for tests and embedding.
//!
//! Holds input grids as plain `f32` arrays, captures everything the
//! scheduler writes (including write order), counts reader opens/closes
//! and can inject read failures. This is the provider the end-to-end
//! scenario tests run against.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::error::MosaicError;
use crate::grid::{BlockRect, GridSpec};
use crate::provider::{BlockReader, BlockWriter, ImageInfo, RasterProvider, ViewSpec};
use crate::reproject::ReprojectingReader;

struct Dataset {
    grid: GridSpec,
    /// One planar row-major buffer per band.
    bands: Vec<Vec<f32>>,
}

/// Everything written to one output path.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub grid: GridSpec,
    pub bands: usize,
    /// Planar row-major pixels per band.
    pub pixels: Vec<Vec<f32>>,
    /// `(band, rect)` in the order the writer delivered blocks.
    pub write_order: Vec<(usize, BlockRect)>,
    /// `(min, max, mean, stddev)` per band, when set.
    pub statistics: Vec<Option<(f64, f64, f64, f64)>>,
}

#[derive(Default)]
struct State {
    inputs: AHashMap<PathBuf, Arc<Dataset>>,
    failing: HashSet<PathBuf>,
    opens: usize,
    closes: usize,
    pending: AHashMap<PathBuf, CapturedOutput>,
    finished: AHashMap<PathBuf, CapturedOutput>,
    discarded: HashSet<PathBuf>,
}

/// In-memory [`RasterProvider`].
#[derive(Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<State>>,
}

impl MemoryProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an input raster. `bands` holds one row-major `f32` buffer
    /// per band, each of length `grid.width * grid.height`.
    ///
    /// # Panics
    /// Panics if a buffer length does not match the grid.
    pub fn add_input(&self, path: &Path, grid: GridSpec, bands: Vec<Vec<f32>>) {
        assert!(!bands.is_empty(), "input needs at least one band");
        for band in &bands {
            assert_eq!(band.len(), grid.width * grid.height, "band buffer does not match grid");
        }
        let mut state = self.state.lock().unwrap();
        state.inputs.insert(path.to_path_buf(), Arc::new(Dataset { grid, bands }));
    }

    /// Make every subsequent block read of `path` fail.
    pub fn fail_reads_for(&self, path: &Path) {
        self.state.lock().unwrap().failing.insert(path.to_path_buf());
    }

    /// Number of reader handles opened so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    /// Number of reader handles closed (dropped) so far.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// A finished output, if `finish` completed for `path`.
    #[must_use]
    pub fn finished_output(&self, path: &Path) -> Option<CapturedOutput> {
        self.state.lock().unwrap().finished.get(path).cloned()
    }

    /// True when the output for `path` was discarded after a failure.
    #[must_use]
    pub fn was_discarded(&self, path: &Path) -> bool {
        self.state.lock().unwrap().discarded.contains(path)
    }
}

impl RasterProvider for MemoryProvider {
    fn probe(&self, path: &Path) -> Result<ImageInfo, MosaicError> {
        let state = self.state.lock().unwrap();
        let dataset = state
            .inputs
            .get(path)
            .ok_or_else(|| MosaicError::probe(path, "no such dataset"))?;
        Ok(ImageInfo {
            path: path.to_path_buf(),
            grid: dataset.grid.clone(),
            bands: dataset.bands.len(),
            block_size: (dataset.grid.width, dataset.grid.height),
        })
    }

    fn open_read(
        &self,
        path: &Path,
        view: Option<&ViewSpec>,
    ) -> Result<Box<dyn BlockReader>, MosaicError> {
        let dataset = {
            let mut state = self.state.lock().unwrap();
            let dataset = state
                .inputs
                .get(path)
                .cloned()
                .ok_or_else(|| MosaicError::probe(path, "no such dataset"))?;
            state.opens += 1;
            dataset
        };

        let native = Box::new(MemoryReader {
            path: path.to_path_buf(),
            dataset,
            state: Arc::clone(&self.state),
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
        _driver: &str,
        _creation_options: &[String],
    ) -> Result<Box<dyn BlockWriter>, MosaicError> {
        let mut state = self.state.lock().unwrap();
        state.pending.insert(
            path.to_path_buf(),
            CapturedOutput {
                grid: grid.clone(),
                bands,
                pixels: vec![vec![0.0; grid.width * grid.height]; bands],
                write_order: Vec::new(),
                statistics: vec![None; bands],
            },
        );
        Ok(Box::new(MemoryWriter {
            path: path.to_path_buf(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryReader {
    path: PathBuf,
    dataset: Arc<Dataset>,
    state: Arc<Mutex<State>>,
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}

impl BlockReader for MemoryReader {
    #[allow(clippy::cast_sign_loss)]
    fn read_block(&mut self, band: usize, rect: &BlockRect) -> Result<Vec<f32>, MosaicError> {
        if self.state.lock().unwrap().failing.contains(&self.path) {
            return Err(MosaicError::read(&self.path, "injected read failure"));
        }

        let grid = &self.dataset.grid;
        let data = self
            .dataset
            .bands
            .get(band)
            .ok_or_else(|| MosaicError::read(&self.path, format!("no band {band}")))?;

        if rect.x0 < 0
            || rect.y0 < 0
            || rect.x1() > grid.width as i64
            || rect.y1() > grid.height as i64
        {
            return Err(MosaicError::read(
                &self.path,
                format!("rect {rect:?} outside {}x{}", grid.width, grid.height),
            ));
        }

        let mut out = Vec::with_capacity(rect.len());
        for row in 0..rect.h {
            let src_row = (rect.y0 as usize + row) * grid.width + rect.x0 as usize;
            out.extend_from_slice(&data[src_row..src_row + rect.w]);
        }
        Ok(out)
    }

    fn grid(&self) -> &GridSpec {
        &self.dataset.grid
    }
}

struct MemoryWriter {
    path: PathBuf,
    state: Arc<Mutex<State>>,
}

impl BlockWriter for MemoryWriter {
    #[allow(clippy::cast_sign_loss)]
    fn write_block(
        &mut self,
        band: usize,
        rect: &BlockRect,
        pixels: &[f32],
    ) -> Result<(), MosaicError> {
        let mut state = self.state.lock().unwrap();
        let output = state
            .pending
            .get_mut(&self.path)
            .ok_or_else(|| MosaicError::write(&self.path, "output not open"))?;

        if pixels.len() != rect.len() {
            return Err(MosaicError::Invariant(format!(
                "block buffer {} does not match rect {rect:?}",
                pixels.len()
            )));
        }

        let width = output.grid.width;
        for row in 0..rect.h {
            let dst_row = (rect.y0 as usize + row) * width + rect.x0 as usize;
            output.pixels[band][dst_row..dst_row + rect.w]
                .copy_from_slice(&pixels[row * rect.w..(row + 1) * rect.w]);
        }
        output.write_order.push((band, *rect));
        Ok(())
    }

    fn set_statistics(&mut self, band: usize, min: f64, max: f64, mean: f64, stddev: f64) {
        let mut state = self.state.lock().unwrap();
        if let Some(output) = state.pending.get_mut(&self.path) {
            output.statistics[band] = Some((min, max, mean, stddev));
        }
    }

    fn finish(self: Box<Self>) -> Result<(), MosaicError> {
        let mut state = self.state.lock().unwrap();
        let output = state
            .pending
            .remove(&self.path)
            .ok_or_else(|| MosaicError::write(&self.path, "output not open"))?;
        state.finished.insert(self.path.clone(), output);
        Ok(())
    }

    fn discard(self: Box<Self>) {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(&self.path);
        state.discarded.insert(self.path.clone());
    }
}
