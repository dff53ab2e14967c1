//! The mosaic driver and writer loop.
//!
//! [`do_mosaic`] is the single entry point: probe the inputs, resolve the
//! output grid, build the block plan, then for each band run N reader
//! threads against the bounded block cache while the calling thread drains
//! it in row-major order, composing first-hit-wins and writing. Finalization
//! always runs: the output is finished on success or discarded on failure,
//! and the monitor record is produced either way.
//!
//! Output determinism is structural. Blocks are written in plan order
//! regardless of read completion order, and composition within a block
//! follows the user-supplied input-list order, so thread interleaving
//! cannot show up in the output bytes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::cache::BlockCache;
use crate::error::MosaicError;
use crate::grid::{matches_nodata, BlockRect, GridSpec};
use crate::monitor::{BandStatsRecord, ConfigRecord, Monitor, MonitorRecord};
use crate::plan::{BlockPlan, ReadTask};
use crate::provider::{
    probe_inputs, BlockWriter, ImageInfo, InputId, RasterProvider, ViewSpec,
};
use crate::provider::geotiff::GeoTiffProvider;
use crate::reproject::ResamplingMethod;
use crate::resolve::resolve_output_grid;
use crate::worker::{run_reader, WorkerContext, DEFAULT_HANDLE_CAPACITY};

/// Default number of read threads.
pub const DFLT_NUMTHREADS: usize = 4;
/// Default working block size in pixels.
pub const DFLT_BLOCKSIZE: usize = 1024;
/// Default output format driver.
pub const DFLT_DRIVER: &str = "GTiff";

/// Options accepted by [`do_mosaic`]; one field per CLI option.
#[derive(Debug, Clone)]
pub struct MosaicOptions {
    /// Read threads, in addition to the calling thread which writes.
    pub numthreads: usize,
    /// Working block size B; blocks are BxB except at the edges.
    pub blocksize: usize,
    pub driver: String,
    /// Driver creation options as NAME=VALUE strings, passed through.
    pub creation_options: Vec<String>,
    /// Nodata override; defaults to the first input's value.
    pub nullval: Option<f64>,
    /// Output projection as an EPSG code.
    pub output_epsg: Option<u32>,
    /// Output projection as a WKT file (EPSG authority is extracted).
    pub output_wkt_file: Option<PathBuf>,
    pub xres: Option<f64>,
    pub yres: Option<f64>,
    /// Resampling used by reprojection views.
    pub resampling: ResamplingMethod,
}

impl Default for MosaicOptions {
    fn default() -> Self {
        Self {
            numthreads: DFLT_NUMTHREADS,
            blocksize: DFLT_BLOCKSIZE,
            driver: DFLT_DRIVER.to_string(),
            creation_options: Vec::new(),
            nullval: None,
            output_epsg: None,
            output_wkt_file: None,
            xres: None,
            yres: None,
            resampling: ResamplingMethod::default(),
        }
    }
}

/// A failed run: the cause plus the partial monitor record.
#[derive(Debug)]
pub struct MosaicFailure {
    pub error: MosaicError,
    pub monitor: MonitorRecord,
}

impl fmt::Display for MosaicFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for MosaicFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Read an input file list: one path per line, blank lines and `#` comments
/// ignored. Order is significant: it is the mosaic priority order.
///
/// # Errors
/// A missing or unreadable list file is a usage error.
pub fn read_input_list(path: &Path) -> Result<Vec<PathBuf>, MosaicError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| MosaicError::Usage(format!("cannot read input list {}: {e}", path.display())))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

/// Build a mosaic of `inputs` (in priority order) into `output`.
///
/// Returns the monitoring record of the run. On failure the output file is
/// removed and the partial record rides in the error.
///
/// # Errors
/// See [`MosaicError`] for the failure taxonomy.
pub fn do_mosaic(
    inputs: &[PathBuf],
    output: &Path,
    options: &MosaicOptions,
    provider: &dyn RasterProvider,
) -> Result<MonitorRecord, MosaicFailure> {
    let mut monitor = Monitor::new();
    match run(inputs, output, options, provider, &mut monitor) {
        Ok(()) => Ok(monitor.into_record()),
        Err(error) => Err(MosaicFailure {
            error,
            monitor: monitor.into_record(),
        }),
    }
}

/// [`do_mosaic`] against the built-in GeoTIFF provider.
///
/// # Errors
/// See [`MosaicError`].
pub fn do_mosaic_geotiff<P: AsRef<Path>>(
    inputs: &[PathBuf],
    output: P,
    options: &MosaicOptions,
) -> Result<MonitorRecord, MosaicFailure> {
    do_mosaic(inputs, output.as_ref(), options, &GeoTiffProvider::new())
}

fn run(
    inputs: &[PathBuf],
    output: &Path,
    options: &MosaicOptions,
    provider: &dyn RasterProvider,
    monitor: &mut Monitor,
) -> Result<(), MosaicError> {
    if inputs.is_empty() {
        return Err(MosaicError::Usage("no input files given".into()));
    }
    if options.numthreads == 0 {
        return Err(MosaicError::Usage("need at least one read thread".into()));
    }
    if options.blocksize == 0 {
        return Err(MosaicError::Usage("block size must be positive".into()));
    }

    monitor.begin_phase("probing");
    let infos = probe_inputs(provider, inputs, options.numthreads)?;
    monitor.end_phase();

    monitor.begin_phase("planning");
    let resolved = resolve_output_grid(&infos, options)?;
    let bands = infos[0].bands;
    for info in &infos {
        if info.bands != bands {
            return Err(MosaicError::probe(
                &info.path,
                format!("has {} bands, expected {bands}", info.bands),
            ));
        }
    }
    let plan = BlockPlan::build(&resolved.grid, options.blocksize, &infos, &resolved.placements)?;
    let window = options.numthreads.max(2);

    monitor.set_plan(plan.block_grid.len(), plan.task_count(), infos.len());
    monitor.set_config(ConfigRecord {
        numthreads: options.numthreads,
        blocksize: options.blocksize,
        driver: options.driver.clone(),
        nullval: resolved.grid.nodata,
        resample: format!("{:?}", options.resampling).to_lowercase(),
        output_epsg: resolved.grid.epsg,
        xres: resolved.grid.xres(),
        yres: resolved.grid.yres(),
        bands,
        lookahead_window: window,
        cpus: num_cpus::get(),
    });
    monitor.end_phase();
    info!(
        blocks = plan.block_grid.len(),
        tasks = plan.task_count(),
        inputs = infos.len(),
        "Plan ready"
    );

    let mut writer = provider.create_output(
        output,
        &resolved.grid,
        bands,
        &options.driver,
        &options.creation_options,
    )?;

    // One reprojection view spec per input needing one, bound to the
    // output grid
    let views: Vec<Option<ViewSpec>> = resolved
        .placements
        .iter()
        .map(|p| {
            p.needs_view.then(|| ViewSpec {
                grid: resolved.grid.clone(),
                resampling: options.resampling,
            })
        })
        .collect();

    monitor.begin_phase("running");
    let partitions = plan.partition(options.numthreads);
    let run_result: Result<Vec<Option<BandStatsRecord>>, MosaicError> = (0..bands)
        .map(|band| {
            run_band_pass(
                band,
                &plan,
                &partitions,
                &infos,
                &views,
                &resolved.grid,
                window,
                provider,
                writer.as_mut(),
                monitor,
            )
        })
        .collect();

    match run_result {
        Ok(band_stats) => {
            monitor.end_phase();
            for (band, stats) in band_stats.into_iter().enumerate() {
                if let Some(record) = stats {
                    writer.set_statistics(
                        band,
                        record.minimum,
                        record.maximum,
                        record.mean,
                        record.stddev,
                    );
                    monitor.push_band_statistics(record);
                }
            }
            monitor.begin_phase("finalizing");
            writer.finish()?;
            monitor.end_phase();
            Ok(())
        }
        Err(error) => {
            writer.discard();
            Err(error)
        }
    }
}

/// Run the full plan once for one band: spawn the readers, drain the cache
/// in plan order on this thread, join, merge counters.
#[allow(clippy::too_many_arguments)]
fn run_band_pass(
    band: usize,
    plan: &BlockPlan,
    partitions: &[Vec<ReadTask>],
    infos: &[ImageInfo],
    views: &[Option<ViewSpec>],
    out_grid: &GridSpec,
    window: usize,
    provider: &dyn RasterProvider,
    writer: &mut dyn BlockWriter,
    monitor: &mut Monitor,
) -> Result<Option<BandStatsRecord>, MosaicError> {
    let cache = BlockCache::new(window);
    let abort = AtomicBool::new(false);
    let first_error: Mutex<Option<MosaicError>> = Mutex::new(None);
    let nodata = out_grid.nodata.unwrap_or(0.0);

    let ctx = WorkerContext {
        provider,
        infos,
        views,
        cache: &cache,
        abort: &abort,
        first_error: &first_error,
        nodata,
        handle_capacity: DEFAULT_HANDLE_CAPACITY,
    };

    let writer_result = thread::scope(|scope| {
        let handles: Vec<_> = partitions
            .iter()
            .enumerate()
            .map(|(worker_id, tasks)| {
                let ctx = &ctx;
                scope.spawn(move || run_reader(worker_id, band, tasks, ctx))
            })
            .collect();

        let result = writer_pass(band, plan, &cache, writer, nodata, &abort);
        if result.is_err() {
            // Release readers blocked in publish before joining them
            abort.store(true, Ordering::SeqCst);
            cache.abort();
        }

        for (worker_id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(stats) => monitor.record_reader(worker_id, &stats),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        result
    });

    let (min_resident, max_resident) = cache.residency();
    monitor.note_cache_residency(min_resident, max_resident);

    // A worker's recorded error is the root cause; the writer usually just
    // sees the abort
    let recorded = first_error.lock().unwrap().take();
    match (writer_result, recorded) {
        (Err(MosaicError::Aborted), Some(cause)) => Err(cause),
        (Err(error), _) => Err(error),
        (Ok(_), Some(cause)) => Err(cause),
        (Ok((wait, stats)), None) => {
            monitor.record_writer_wait(wait);
            debug!(band, "Band pass complete");
            Ok(stats.into_record(band))
        }
    }
}

/// The writer loop for one band: every output block in row-major order.
fn writer_pass(
    band: usize,
    plan: &BlockPlan,
    cache: &BlockCache,
    writer: &mut dyn BlockWriter,
    nodata: f64,
    abort: &AtomicBool,
) -> Result<(Duration, StatsAccumulator), MosaicError> {
    let mut wait_total = Duration::ZERO;
    let mut stats = StatsAccumulator::new(nodata);
    #[allow(clippy::cast_possible_truncation)]
    let fill = nodata as f32;

    for block_index in 0..plan.block_grid.len() {
        if abort.load(Ordering::SeqCst) {
            return Err(MosaicError::Aborted);
        }

        let rect = plan.block_grid.rect(plan.block_grid.id(block_index));
        let buffer = match plan.entry(block_index) {
            // No input touches this block: pure nodata, no reads to wait on
            None => vec![fill; rect.len()],
            Some(tasks) => {
                let expected: Vec<InputId> = tasks.iter().map(|t| t.input).collect();
                let (mut contribs, waited) = cache.take_all_for(block_index, &expected)?;
                wait_total += waited;
                compose_block(&rect, tasks, &mut contribs, nodata)?
            }
        };

        writer.write_block(band, &rect, &buffer)?;
        stats.accumulate(&buffer);
        cache.advance(block_index + 1);
    }

    Ok((wait_total, stats))
}

/// Merge a block's contributions, first hit wins in task (input-list)
/// order: a destination pixel still holding the sentinel is written, any
/// other value is preserved.
fn compose_block(
    rect: &BlockRect,
    tasks: &[ReadTask],
    contribs: &mut ahash::AHashMap<InputId, crate::cache::DecodedBlock>,
    nodata: f64,
) -> Result<Vec<f32>, MosaicError> {
    #[allow(clippy::cast_possible_truncation)]
    let fill = nodata as f32;
    let mut buffer = vec![fill; rect.len()];

    for task in tasks {
        let block = contribs.remove(&task.input).ok_or_else(|| {
            MosaicError::Invariant(format!(
                "missing contribution of input {} to block {}",
                task.input, task.block_index
            ))
        })?;
        if block.pixels.len() != task.dst.len() {
            return Err(MosaicError::Invariant(format!(
                "block shape mismatch at block {}: {} pixels for {:?}",
                task.block_index,
                block.pixels.len(),
                task.dst
            )));
        }

        #[allow(clippy::cast_sign_loss)]
        let (dst_x, dst_y) = (task.dst.x0 as usize, task.dst.y0 as usize);
        for row in 0..task.dst.h {
            let src_row = row * task.dst.w;
            let dst_row = (dst_y + row) * rect.w + dst_x;
            for col in 0..task.dst.w {
                let dst = &mut buffer[dst_row + col];
                if matches_nodata(*dst, nodata) {
                    *dst = block.pixels[src_row + col];
                }
            }
        }
    }
    Ok(buffer)
}

/// Single-pass accumulator for per-band statistics over valid pixels.
struct StatsAccumulator {
    nodata: f64,
    minimum: Option<f64>,
    maximum: Option<f64>,
    sum: f64,
    ssq: f64,
    count: u64,
}

impl StatsAccumulator {
    fn new(nodata: f64) -> Self {
        Self {
            nodata,
            minimum: None,
            maximum: None,
            sum: 0.0,
            ssq: 0.0,
            count: 0,
        }
    }

    fn accumulate(&mut self, pixels: &[f32]) {
        for &pixel in pixels {
            if matches_nodata(pixel, self.nodata) {
                continue;
            }
            let v = f64::from(pixel);
            self.sum += v;
            self.ssq += v * v;
            self.count += 1;
            self.minimum = Some(self.minimum.map_or(v, |m| m.min(v)));
            self.maximum = Some(self.maximum.map_or(v, |m| m.max(v)));
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn into_record(self, band: usize) -> Option<BandStatsRecord> {
        if self.count == 0 {
            return None;
        }
        let mean = self.sum / self.count as f64;
        // Rounding error can push the variance a hair negative
        let variance = (self.ssq / self.count as f64 - mean * mean).max(0.0);
        Some(BandStatsRecord {
            band,
            minimum: self.minimum.unwrap_or(mean),
            maximum: self.maximum.unwrap_or(mean),
            mean,
            stddev: variance.sqrt(),
            count: self.count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GeoTransform, PixelType};
    use crate::provider::memory::{CapturedOutput, MemoryProvider};

    fn grid(x0: f64, y0: f64, w: usize, h: usize) -> GridSpec {
        GridSpec {
            epsg: 32633,
            transform: GeoTransform::north_up(x0, y0, 1.0, 1.0),
            width: w,
            height: h,
            dtype: PixelType::F32,
            nodata: Some(0.0),
        }
    }

    fn options(numthreads: usize, blocksize: usize) -> MosaicOptions {
        MosaicOptions {
            numthreads,
            blocksize,
            nullval: Some(0.0),
            ..MosaicOptions::default()
        }
    }

    fn mosaic(
        provider: &MemoryProvider,
        inputs: &[&str],
        opts: &MosaicOptions,
    ) -> (Result<MonitorRecord, MosaicFailure>, Option<CapturedOutput>) {
        let paths: Vec<PathBuf> = inputs.iter().map(PathBuf::from).collect();
        let result = do_mosaic(&paths, Path::new("out.tif"), opts, provider);
        let output = provider.finished_output(Path::new("out.tif"));
        (result, output)
    }

    #[test]
    fn test_scenario_single_input() {
        // One 2x2 input comes back verbatim; one block, one read
        let provider = MemoryProvider::new();
        provider.add_input(
            Path::new("a.tif"),
            grid(0.0, 2.0, 2, 2),
            vec![vec![10.0, 20.0, 30.0, 40.0]],
        );

        let (result, output) = mosaic(&provider, &["a.tif"], &options(1, 2));
        let record = result.unwrap();
        assert_eq!(record.plan.output_blocks, 1);
        assert_eq!(record.plan.read_tasks, 1);
        assert_eq!(record.plan.inputs, 1);

        let output = output.unwrap();
        assert_eq!(output.pixels[0], vec![10.0, 20.0, 30.0, 40.0]);
        assert_eq!(output.grid.nodata, Some(0.0));
    }

    #[test]
    fn test_scenario_side_by_side() {
        // Two non-overlapping 2x2 inputs tile a 2x4 output exactly
        let provider = MemoryProvider::new();
        provider.add_input(
            Path::new("a.tif"),
            grid(0.0, 2.0, 2, 2),
            vec![vec![1.0, 2.0, 3.0, 4.0]],
        );
        provider.add_input(
            Path::new("b.tif"),
            grid(2.0, 2.0, 2, 2),
            vec![vec![5.0, 6.0, 7.0, 8.0]],
        );

        let (result, output) = mosaic(&provider, &["a.tif", "b.tif"], &options(2, 2));
        let record = result.unwrap();
        assert_eq!(record.plan.output_blocks, 2);
        assert_eq!(record.plan.read_tasks, 2);

        let output = output.unwrap();
        assert_eq!(output.grid.width, 4);
        assert_eq!(output.grid.height, 2);
        assert_eq!(
            output.pixels[0],
            vec![1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0]
        );
    }

    #[test]
    fn test_scenario_overlap_priority() {
        // A covers cols 0-1 with 1s, B covers cols 1-2 with 2s; column 1
        // comes from A because list order is priority order
        let provider = MemoryProvider::new();
        provider.add_input(Path::new("a.tif"), grid(0.0, 2.0, 2, 2), vec![vec![1.0; 4]]);
        provider.add_input(Path::new("b.tif"), grid(1.0, 2.0, 2, 2), vec![vec![2.0; 4]]);

        let (result, output) = mosaic(&provider, &["a.tif", "b.tif"], &options(2, 2));
        result.unwrap();

        let output = output.unwrap();
        assert_eq!(output.grid.width, 3);
        assert_eq!(
            output.pixels[0],
            vec![1.0, 1.0, 2.0, 1.0, 1.0, 2.0]
        );
    }

    #[test]
    fn test_scenario_priority_is_list_order_not_arrival() {
        // Same rasters, reversed list: now B wins the overlap
        let provider = MemoryProvider::new();
        provider.add_input(Path::new("a.tif"), grid(0.0, 2.0, 2, 2), vec![vec![1.0; 4]]);
        provider.add_input(Path::new("b.tif"), grid(1.0, 2.0, 2, 2), vec![vec![2.0; 4]]);

        let (result, output) = mosaic(&provider, &["b.tif", "a.tif"], &options(2, 2));
        result.unwrap();
        assert_eq!(
            output.unwrap().pixels[0],
            vec![1.0, 2.0, 2.0, 1.0, 2.0, 2.0]
        );
    }

    #[test]
    fn test_scenario_nodata_hole() {
        // A covers cols 0-1, B covers cols 3-4; the gap column stays nodata
        let provider = MemoryProvider::new();
        provider.add_input(Path::new("a.tif"), grid(0.0, 2.0, 2, 2), vec![vec![1.0; 4]]);
        provider.add_input(Path::new("b.tif"), grid(3.0, 2.0, 2, 2), vec![vec![2.0; 4]]);

        let (result, output) = mosaic(&provider, &["a.tif", "b.tif"], &options(2, 2));
        result.unwrap();
        assert_eq!(
            output.unwrap().pixels[0],
            vec![1.0, 1.0, 0.0, 2.0, 2.0, 1.0, 1.0, 0.0, 2.0, 2.0]
        );
    }

    #[test]
    fn test_scenario_lookahead_bound() {
        // 4 blocks, 4 inputs each contributing everywhere, N=2, window 2:
        // residency may never exceed window * contributions-per-block
        let provider = MemoryProvider::new();
        for (i, name) in ["a.tif", "b.tif", "c.tif", "d.tif"].iter().enumerate() {
            let value = (i + 1) as f32;
            provider.add_input(Path::new(name), grid(0.0, 4.0, 4, 4), vec![vec![value; 16]]);
        }

        let (result, output) =
            mosaic(&provider, &["a.tif", "b.tif", "c.tif", "d.tif"], &options(2, 2));
        let record = result.unwrap();
        assert_eq!(record.plan.output_blocks, 4);
        assert_eq!(record.plan.read_tasks, 16);
        assert!(
            record.cache.max_residency <= 2 * 4,
            "cache residency peaked at {}",
            record.cache.max_residency
        );

        // First input wins every pixel
        assert_eq!(output.unwrap().pixels[0], vec![1.0; 16]);
    }

    #[test]
    fn test_scenario_abort_on_read_error() {
        let provider = MemoryProvider::new();
        provider.add_input(
            Path::new("a.tif"),
            grid(0.0, 2.0, 2, 2),
            vec![vec![1.0, 2.0, 3.0, 4.0]],
        );
        provider.add_input(
            Path::new("b.tif"),
            grid(2.0, 2.0, 2, 2),
            vec![vec![5.0, 6.0, 7.0, 8.0]],
        );
        provider.fail_reads_for(Path::new("b.tif"));

        let (result, output) = mosaic(&provider, &["a.tif", "b.tif"], &options(2, 2));
        let failure = result.unwrap_err();
        assert!(matches!(failure.error, MosaicError::Read { .. }));
        assert_eq!(failure.error.exit_code(), 2);

        // No output file; the partial monitor has the pre-run phases only
        assert!(output.is_none());
        assert!(provider.was_discarded(Path::new("out.tif")));
        assert!(failure.monitor.phases.contains_key("probing"));
        assert!(failure.monitor.phases.contains_key("planning"));
        assert!(!failure.monitor.phases.contains_key("running"));
        assert!(!failure.monitor.phases.contains_key("finalizing"));
    }

    #[test]
    fn test_blocks_written_in_row_major_order() {
        let provider = MemoryProvider::new();
        provider.add_input(Path::new("a.tif"), grid(0.0, 4.0, 4, 4), vec![vec![1.0; 16]]);

        let (result, output) = mosaic(&provider, &["a.tif"], &options(4, 2));
        result.unwrap();

        let output = output.unwrap();
        assert_eq!(output.write_order.len(), 4);
        let origins: Vec<(i64, i64)> = output
            .write_order
            .iter()
            .map(|(_, rect)| (rect.y0, rect.x0))
            .collect();
        let mut sorted = origins.clone();
        sorted.sort_unstable();
        assert_eq!(origins, sorted, "blocks written out of row-major order");
    }

    #[test]
    fn test_determinism_across_runs_and_thread_counts() {
        let build = |n: usize| {
            let provider = MemoryProvider::new();
            provider.add_input(Path::new("a.tif"), grid(0.0, 4.0, 3, 4), vec![vec![1.0; 12]]);
            provider.add_input(Path::new("b.tif"), grid(1.0, 3.0, 3, 3), vec![vec![2.0; 9]]);
            provider.add_input(Path::new("c.tif"), grid(2.0, 4.0, 2, 2), vec![vec![3.0; 4]]);
            let (result, output) =
                mosaic(&provider, &["a.tif", "b.tif", "c.tif"], &options(n, 2));
            result.unwrap();
            output.unwrap().pixels
        };

        let reference = build(1);
        for n in [2, 3, 8] {
            assert_eq!(build(n), reference, "output differs with {n} threads");
        }
    }

    #[test]
    fn test_no_handle_leaks() {
        let provider = MemoryProvider::new();
        provider.add_input(Path::new("a.tif"), grid(0.0, 4.0, 4, 4), vec![vec![1.0; 16]]);
        provider.add_input(Path::new("b.tif"), grid(0.0, 4.0, 4, 4), vec![vec![2.0; 16]]);

        let (result, _) = mosaic(&provider, &["a.tif", "b.tif"], &options(3, 2));
        result.unwrap();
        assert_eq!(provider.open_count(), provider.close_count());
        assert!(provider.open_count() > 0);
    }

    #[test]
    fn test_more_workers_than_tasks() {
        let provider = MemoryProvider::new();
        provider.add_input(
            Path::new("a.tif"),
            grid(0.0, 2.0, 2, 2),
            vec![vec![1.0, 2.0, 3.0, 4.0]],
        );

        let (result, output) = mosaic(&provider, &["a.tif"], &options(8, 2));
        result.unwrap();
        assert_eq!(output.unwrap().pixels[0], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_multiband_inputs() {
        let provider = MemoryProvider::new();
        provider.add_input(
            Path::new("a.tif"),
            grid(0.0, 2.0, 2, 2),
            vec![vec![1.0; 4], vec![10.0; 4]],
        );
        provider.add_input(
            Path::new("b.tif"),
            grid(1.0, 2.0, 2, 2),
            vec![vec![2.0; 4], vec![20.0; 4]],
        );

        let (result, output) = mosaic(&provider, &["a.tif", "b.tif"], &options(2, 2));
        let record = result.unwrap();
        // The plan is shared across bands; tasks are counted once
        assert_eq!(record.plan.read_tasks, 3);

        let output = output.unwrap();
        assert_eq!(output.pixels[0], vec![1.0, 1.0, 2.0, 1.0, 1.0, 2.0]);
        assert_eq!(output.pixels[1], vec![10.0, 10.0, 20.0, 10.0, 10.0, 20.0]);
        assert_eq!(output.statistics.len(), 2);
        let (min0, max0, mean0, _) = output.statistics[0].unwrap();
        assert_eq!((min0, max0), (1.0, 2.0));
        assert!(mean0 > 1.0 && mean0 < 2.0);
    }

    #[test]
    fn test_band_count_mismatch_rejected() {
        let provider = MemoryProvider::new();
        provider.add_input(Path::new("a.tif"), grid(0.0, 2.0, 2, 2), vec![vec![1.0; 4]]);
        provider.add_input(
            Path::new("b.tif"),
            grid(2.0, 2.0, 2, 2),
            vec![vec![2.0; 4], vec![3.0; 4]],
        );

        let (result, _) = mosaic(&provider, &["a.tif", "b.tif"], &options(2, 2));
        assert!(matches!(result.unwrap_err().error, MosaicError::Probe { .. }));
    }

    #[test]
    fn test_empty_input_list_is_usage_error() {
        let provider = MemoryProvider::new();
        let result = do_mosaic(&[], Path::new("out.tif"), &options(2, 2), &provider);
        let failure = result.unwrap_err();
        assert!(matches!(failure.error, MosaicError::Usage(_)));
        assert_eq!(failure.error.exit_code(), 1);
    }

    #[test]
    fn test_reprojected_input_through_view() {
        // Second input is misaligned by half a pixel; it reads through a
        // nearest-neighbor view and still lands in the right cells
        let provider = MemoryProvider::new();
        provider.add_input(Path::new("a.tif"), grid(0.0, 2.0, 2, 2), vec![vec![1.0; 4]]);
        provider.add_input(Path::new("b.tif"), grid(2.5, 2.0, 2, 2), vec![vec![2.0; 4]]);

        let (result, output) = mosaic(&provider, &["a.tif", "b.tif"], &options(2, 2));
        result.unwrap();

        let output = output.unwrap();
        assert_eq!(output.grid.width, 5);
        // Cols 0-1 from A. B's ground coverage is x 2.5..4.5: the centers
        // of output cols 2 and 3 fall inside it, col 4's center (4.5) sits
        // on the far edge and stays nodata
        let row0 = &output.pixels[0][0..5];
        assert_eq!(row0, &[1.0, 1.0, 2.0, 2.0, 0.0]);
        assert_eq!(&output.pixels[0][5..10], &[1.0, 1.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn test_stats_skip_nodata() {
        let mut accumulator = StatsAccumulator::new(0.0);
        accumulator.accumulate(&[0.0, 2.0, 4.0, 0.0]);
        let record = accumulator.into_record(0).unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.minimum, 2.0);
        assert_eq!(record.maximum, 4.0);
        assert_eq!(record.mean, 3.0);
        assert!((record.stddev - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_nodata_band_has_no_stats() {
        let mut accumulator = StatsAccumulator::new(0.0);
        accumulator.accumulate(&[0.0; 8]);
        assert!(accumulator.into_record(0).is_none());
    }

    #[test]
    fn test_read_input_list_parsing() {
        let path = Path::new("/tmp/mosrs_test_infiles.txt");
        std::fs::write(path, "# comment\na.tif\n\n  b.tif  \n# other\nc.tif\n").unwrap();
        let list = read_input_list(path).unwrap();
        assert_eq!(
            list,
            vec![PathBuf::from("a.tif"), PathBuf::from("b.tif"), PathBuf::from("c.tif")]
        );
        std::fs::remove_file(path).ok();

        assert!(read_input_list(Path::new("/tmp/mosrs_missing_list.txt")).is_err());
    }
}
