//! Read workers.
//!
//! Each worker owns one round-robin subsequence of the flat read list and
//! walks it in order: open (or reuse) a per-thread reader handle, read one
//! block, publish it, move on. Handles are private to the thread (the
//! underlying I/O libraries do not share decoder state across threads) and
//! live in a small LRU; a handle is dropped early as soon as its input's
//! last task on this worker is done.
//!
//! A worker that hits a read error records it, raises the shared abort flag
//! and exits; the writer observes the abort at its next suspension point.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use ahash::AHashMap;
use lru::LruCache;
use tracing::debug;

use crate::cache::{BlockCache, DecodedBlock};
use crate::error::MosaicError;
use crate::plan::ReadTask;
use crate::provider::{ImageInfo, InputId, RasterProvider, ViewSpec};

/// Per-thread handle LRU capacity.
pub const DEFAULT_HANDLE_CAPACITY: usize = 8;

/// Thread-local counters, merged by the driver after join.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub blocks_read: u64,
    pub bytes_read: u64,
    /// Time spent suspended in `publish` on the look-ahead window.
    pub wait_on_cache: Duration,
}

/// Everything a reader thread needs, shared read-only.
pub struct WorkerContext<'a> {
    pub provider: &'a dyn RasterProvider,
    pub infos: &'a [ImageInfo],
    /// Reprojection view per input, `None` for native reads.
    pub views: &'a [Option<ViewSpec>],
    pub cache: &'a BlockCache,
    pub abort: &'a AtomicBool,
    pub first_error: &'a Mutex<Option<MosaicError>>,
    /// Output nodata sentinel, the padding value for clamped reads.
    pub nodata: f64,
    pub handle_capacity: usize,
}

impl WorkerContext<'_> {
    /// Record `error` if it is the first, then pull the abort cord.
    fn fail(&self, error: MosaicError) {
        {
            let mut slot = self.first_error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.abort.store(true, Ordering::SeqCst);
        self.cache.abort();
    }
}

/// Run one reader over its task subsequence for one band.
///
/// Returns the thread's counters; errors are reported through the shared
/// abort mechanism rather than the return value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
pub fn run_reader(
    worker_id: usize,
    band: usize,
    tasks: &[ReadTask],
    ctx: &WorkerContext<'_>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let capacity = NonZeroUsize::new(ctx.handle_capacity.max(1)).expect("capacity >= 1");
    let mut handles: LruCache<InputId, Box<dyn crate::provider::BlockReader>> =
        LruCache::new(capacity);

    // Tasks left per input on this worker, so handles close early
    let mut remaining: AHashMap<InputId, usize> = AHashMap::new();
    for task in tasks {
        *remaining.entry(task.input).or_insert(0) += 1;
    }

    for task in tasks {
        if ctx.abort.load(Ordering::SeqCst) {
            break;
        }

        if !handles.contains(&task.input) {
            let info: &ImageInfo = &ctx.infos[task.input];
            match ctx
                .provider
                .open_read(&info.path, ctx.views[task.input].as_ref())
            {
                Ok(reader) => {
                    handles.put(task.input, reader);
                }
                Err(e) => {
                    ctx.fail(e);
                    break;
                }
            }
        }
        let reader = handles.get_mut(&task.input).expect("just inserted");

        let pixels = {
            let grid = reader.grid();
            let (gw, gh) = (grid.width as i64, grid.height as i64);
            let src = &task.src;

            // Clamp the read to the reader's extent; pad the margin with
            // the nodata sentinel
            let left = src.x0.max(0);
            let top = src.y0.max(0);
            let right = src.x1().min(gw);
            let bottom = src.y1().min(gh);

            #[allow(clippy::cast_possible_truncation)]
            let fill = ctx.nodata as f32;
            if right <= left || bottom <= top {
                vec![fill; src.len()]
            } else {
                let clamped = crate::grid::BlockRect::new(
                    left,
                    top,
                    (right - left) as usize,
                    (bottom - top) as usize,
                );
                match reader.read_block(band, &clamped) {
                    Ok(data) => {
                        stats.bytes_read += (data.len() * std::mem::size_of::<f32>()) as u64;
                        if clamped == *src {
                            data
                        } else {
                            let mut padded = vec![fill; src.len()];
                            let col_offset = (left - src.x0) as usize;
                            let row_offset = (top - src.y0) as usize;
                            for row in 0..clamped.h {
                                let dst_start = (row_offset + row) * src.w + col_offset;
                                padded[dst_start..dst_start + clamped.w]
                                    .copy_from_slice(&data[row * clamped.w..(row + 1) * clamped.w]);
                            }
                            padded
                        }
                    }
                    Err(e) => {
                        ctx.fail(e);
                        break;
                    }
                }
            }
        };
        stats.blocks_read += 1;

        match ctx.cache.publish(DecodedBlock {
            block_index: task.block_index,
            input: task.input,
            dst: task.dst,
            pixels,
        }) {
            Ok(waited) => stats.wait_on_cache += waited,
            Err(_) => break,
        }

        // Close the handle once this worker is done with the input
        let left_for_input = remaining.get_mut(&task.input).expect("counted above");
        *left_for_input -= 1;
        if *left_for_input == 0 {
            handles.pop(&task.input);
        }
    }

    debug!(
        worker = worker_id,
        band,
        blocks = stats.blocks_read,
        "Reader finished"
    );
    stats
}

/// Sanity helper used by the tests below: true when a padded buffer is
/// pure sentinel.
#[cfg(test)]
fn all_nodata(pixels: &[f32], nodata: f64) -> bool {
    pixels.iter().all(|&v| crate::grid::matches_nodata(v, nodata))
}
