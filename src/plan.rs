//! Block plan construction and read-work partitioning.
//!
//! The plan is the static schedule of the whole job: output blocks in
//! row-major order, and for each block the ordered list of input
//! contributions ([`ReadTask`]s). Flattening those lists, preserving order,
//! gives the read work list; worker `w` of `n` receives the subsequence at
//! indices `i mod n == w`.
//!
//! A block's contributions sit consecutively in the flat list, so the
//! round-robin split lands them on different workers, and each worker walks
//! its subsequence in plan order, keeping every worker's block progression
//! near the writer's. Contiguous chunks per worker would let early workers
//! run arbitrarily far ahead of the writer and stall the pipeline on the
//! look-ahead bound.

use ahash::AHashMap;

use crate::casting::round_pixel;
use crate::error::MosaicError;
use crate::grid::{BlockGrid, BlockId, BlockRect, GeoTransform, GridSpec};
use crate::provider::{ImageInfo, InputId};
use crate::resolve::InputPlacement;

/// One input's contribution to one output block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTask {
    pub block: BlockId,
    /// Linear row-major index of `block`; the writer-cursor ordinate.
    pub block_index: usize,
    pub input: InputId,
    /// Rectangle to read: native input pixels, or output-grid pixels when
    /// the input reads through a reprojection view.
    pub src: BlockRect,
    /// Destination rectangle relative to the block's top-left corner.
    pub dst: BlockRect,
}

/// The static schedule: every output block with its contributions.
#[derive(Debug)]
pub struct BlockPlan {
    pub block_grid: BlockGrid,
    /// All tasks, outer order by block index, inner by input-list order.
    tasks: Vec<ReadTask>,
    /// block index -> (offset, len) into `tasks`; only blocks with at
    /// least one contribution appear.
    entries: AHashMap<usize, (usize, usize)>,
    inputs: usize,
}

impl BlockPlan {
    /// Build the plan from the resolved grid and per-input placements.
    ///
    /// Inputs whose footprint misses the output extent contribute nothing.
    ///
    /// # Errors
    /// Fails if a native input's geotransform cannot be inverted.
    pub fn build(
        out_grid: &GridSpec,
        block_size: usize,
        infos: &[ImageInfo],
        placements: &[InputPlacement],
    ) -> Result<BlockPlan, MosaicError> {
        let block_grid = BlockGrid::new(out_grid.width, out_grid.height, block_size);

        // Inverse geotransform per native input, for world -> input pixels
        let mut inverses: Vec<Option<GeoTransform>> = Vec::with_capacity(infos.len());
        for (info, placement) in infos.iter().zip(placements) {
            if placement.needs_view {
                inverses.push(None);
            } else {
                let inv = info.grid.transform.invert().ok_or_else(|| {
                    MosaicError::Projection(format!(
                        "degenerate geotransform on {}",
                        info.path.display()
                    ))
                })?;
                inverses.push(Some(inv));
            }
        }

        let mut tasks = Vec::new();
        let mut entries = AHashMap::new();
        for block_index in 0..block_grid.len() {
            let block = block_grid.id(block_index);
            let rect = block_grid.rect(block);
            let offset = tasks.len();

            for (input, placement) in placements.iter().enumerate() {
                let Some(overlap) = rect.intersect(&placement.footprint) else {
                    continue;
                };
                let dst = BlockRect::new(
                    overlap.x0 - rect.x0,
                    overlap.y0 - rect.y0,
                    overlap.w,
                    overlap.h,
                );
                let src = match &inverses[input] {
                    // View reads are in output-grid coordinates
                    None => overlap,
                    Some(inv) => {
                        source_rect(&out_grid.transform, inv, &overlap)
                    }
                };
                tasks.push(ReadTask {
                    block,
                    block_index,
                    input,
                    src,
                    dst,
                });
            }

            let len = tasks.len() - offset;
            if len > 0 {
                entries.insert(block_index, (offset, len));
            }
        }

        Ok(BlockPlan {
            block_grid,
            tasks,
            entries,
            inputs: infos.len(),
        })
    }

    /// Total number of read tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of inputs the plan was built over.
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inputs
    }

    /// Tasks contributing to a block, in input-list order. `None` when no
    /// input intersects the block.
    #[must_use]
    pub fn entry(&self, block_index: usize) -> Option<&[ReadTask]> {
        self.entries
            .get(&block_index)
            .map(|&(offset, len)| &self.tasks[offset..offset + len])
    }

    /// The flat read list in plan order.
    #[must_use]
    pub fn flat_read_list(&self) -> &[ReadTask] {
        &self.tasks
    }

    /// Split the flat read list into `n` round-robin subsequences, one per
    /// worker, preserving relative order.
    #[must_use]
    pub fn partition(&self, n: usize) -> Vec<Vec<ReadTask>> {
        let n = n.max(1);
        let mut parts = vec![Vec::with_capacity(self.tasks.len().div_ceil(n)); n];
        for (i, task) in self.tasks.iter().enumerate() {
            parts[i % n].push(*task);
        }
        parts
    }
}

/// Map an output-grid rectangle into a native input's pixel space.
///
/// Both corners are pushed through output-pixel -> world -> input-pixel;
/// for grid-aligned inputs this is exact up to float noise, which rounding
/// absorbs. The result may poke past the input's edges; readers clamp and
/// pad.
fn source_rect(out: &GeoTransform, input_inverse: &GeoTransform, rect: &BlockRect) -> BlockRect {
    #[allow(clippy::cast_precision_loss)]
    let (wx0, wy0) = out.apply(rect.x0 as f64, rect.y0 as f64);
    #[allow(clippy::cast_precision_loss)]
    let (wx1, wy1) = out.apply(rect.x1() as f64, rect.y1() as f64);
    let (sx0, sy0) = input_inverse.apply(wx0, wy0);
    let (sx1, sy1) = input_inverse.apply(wx1, wy1);

    let left = round_pixel(sx0.min(sx1));
    let top = round_pixel(sy0.min(sy1));
    BlockRect::new(left, top, rect.w, rect.h)
}
