//! Bounded block cache between read workers and the writer.
//!
//! Workers `publish` decoded blocks keyed by `(block index, input)`; the
//! writer `take`s all contributions of one block at a time, in row-major
//! order. Admission is bounded by a look-ahead window spanning the writer's
//! current block and the `window - 1` blocks after it; a worker publishing
//! past that suspends until the cursor advances. The writer's current block
//! is never refused, and its missing contributions are spread round-robin
//! across workers, so no worker the writer depends on can be blocked on
//! admission: the pipeline cannot deadlock.
//!
//! The cache is a mutex-guarded map with two condition variables: `space`
//! (publishers waiting on the window) and `ready` (the writer waiting on
//! completeness). Both waits observe the abort flag so a failing thread
//! releases everyone.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::error::MosaicError;
use crate::grid::BlockRect;
use crate::provider::InputId;

/// A decoded block in transit from a worker to the writer.
#[derive(Debug)]
pub struct DecodedBlock {
    pub block_index: usize,
    pub input: InputId,
    /// Destination rectangle relative to the block's top-left corner.
    pub dst: BlockRect,
    /// Row-major pixels sized to `dst`.
    pub pixels: Vec<f32>,
}

struct CacheState {
    slots: AHashMap<(usize, InputId), DecodedBlock>,
    /// Block index the writer is currently assembling.
    cursor: usize,
    aborted: bool,
    /// `None` until the first publish or take is observed.
    min_resident: Option<usize>,
    max_resident: usize,
}

impl CacheState {
    fn note_residency(&mut self) {
        let len = self.slots.len();
        self.min_resident = Some(self.min_resident.map_or(len, |m| m.min(len)));
        self.max_resident = self.max_resident.max(len);
    }
}

/// Mutex-and-condvar bounded cache keyed by `(block index, input)`.
pub struct BlockCache {
    state: Mutex<CacheState>,
    space: Condvar,
    ready: Condvar,
    window: usize,
}

impl BlockCache {
    /// Create a cache admitting blocks within `window` block indices of the
    /// writer's cursor (the cursor's own block counts as one).
    ///
    /// # Panics
    /// Panics if `window` is zero; the writer's own block must always fit.
    #[must_use]
    pub fn new(window: usize) -> Self {
        assert!(window >= 1, "look-ahead window must admit the writer's block");
        Self {
            state: Mutex::new(CacheState {
                slots: AHashMap::new(),
                cursor: 0,
                aborted: false,
                min_resident: None,
                max_resident: 0,
            }),
            space: Condvar::new(),
            ready: Condvar::new(),
            window,
        }
    }

    /// The configured look-ahead window.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Insert a decoded block, suspending while it is beyond the look-ahead
    /// window. Returns the time spent suspended.
    ///
    /// # Errors
    /// Returns [`MosaicError::Aborted`] when the run aborted while waiting.
    ///
    /// # Panics
    /// Panics on a duplicate `(block index, input)` key: the plan produces
    /// every task exactly once, so a duplicate is a scheduler bug.
    pub fn publish(&self, block: DecodedBlock) -> Result<Duration, MosaicError> {
        let started = Instant::now();
        let mut state = self.state.lock().unwrap();
        while !state.aborted && block.block_index >= state.cursor + self.window {
            state = self.space.wait(state).unwrap();
        }
        if state.aborted {
            return Err(MosaicError::Aborted);
        }

        let key = (block.block_index, block.input);
        let displaced = state.slots.insert(key, block);
        assert!(
            displaced.is_none(),
            "duplicate publish for block {} input {}",
            key.0,
            key.1
        );
        state.note_residency();
        drop(state);

        self.ready.notify_all();
        Ok(started.elapsed())
    }

    /// Remove and return all of a block's contributions, suspending until
    /// every input in `expected` has published. Also returns the time spent
    /// suspended.
    ///
    /// # Errors
    /// Returns [`MosaicError::Aborted`] when the run aborted while waiting.
    pub fn take_all_for(
        &self,
        block_index: usize,
        expected: &[InputId],
    ) -> Result<(AHashMap<InputId, DecodedBlock>, Duration), MosaicError> {
        let started = Instant::now();
        let mut state = self.state.lock().unwrap();
        loop {
            if state.aborted {
                return Err(MosaicError::Aborted);
            }
            let complete = expected
                .iter()
                .all(|input| state.slots.contains_key(&(block_index, *input)));
            if complete {
                break;
            }
            state = self.ready.wait(state).unwrap();
        }

        let mut taken = AHashMap::with_capacity(expected.len());
        for input in expected {
            let block = state
                .slots
                .remove(&(block_index, *input))
                .expect("completeness was just checked under the lock");
            taken.insert(*input, block);
        }
        state.note_residency();
        Ok((taken, started.elapsed()))
    }

    /// Advance the writer cursor, waking publishers blocked on the window.
    pub fn advance(&self, cursor: usize) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(cursor >= state.cursor, "writer cursor only moves forward");
        state.cursor = cursor;
        drop(state);
        self.space.notify_all();
    }

    /// Mark the run aborted and wake every suspended thread.
    pub fn abort(&self) {
        self.state.lock().unwrap().aborted = true;
        self.space.notify_all();
        self.ready.notify_all();
    }

    /// True once [`BlockCache::abort`] was called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    /// Min/max resident entry counts observed over the run. The minimum is
    /// taken over the states after each publish and take; an untouched
    /// cache reports (0, 0).
    #[must_use]
    pub fn residency(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.min_resident.unwrap_or(0), state.max_resident)
    }
}
