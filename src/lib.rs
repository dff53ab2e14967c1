#![doc = include_str!("../README.md")]
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`mosaic`]: The driver and writer loop - [`do_mosaic`] lives here
//! - [`plan`]: Block plan construction and round-robin work partitioning
//! - [`cache`]: The bounded block cache between readers and the writer
//! - [`worker`]: Read worker threads with per-thread handle LRUs
//! - [`resolve`]: Output grid resolution from inputs and options
//! - [`reproject`]: Reprojection views serving output-grid reads
//! - [`provider`]: The raster I/O abstraction ([`RasterProvider`]) with
//!   GeoTIFF and in-memory implementations
//! - [`grid`]: Pixel grids, geotransforms and block arithmetic
//! - [`geometry`]: CRS transforms via proj4rs
//! - [`monitor`]: Phase timings and per-thread counters
//! - [`error`]: The [`MosaicError`] taxonomy

pub mod cache;
pub mod casting;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod monitor;
pub mod mosaic;
pub mod plan;
pub mod provider;
pub mod reproject;
pub mod resolve;
pub mod worker;

// ============================================================================
// Entry points
// ============================================================================

pub use mosaic::{
    do_mosaic, do_mosaic_geotiff, read_input_list, MosaicFailure, MosaicOptions,
    DFLT_BLOCKSIZE, DFLT_DRIVER, DFLT_NUMTHREADS,
};

// ============================================================================
// Errors & monitoring
// ============================================================================

pub use error::MosaicError;
pub use monitor::{MonitorRecord, PhaseRecord, ThreadRecord};

// ============================================================================
// I/O providers
// ============================================================================

pub use provider::geotiff::GeoTiffProvider;
pub use provider::memory::MemoryProvider;
pub use provider::{BlockReader, BlockWriter, ImageInfo, InputId, RasterProvider, ViewSpec};

// ============================================================================
// Grids & geometry
// ============================================================================

pub use grid::{BlockGrid, BlockId, BlockRect, Bounds, GeoTransform, GridSpec, PixelType};
pub use reproject::ResamplingMethod;

// ============================================================================
// Scheduling primitives
// ============================================================================

pub use cache::{BlockCache, DecodedBlock};
pub use plan::{BlockPlan, ReadTask};
