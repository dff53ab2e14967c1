//! Error types for the mosaic pipeline.
//!
//! The taxonomy mirrors the phases of a run: usage errors surface before
//! anything is opened, probe and projection errors before any thread is
//! spawned, read/write errors during the run (they abort the pipeline and
//! remove the output), and invariant errors indicate a scheduler bug.

use std::fmt;
use std::path::Path;

/// Error type covering every failure mode of a mosaic run.
#[derive(Debug)]
pub enum MosaicError {
    /// Bad options, empty input list, conflicting projection options.
    Usage(String),
    /// An input could not be opened or its metadata read.
    Probe { path: String, reason: String },
    /// Projections could not be reconciled or a CRS is unsupported.
    Projection(String),
    /// A block read failed during the run.
    Read { path: String, reason: String },
    /// Output creation or a block write failed.
    Write { path: String, reason: String },
    /// The plan/cache contract was violated; indicates a bug, not bad input.
    Invariant(String),
    /// The run was aborted because another thread hit a fatal error.
    Aborted,
}

impl MosaicError {
    pub(crate) fn probe(path: &Path, reason: impl fmt::Display) -> Self {
        MosaicError::Probe {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn read(path: &Path, reason: impl fmt::Display) -> Self {
        MosaicError::Read {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn write(path: &Path, reason: impl fmt::Display) -> Self {
        MosaicError::Write {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code for this error: 1 usage, 2 I/O, 3 geometry/projection.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            MosaicError::Usage(_) => 1,
            MosaicError::Probe { .. }
            | MosaicError::Read { .. }
            | MosaicError::Write { .. }
            | MosaicError::Invariant(_)
            | MosaicError::Aborted => 2,
            MosaicError::Projection(_) => 3,
        }
    }
}

impl fmt::Display for MosaicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MosaicError::Usage(msg) => write!(f, "usage error: {msg}"),
            MosaicError::Probe { path, reason } => {
                write!(f, "cannot probe {path}: {reason}")
            }
            MosaicError::Projection(msg) => write!(f, "projection error: {msg}"),
            MosaicError::Read { path, reason } => {
                write!(f, "read error on {path}: {reason}")
            }
            MosaicError::Write { path, reason } => {
                write!(f, "write error on {path}: {reason}")
            }
            MosaicError::Invariant(msg) => write!(f, "internal invariant violated: {msg}"),
            MosaicError::Aborted => write!(f, "aborted after a fatal error in another thread"),
        }
    }
}

impl std::error::Error for MosaicError {}
