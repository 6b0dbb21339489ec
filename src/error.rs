//! Operation outcome codes.
//!
//! Every public map operation resolves to `Ok` or exactly one of these
//! codes. `MapFailed` and `LockFailed` carry the underlying OS error and
//! display its description.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ShmResult<T> = Result<T, ShmError>;

/// Closed set of failure codes for map operations.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Creating or attaching the shared region mapping failed.
    #[error("{0}")]
    MapFailed(#[source] io::Error),

    /// Initializing or acquiring the reader-writer lock failed.
    #[error("{0}")]
    LockFailed(#[source] io::Error),

    /// The requested region size cannot hold the fixed segments.
    #[error("memory size too small")]
    MemorySizeTooSmall,

    /// Neither the arena tail nor any free block can hold the record.
    #[error("not enough space in data space")]
    NoSpace,

    /// Every bucket slot is occupied by a live record.
    #[error("buckets is full")]
    NoEmptyBucket,

    /// The freelist has no slot left to track a freed record.
    #[error("freelist is full")]
    NoEmptyFreeBlock,

    /// No record with the given key exists.
    #[error("not found")]
    NotFound,

    /// Destruction attempted by a handle that does not own the region.
    #[error("operation not permitted")]
    PermissionDenied,

    /// The map handle was already closed.
    #[error("map is closed")]
    Closed,
}
