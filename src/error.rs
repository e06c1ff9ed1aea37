//! Error types shared by the pool and the filter.

use std::io;
use thiserror::Error;

/// The error type for pool and filter operations.
///
/// Conditions a caller is expected to branch on in normal operation (a full
/// filter, an over-wide hash passed to `remove`) are reported as `Ok(false)`
/// by the corresponding operations; this type covers caller bugs and
/// environmental faults. Any `Error` returned from a mutating operation means
/// the enclosing transaction was aborted and no partial effects persist.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O operation on the pool or its undo log failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The requested filter geometry is invalid. Both bit counts must be
    /// positive, the fingerprint must fit in 64 bits, and a slot
    /// (remainder plus three metadata bits) must fit in one word.
    #[error("invalid filter parameters: qbits={qbits}, rbits={rbits}")]
    InvalidParameters {
        /// Requested quotient width.
        qbits: u64,
        /// Requested remainder width.
        rbits: u64,
    },

    /// The pool has no region large enough for the requested allocation.
    #[error("pool exhausted while allocating {requested} bytes")]
    PoolExhausted {
        /// Size of the failed allocation in bytes.
        requested: u64,
    },

    /// An insertion inside `merge` found the output filter full. The output
    /// is sized to hold both inputs, so this indicates corrupted input state.
    #[error("filter is full")]
    FilterFull,

    /// On-medium state failed validation when opening a pool or binding a
    /// filter handle.
    #[error("corrupted pool state: {0}")]
    Corrupted(String),
}

/// A specialized `Result` type for pool and filter operations.
pub type Result<T> = std::result::Result<T, Error>;
