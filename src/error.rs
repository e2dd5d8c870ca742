//! Error types for the allocator and the collector.

use thiserror::Error;

/// Errors surfaced by [`crate::Heap`].
#[derive(Debug, Error)]
pub enum Error {
    /// Arena growth failed and no free block can hold the request.
    #[error("out of memory: cannot satisfy a request of {requested} bytes")]
    OutOfMemory {
        /// Requested payload size in bytes
        requested: usize,
    },

    /// The request does not fit in a block header's size field.
    #[error("request of {size} bytes exceeds the largest block size")]
    RequestTooLarge {
        /// Requested payload size in bytes
        size: usize,
    },

    /// The stack base could not be read from process metadata.
    #[error("stack base unavailable: {reason}")]
    StackBaseUnavailable {
        /// What went wrong while reading it
        reason: String,
    },

    /// A heap list is structurally broken.
    #[error("heap invariant violated: {detail}")]
    InvariantViolation {
        /// Which list and how
        detail: &'static str,
    },

    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
