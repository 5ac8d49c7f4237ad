//! Marrow object heap.
//!
//! Owns the raw memory behind every marrow object and the bookkeeping the
//! rest of the system relies on to reason about it.
//!
//! # Architecture
//!
//! - **Object heap** ([`heap`]): one block per object, registered by
//!   address. Each block records the size the object claims, the size it
//!   could claim after allocator rounding, a never-reused serial number,
//!   and which prefix words precede the object.
//!
//! - **Tracking list** ([`tracking`]): container objects carry a
//!   [`GcHead`] in their prefix and are linked onto a single list while
//!   they participate in cycle collection. Collection itself is not
//!   performed here.
//!
//! # Usage
//!
//! ```ignore
//! use marrow_gc::{BlockPrefix, heap};
//!
//! let obj = heap().allocate(40, BlockPrefix::GC)?;
//! let info = heap().block(obj.as_ptr() as usize).unwrap();
//! assert_eq!(info.usable, 48);
//! ```
//!
//! # Safety
//!
//! The heap hands out raw addresses. Callers must:
//! - release each block exactly once
//! - unlink a block's collector head before releasing it
//! - never write past [`BlockInfo::usable`] bytes of an object

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod heap;
pub mod tracking;

mod stats;

// Re-exports for convenient access
pub use config::{ConfigError, HeapConfig};
pub use heap::{BlockInfo, BlockPrefix, ObjectHeap, heap, init_heap};
pub use stats::HeapStats;
pub use tracking::GcHead;

use thiserror::Error;

/// Errors raised by the object heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The size cannot be expressed as an allocation layout.
    #[error("invalid allocation size {0}")]
    InvalidSize(usize),
    /// The system allocator refused the request.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),
    /// The request exceeds the configured maximum object size.
    #[error("object of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Requested size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// No live block starts at this address.
    #[error("no live object at {0:#x}")]
    UnknownBlock(usize),
    /// A new claimed size does not fit the block.
    #[error("{size} bytes do not fit a block of {usable} usable bytes")]
    ExceedsBlock {
        /// Claimed size.
        size: usize,
        /// Usable block size.
        usable: usize,
    },
}

/// Result type for heap operations.
pub type Result<T> = std::result::Result<T, HeapError>;
