//! I/O windowing for the block-device proxy's backing stores.
//!
//! - [`PartialPipeline`] presents a byte range (a partition) of a stream as
//!   its own zero-based, offset-addressed window.
//! - [`MmapPipeline`] is a read-only memory-mapped alternative to seek-based
//!   file access for backing stores opened without write support.

pub mod mmap;
pub mod partial;

pub use mmap::MmapPipeline;
pub use partial::PartialPipeline;
