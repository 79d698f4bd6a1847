//! Shared-memory management for Tandem.
//!
//! One instance owns one [`Arena`]: a named POSIX shared-memory object with a
//! bump allocator on top. The arena is the only data channel between the host
//! and the stub process; both sides attach the same object by name and
//! exchange byte offsets rather than pointers.
//!
//! # Architecture
//!
//! - [`SharedMemoryRegion`]: the raw named object. Grows with `ftruncate`;
//!   every widening keeps the previous mappings alive so resolved pointers
//!   stay valid for the region's lifetime.
//! - [`Arena`]: header + bump allocator with a shared watermark, typed record
//!   access, and a watermark reset for per-batch recycling.

mod arena;
mod shm;

pub use arena::{Arena, ShmRecord, DEFAULT_BYTE_SIZE, DEFAULT_GROWTH_BYTE_SIZE, MIN_DEFAULT_BYTE_SIZE};
pub use shm::SharedMemoryRegion;
