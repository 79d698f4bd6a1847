//! Bump-allocated arena over a shared-memory region.
//!
//! The arena is the data plane between the host and its stub: every request
//! batch, response batch, tensor and string lives at an offset inside it.
//! The allocation frontier (watermark) is stored in the region header so both
//! processes share one allocator; only the host ever retreats it, at batch
//! boundaries, to recycle per-batch storage.
//!
//! # Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ ArenaHeader (magic, capacity, watermark, growth, offsets)  │
//! ├────────────────────────────────────────────────────────────┤
//! │ RendezvousBlock / IpcMessage (allocated once at setup)     │
//! ├────────────────────────────────────────────────────────────┤
//! │ Per-batch records, recycled by watermark reset             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Growth appends capacity and never relocates live data; the new capacity is
//! published through the header so the peer can widen its own view before
//! reading past the old bound.

use super::shm::SharedMemoryRegion;
use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest default region size the runtime accepts.
pub const MIN_DEFAULT_BYTE_SIZE: u64 = 4 * 1024 * 1024;

/// Default region size.
pub const DEFAULT_BYTE_SIZE: u64 = 64 * 1024 * 1024;

/// Default growth step.
pub const DEFAULT_GROWTH_BYTE_SIZE: u64 = 64 * 1024 * 1024;

const ARENA_MAGIC: u32 = 0x544e_444d; // "TNDM"
const ALLOC_ALIGN: u64 = 16;

#[repr(C)]
struct ArenaHeader {
    magic: u32,
    _pad: u32,
    capacity: AtomicU64,
    watermark: AtomicU64,
    growth: AtomicU64,
    rendezvous: AtomicU64,
    ipc_message: AtomicU64,
}

const HEADER_SIZE: u64 = std::mem::size_of::<ArenaHeader>() as u64;

const fn align_up(value: u64) -> u64 {
    (value + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

/// Marker for plain-old-data records that may live in the arena.
///
/// # Safety
///
/// Implementors must be `repr(C)`, contain no pointers or other
/// address-space-local state, and be valid for every bit pattern including
/// all zeroes. Records are read by another process that shares nothing but
/// the bytes.
pub unsafe trait ShmRecord: Sized {}

// Offsets and dimension arrays are stored as bare integer slices.
unsafe impl ShmRecord for u64 {}
unsafe impl ShmRecord for i64 {}

/// A growable bump allocator inside a shared-memory region.
pub struct Arena {
    region: SharedMemoryRegion,
    header: NonNull<ArenaHeader>,
}

impl Arena {
    /// Create a fresh arena. Truncates any previous object of the same name.
    pub fn create(name: &str, default_size: u64, growth_size: u64) -> Result<Self> {
        if default_size < MIN_DEFAULT_BYTE_SIZE {
            return Err(Error::Arena(format!(
                "arena default size {default_size} is smaller than the {MIN_DEFAULT_BYTE_SIZE}-byte minimum"
            )));
        }
        if growth_size == 0 {
            return Err(Error::Arena("arena growth size must be greater than zero".into()));
        }

        let region = SharedMemoryRegion::create(name, default_size)?;
        let header = region.base().cast::<ArenaHeader>();
        // SAFETY: the region is at least MIN_DEFAULT_BYTE_SIZE bytes, freshly
        // created and owned by us; nothing else references it yet.
        unsafe {
            header.as_ptr().write(ArenaHeader {
                magic: ARENA_MAGIC,
                _pad: 0,
                capacity: AtomicU64::new(default_size),
                watermark: AtomicU64::new(align_up(HEADER_SIZE)),
                growth: AtomicU64::new(growth_size),
                rendezvous: AtomicU64::new(0),
                ipc_message: AtomicU64::new(0),
            });
        }
        Ok(Self { region, header })
    }

    /// Attach an arena created by another process.
    pub fn attach(name: &str) -> Result<Self> {
        let region = SharedMemoryRegion::attach(name)?;
        if (region.mapped_len() as u64) < HEADER_SIZE {
            return Err(Error::Arena(format!("region {name} is too small to hold an arena header")));
        }
        let header = region.base().cast::<ArenaHeader>();
        // SAFETY: the region is at least HEADER_SIZE bytes and the header is
        // written before the creator publishes the region name.
        let magic = unsafe { header.as_ref().magic };
        if magic != ARENA_MAGIC {
            return Err(Error::Arena(format!("region {name} does not carry an arena header")));
        }
        Ok(Self { region, header })
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: the header lives in the first mapping, which is never
        // unmapped before the arena is dropped.
        unsafe { self.header.as_ref() }
    }

    /// Current capacity of the backing region.
    pub fn capacity(&self) -> u64 {
        self.header().capacity.load(Ordering::Acquire)
    }

    /// Current allocation frontier.
    pub fn watermark(&self) -> u64 {
        self.header().watermark.load(Ordering::Acquire)
    }

    /// Growth step applied when an allocation does not fit.
    pub fn growth_step(&self) -> u64 {
        self.header().growth.load(Ordering::Relaxed)
    }

    /// Retreat the watermark to a previously recorded value.
    ///
    /// The caller must not retreat below the allocation of any still-live
    /// record; the rendezvous block is allocated first and therefore always
    /// survives.
    pub fn set_watermark(&self, offset: u64) {
        debug_assert!(offset >= align_up(HEADER_SIZE));
        self.header().watermark.store(offset, Ordering::Release);
    }

    /// Name of the backing region.
    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub(crate) fn set_rendezvous_offsets(&self, block: u64, ipc_message: u64) {
        self.header().rendezvous.store(block, Ordering::Release);
        self.header().ipc_message.store(ipc_message, Ordering::Release);
    }

    pub(crate) fn rendezvous_offsets(&self) -> (u64, u64) {
        (
            self.header().rendezvous.load(Ordering::Acquire),
            self.header().ipc_message.load(Ordering::Acquire),
        )
    }

    /// Reserve `size` bytes at the watermark, growing the region if needed.
    ///
    /// Returns the mapped pointer and the stable offset of the reservation.
    pub fn map(&self, size: u64) -> Result<(NonNull<u8>, u64)> {
        let offset = align_up(self.watermark());
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::Arena("allocation size overflows the arena".into()))?;

        let mut capacity = self.capacity();
        while end > capacity {
            let step = self.growth_step().max(end - capacity);
            capacity = capacity
                .checked_add(step)
                .ok_or_else(|| Error::Arena("arena capacity overflow during growth".into()))?;
            self.region.grow(capacity)?;
            self.header().capacity.store(capacity, Ordering::Release);
        }

        self.ensure_mapped(end)?;
        self.header().watermark.store(end, Ordering::Release);

        let ptr = self
            .region
            .resolve(offset, size)
            .ok_or_else(|| Error::Arena(format!("failed to resolve fresh allocation at offset {offset}")))?;
        Ok((ptr, offset))
    }

    /// Resolve a previously allocated offset, widening the local view when
    /// the peer grew the region.
    pub fn map_offset(&self, offset: u64, size: u64) -> Result<NonNull<u8>> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::Arena(format!("offset {offset} + size {size} overflows")))?;
        self.ensure_mapped(end)?;
        self.region.resolve(offset, size).ok_or_else(|| {
            Error::Arena(format!("offset {offset} + size {size} is outside the arena"))
        })
    }

    fn ensure_mapped(&self, end: u64) -> Result<()> {
        if end <= self.region.mapped_len() as u64 {
            return Ok(());
        }
        let capacity = self.capacity();
        if end > capacity {
            return Err(Error::Arena(format!(
                "offset {end} is beyond the arena capacity {capacity}"
            )));
        }
        self.region.refresh(capacity)
    }

    /// Allocate one zeroed record.
    #[allow(clippy::mut_from_ref)] // shared-memory records are interior-mutable by design
    pub fn alloc_record<T: ShmRecord>(&self) -> Result<(u64, &mut T)> {
        let (ptr, offset) = self.map(std::mem::size_of::<T>() as u64)?;
        let ptr = ptr.cast::<T>();
        // SAFETY: the reservation is size_of::<T>() bytes, ALLOC_ALIGN-aligned
        // (>= align_of::<T>() for ShmRecord types), and zero is a valid T.
        unsafe {
            ptr.as_ptr().write_bytes(0, 1);
            Ok((offset, &mut *ptr.as_ptr()))
        }
    }

    /// Allocate a zeroed array of records.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_records<T: ShmRecord>(&self, count: usize) -> Result<(u64, &mut [T])> {
        let bytes = (std::mem::size_of::<T>() as u64)
            .checked_mul(count as u64)
            .ok_or_else(|| Error::Arena("record array size overflow".into()))?;
        let (ptr, offset) = self.map(bytes)?;
        let ptr = ptr.cast::<T>();
        // SAFETY: as in alloc_record, for `count` consecutive records.
        unsafe {
            ptr.as_ptr().write_bytes(0, count);
            Ok((offset, std::slice::from_raw_parts_mut(ptr.as_ptr(), count)))
        }
    }

    /// Read a record at a previously allocated offset.
    pub fn record_at<T: ShmRecord>(&self, offset: u64) -> Result<&T> {
        self.check_align::<T>(offset)?;
        let ptr = self.map_offset(offset, std::mem::size_of::<T>() as u64)?;
        // SAFETY: bounds and alignment checked; any bit pattern is a valid T.
        Ok(unsafe { &*ptr.cast::<T>().as_ptr() })
    }

    /// Mutable access to a record at a previously allocated offset.
    #[allow(clippy::mut_from_ref)]
    pub fn record_at_mut<T: ShmRecord>(&self, offset: u64) -> Result<&mut T> {
        self.check_align::<T>(offset)?;
        let ptr = self.map_offset(offset, std::mem::size_of::<T>() as u64)?;
        // SAFETY: bounds and alignment checked; callers hold at most one
        // mutable view per offset, per the allocation protocol.
        Ok(unsafe { &mut *ptr.cast::<T>().as_ptr() })
    }

    /// Read an array of records at a previously allocated offset.
    pub fn records_at<T: ShmRecord>(&self, offset: u64, count: usize) -> Result<&[T]> {
        self.check_align::<T>(offset)?;
        let bytes = (std::mem::size_of::<T>() as u64)
            .checked_mul(count as u64)
            .ok_or_else(|| Error::Arena("record array size overflow".into()))?;
        let ptr = self.map_offset(offset, bytes)?;
        // SAFETY: bounds and alignment checked.
        Ok(unsafe { std::slice::from_raw_parts(ptr.cast::<T>().as_ptr(), count) })
    }

    /// Read raw bytes at a previously allocated offset.
    pub fn bytes_at(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let ptr = self.map_offset(offset, len)?;
        // SAFETY: bounds checked.
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len as usize) })
    }

    /// Mutable raw bytes at a previously allocated offset.
    #[allow(clippy::mut_from_ref)]
    pub fn bytes_at_mut(&self, offset: u64, len: u64) -> Result<&mut [u8]> {
        let ptr = self.map_offset(offset, len)?;
        // SAFETY: bounds checked; aliasing discipline is the caller's.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len as usize) })
    }

    fn check_align<T>(&self, offset: u64) -> Result<()> {
        let align = std::mem::align_of::<T>() as u64;
        if offset % align != 0 {
            return Err(Error::Arena(format!(
                "offset {offset} is not aligned for a {}-byte-aligned record",
                align
            )));
        }
        Ok(())
    }
}

// SAFETY: the region is Send + Sync and the header is plain atomics.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_name(tag: &str) -> String {
        format!("/tandem_arena_{}_{}", tag, std::process::id())
    }

    fn small_arena(tag: &str) -> Arena {
        Arena::create(&arena_name(tag), MIN_DEFAULT_BYTE_SIZE, 1024 * 1024).unwrap()
    }

    #[test]
    fn test_create_validates_sizes() {
        assert!(Arena::create(&arena_name("tiny"), 1024, 1024).is_err());
        assert!(Arena::create(&arena_name("nogrow"), MIN_DEFAULT_BYTE_SIZE, 0).is_err());
    }

    #[test]
    fn test_map_is_aligned_and_monotonic() {
        let arena = small_arena("align");
        let (_, a) = arena.map(3).unwrap();
        let (_, b) = arena.map(5).unwrap();
        let (_, c) = arena.map(1).unwrap();

        assert_eq!(a % ALLOC_ALIGN, 0);
        assert_eq!(b % ALLOC_ALIGN, 0);
        assert_eq!(c % ALLOC_ALIGN, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_map_offset_round_trip() {
        let arena = small_arena("round");
        let (ptr, offset) = arena.map(64).unwrap();
        unsafe { std::ptr::write(ptr.as_ptr(), 0xAB) };

        let again = arena.map_offset(offset, 64).unwrap();
        unsafe { assert_eq!(std::ptr::read(again.as_ptr()), 0xAB) };
    }

    #[test]
    fn test_map_offset_out_of_range() {
        let arena = small_arena("range");
        assert!(arena.map_offset(arena.capacity(), 1).is_err());
        assert!(arena.map_offset(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_growth_extends_capacity() {
        let arena = small_arena("grow");
        let before = arena.capacity();

        // Larger than the whole default region: must grow by at least the
        // requested amount even though it exceeds the growth step.
        let (_, offset) = arena.map(MIN_DEFAULT_BYTE_SIZE + 512).unwrap();
        assert!(arena.capacity() >= offset + MIN_DEFAULT_BYTE_SIZE + 512);
        assert!(arena.capacity() > before);
    }

    #[test]
    fn test_growth_visible_to_attached_reader() {
        let name = arena_name("peer");
        let writer = Arena::create(&name, MIN_DEFAULT_BYTE_SIZE, 1024 * 1024).unwrap();
        let reader = Arena::attach(&name).unwrap();

        let (ptr, offset) = writer.map(MIN_DEFAULT_BYTE_SIZE).unwrap();
        unsafe { std::ptr::write(ptr.as_ptr(), 0x5A) };

        // The reader's view predates the growth; map_offset widens it.
        let seen = reader.map_offset(offset, 1).unwrap();
        unsafe { assert_eq!(std::ptr::read(seen.as_ptr()), 0x5A) };
        assert_eq!(reader.capacity(), writer.capacity());
    }

    #[test]
    fn test_watermark_reset_recycles_space() {
        let arena = small_arena("reset");
        let mark = arena.watermark();

        let (_, first) = arena.map(128).unwrap();
        arena.set_watermark(mark);
        let (_, second) = arena.map(128).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_watermark_reset_preserves_live_allocations() {
        let arena = small_arena("live");

        // Live records allocated before the per-batch mark.
        let mut live = Vec::new();
        for i in 0..8u64 {
            let (_, offset) = arena.map(32 + i * 8).unwrap();
            live.push((offset, 32 + i * 8));
        }
        let mark = arena.watermark();

        for round in 0..16u64 {
            let mut batch = Vec::new();
            for i in 0..8u64 {
                let (_, offset) = arena.map(16 + ((round + i) % 5) * 24).unwrap();
                batch.push((offset, 16 + ((round + i) % 5) * 24));
            }
            for (offset, size) in &batch {
                for (live_offset, live_size) in &live {
                    let disjoint = offset + size <= *live_offset || live_offset + live_size <= *offset;
                    assert!(disjoint, "batch allocation overlaps a live record");
                }
                assert!(*offset >= mark);
            }
            arena.set_watermark(mark);
        }
    }

    #[test]
    fn test_attach_rejects_foreign_region() {
        let name = arena_name("foreign");
        let _plain = SharedMemoryRegion::create(&name, MIN_DEFAULT_BYTE_SIZE).unwrap();
        assert!(Arena::attach(&name).is_err());
    }

    #[test]
    fn test_record_allocation_and_access() {
        let arena = small_arena("records");

        let (offset, values) = arena.alloc_records::<u64>(4).unwrap();
        values.copy_from_slice(&[1, 2, 3, 4]);

        let read = arena.records_at::<u64>(offset, 4).unwrap();
        assert_eq!(read, &[1, 2, 3, 4]);

        assert!(arena.record_at::<u64>(offset + 1).is_err());
    }

    #[test]
    fn test_shared_watermark_across_handles() {
        let name = arena_name("shared_wm");
        let a = Arena::create(&name, MIN_DEFAULT_BYTE_SIZE, 1024 * 1024).unwrap();
        let b = Arena::attach(&name).unwrap();

        let (_, first) = a.map(64).unwrap();
        let (_, second) = b.map(64).unwrap();
        assert!(second >= first + 64);
    }
}
