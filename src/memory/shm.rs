//! Named POSIX shared-memory objects with on-demand growth.
//!
//! A region is identified by a stable name (`/<instance>_<kind>_<device>`)
//! so an unrelated process can attach it knowing nothing but the name. The
//! creator owns the object and unlinks it on drop.

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm;
use std::ptr::NonNull;
use std::sync::Mutex;

struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

/// A named shared-memory object mapped into this process.
///
/// Growth never relocates live data: widening the region maps an additional
/// full-size view and keeps the old views mapped, so any pointer previously
/// resolved through [`SharedMemoryRegion::resolve`] stays valid until the
/// region is dropped.
pub struct SharedMemoryRegion {
    fd: OwnedFd,
    name: String,
    owner: bool,
    mappings: Mutex<Vec<Mapping>>,
}

impl SharedMemoryRegion {
    /// Create a fresh region of `size` bytes, removing any leftover object
    /// with the same name first.
    pub fn create(name: &str, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::Arena("region size must be greater than zero".into()));
        }

        // A leftover object from a previous generation would alias ours.
        let _ = shm::unlink(name);

        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| Error::Arena(format!("failed to create shared memory region {name}: {e}")))?;

        rustix::fs::ftruncate(&fd, size)
            .map_err(|e| Error::Arena(format!("failed to size shared memory region {name}: {e}")))?;

        let region = Self {
            fd,
            name: name.to_string(),
            owner: true,
            mappings: Mutex::new(Vec::new()),
        };
        region.map_view(size as usize)?;
        Ok(region)
    }

    /// Attach an existing region created by another process.
    pub fn attach(name: &str) -> Result<Self> {
        let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty())
            .map_err(|e| Error::Arena(format!("failed to open shared memory region {name}: {e}")))?;

        let len = rustix::fs::fstat(&fd)
            .map_err(|e| Error::Arena(format!("failed to stat shared memory region {name}: {e}")))?
            .st_size;
        if len <= 0 {
            return Err(Error::Arena(format!("shared memory region {name} is empty")));
        }

        let region = Self {
            fd,
            name: name.to_string(),
            owner: false,
            mappings: Mutex::new(Vec::new()),
        };
        region.map_view(len as usize)?;
        Ok(region)
    }

    fn map_view(&self, len: usize) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &self.fd,
                0,
            )
        }
        .map_err(|e| Error::Arena(format!("failed to map shared memory region {}: {e}", self.name)))?;

        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Arena("mmap returned null".into()))?;

        self.mappings.lock().expect("mapping list poisoned").push(Mapping { base, len });
        Ok(base)
    }

    /// Length of the widest view this process currently holds.
    pub fn mapped_len(&self) -> usize {
        self.mappings
            .lock()
            .expect("mapping list poisoned")
            .last()
            .map(|m| m.len)
            .unwrap_or(0)
    }

    /// Base address of the widest view.
    pub fn base(&self) -> NonNull<u8> {
        let maps = self.mappings.lock().expect("mapping list poisoned");
        maps.last().expect("region always holds one mapping").base
    }

    /// Extend the backing object to `new_len` bytes and map a fresh view.
    pub fn grow(&self, new_len: u64) -> Result<()> {
        rustix::fs::ftruncate(&self.fd, new_len).map_err(|e| {
            Error::Arena(format!("failed to grow shared memory region {}: {e}", self.name))
        })?;
        self.map_view(new_len as usize)?;
        Ok(())
    }

    /// Widen this process's view to `len` bytes without resizing the object.
    ///
    /// Used by a reader after the peer grew the region.
    pub fn refresh(&self, len: u64) -> Result<()> {
        if len as usize > self.mapped_len() {
            self.map_view(len as usize)?;
        }
        Ok(())
    }

    /// Resolve `offset..offset + size` to a pointer, or `None` when the range
    /// is outside the current view.
    pub fn resolve(&self, offset: u64, size: u64) -> Option<NonNull<u8>> {
        let maps = self.mappings.lock().expect("mapping list poisoned");
        let mapping = maps.last()?;
        let end = offset.checked_add(size)?;
        if end > mapping.len as u64 {
            return None;
        }
        // SAFETY: offset + size is within the mapping checked above.
        NonNull::new(unsafe { mapping.base.as_ptr().add(offset as usize) })
    }

    /// Name of the backing object.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        let maps = self.mappings.get_mut().expect("mapping list poisoned");
        for mapping in maps.drain(..) {
            // SAFETY: each mapping was created by mmap with this length and
            // nothing else unmaps it.
            unsafe {
                let _ = rustix::mm::munmap(mapping.base.as_ptr().cast(), mapping.len);
            }
        }
        if self.owner {
            let _ = shm::unlink(&self.name);
        }
    }
}

// SAFETY: SharedMemoryRegion is Send + Sync because:
// - The mapping list is protected by a mutex
// - The fd is kernel-reference-counted
// - The mapped memory is shared by design; access discipline is the
//   caller's contract, exactly as with the memory it describes
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_name(tag: &str) -> String {
        format!("/tandem_shm_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_create_and_write() {
        let name = region_name("create");
        let region = SharedMemoryRegion::create(&name, 4096).unwrap();
        assert_eq!(region.mapped_len(), 4096);
        assert_eq!(region.name(), name);

        let ptr = region.resolve(0, 4096).unwrap();
        unsafe {
            std::ptr::write(ptr.as_ptr(), 42);
            std::ptr::write(ptr.as_ptr().add(4095), 99);
        }
        assert!(region.resolve(4096, 1).is_none());
    }

    #[test]
    fn test_zero_size_fails() {
        assert!(SharedMemoryRegion::create(&region_name("zero"), 0).is_err());
    }

    #[test]
    fn test_attach_sees_writes() {
        let name = region_name("attach");
        let writer = SharedMemoryRegion::create(&name, 4096).unwrap();
        let reader = SharedMemoryRegion::attach(&name).unwrap();

        unsafe {
            std::ptr::write(writer.resolve(100, 1).unwrap().as_ptr(), 123);
        }
        unsafe {
            assert_eq!(std::ptr::read(reader.resolve(100, 1).unwrap().as_ptr()), 123);
        }
    }

    #[test]
    fn test_attach_missing_fails() {
        assert!(SharedMemoryRegion::attach(&region_name("missing")).is_err());
    }

    #[test]
    fn test_grow_keeps_old_pointers_valid() {
        let name = region_name("grow");
        let region = SharedMemoryRegion::create(&name, 4096).unwrap();

        let old = region.resolve(10, 1).unwrap();
        unsafe { std::ptr::write(old.as_ptr(), 7) };

        region.grow(4096 * 4).unwrap();
        assert_eq!(region.mapped_len(), 4096 * 4);

        // The pre-growth pointer still reads the same byte.
        unsafe { assert_eq!(std::ptr::read(old.as_ptr()), 7) };
        // And the new view sees it too.
        unsafe {
            assert_eq!(std::ptr::read(region.resolve(10, 1).unwrap().as_ptr()), 7);
        }
    }

    #[test]
    fn test_refresh_after_peer_growth() {
        let name = region_name("refresh");
        let writer = SharedMemoryRegion::create(&name, 4096).unwrap();
        let reader = SharedMemoryRegion::attach(&name).unwrap();

        writer.grow(8192).unwrap();
        unsafe { std::ptr::write(writer.resolve(6000, 1).unwrap().as_ptr(), 55) };

        assert!(reader.resolve(6000, 1).is_none());
        reader.refresh(8192).unwrap();
        unsafe {
            assert_eq!(std::ptr::read(reader.resolve(6000, 1).unwrap().as_ptr()), 55);
        }
    }

    #[test]
    fn test_create_replaces_stale_object() {
        let name = region_name("stale");
        let first = SharedMemoryRegion::create(&name, 4096).unwrap();
        drop(first);
        let second = SharedMemoryRegion::create(&name, 8192).unwrap();
        assert_eq!(second.mapped_len(), 8192);
    }
}
